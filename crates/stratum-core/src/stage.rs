//! File staging: asynchronous copies of named local files to remote paths.
//!
//! Application ranks enqueue requests and poll their status. With a head
//! process the transfer runs there, concurrently with checkpoint
//! post-processing; without one it degrades to an inline copy.

use std::fs;
use std::path::{Path, PathBuf};

use stratum_error::{Result, StratumError};
use stratum_types::StageState;
use tracing::{debug, warn};

/// Upper bound on live staging requests per rank.
pub const SI_MAX_NUM: usize = 512 * 1024;

/// Handle to one staging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageId(pub u32);

/// Per-rank request table.
#[derive(Debug, Default)]
pub struct StageTable {
    states: Vec<StageState>,
}

impl StageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request slot as pending.
    pub fn allocate(&mut self) -> Result<StageId> {
        if self.states.len() >= SI_MAX_NUM {
            return Err(StratumError::OutOfRange {
                what: "staging request count".to_owned(),
                value: self.states.len().to_string(),
            });
        }
        self.states.push(StageState::Pending);
        Ok(StageId(self.states.len() as u32 - 1))
    }

    /// Update a slot from a completion message.
    pub fn update(&mut self, id: StageId, state: StageState) {
        if let Some(slot) = self.states.get_mut(id.0 as usize) {
            *slot = state;
        } else {
            warn!(id = id.0, "status update for unknown staging request");
        }
    }

    /// Current state of a request; `NotInitialized` for unknown ids.
    #[must_use]
    pub fn status(&self, id: StageId) -> StageState {
        self.states
            .get(id.0 as usize)
            .copied()
            .unwrap_or(StageState::NotInitialized)
    }

    /// Number of allocated slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Perform one staging transfer: copy `local` to `remote`, creating parent
/// directories, and remove the source on success.
pub fn perform_stage(local: &Path, remote: &Path) -> Result<()> {
    if !local.is_file() {
        return Err(StratumError::FileMissing {
            path: local.to_path_buf(),
        });
    }
    if let Some(parent) = remote.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(local, remote)?;
    fs::remove_file(local)?;
    debug!(local = %local.display(), remote = %remote.display(), "staged file");
    Ok(())
}

/// Resolve a staging target under the configured stage directory when the
/// remote path is relative.
#[must_use]
pub fn resolve_remote(stage_dir: &Path, remote: &Path) -> PathBuf {
    if remote.is_absolute() {
        remote.to_path_buf()
    } else {
        stage_dir.join(remote)
    }
}
