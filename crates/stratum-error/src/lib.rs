//! Error taxonomy shared by every stratum crate.
//!
//! Level encoders never surface these to the caller; they downgrade the
//! completed level and keep going. Hard failures are reserved for `init`,
//! `recover`, `finalize` and the iCP finalize step.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T, E = StratumError> = std::result::Result<T, E>;

/// All error kinds produced by the checkpoint engine.
#[derive(Debug, Error)]
pub enum StratumError {
    /// Topology or configuration inconsistency. Fatal at init.
    #[error("invalid configuration: {detail}")]
    ConfigInvalid { detail: String },

    /// Underlying filesystem or transport write failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A file exists but its digest does not match; treated as missing.
    #[error("checksum mismatch for {what}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        what: String,
        stored: String,
        computed: String,
    },

    /// Container bytes do not parse as a valid FTI-FF file.
    #[error("corrupt container: {detail}")]
    FormatCorrupt { detail: String },

    /// More erasures in a group than the code can repair.
    #[error("group cannot reconstruct: {missing} missing of {total} shards (tolerance {tolerance})")]
    GroupInsufficient {
        missing: usize,
        total: usize,
        tolerance: usize,
    },

    /// An incremental checkpoint omitted a previously committed variable.
    #[error("variable {id} was committed previously but not added to this checkpoint")]
    VariableMissing { id: u32 },

    /// `protect` called twice with the same id.
    #[error("variable id {id} is already protected")]
    IdReused { id: u32 },

    /// Operation referenced an id that was never protected.
    #[error("unknown variable id {id}")]
    UnknownVariable { id: u32 },

    /// The incremental checkpoint sequence was rolled back.
    #[error("incremental checkpoint aborted: {detail}")]
    IcpAborted { detail: String },

    /// No level can reconstruct all ranks.
    #[error("no checkpoint level can reconstruct all ranks")]
    Unrecoverable,

    /// A message-passing operation failed (peer gone, channel closed).
    #[error("communication failure: {detail}")]
    CommFailure { detail: String },

    /// A required file is absent.
    #[error("missing file: {path}")]
    FileMissing { path: PathBuf },

    /// A value fell outside its permitted range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: String, value: String },

    /// An operation arrived while another one held the engine.
    #[error("engine busy")]
    Busy,

    /// Invariant violation that indicates a bug in stratum itself.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl StratumError {
    /// Construct an [`StratumError::Internal`] from a message.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Construct a [`StratumError::ConfigInvalid`] from a message.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            detail: detail.into(),
        }
    }

    /// Whether recovery logic should treat the underlying file as absent.
    #[must_use]
    pub fn is_treated_as_missing(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::FormatCorrupt { .. } | Self::FileMissing { .. }
        )
    }
}
