//! Plain-text key=value sidecar records.
//!
//! Sidecars are the commit flag of a checkpoint level: the planner only
//! trusts a level when every rank's sidecar is present and consistent.
//! The restart record is the same format, holding the crash flag and the
//! execution id across runs.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use stratum_error::{Result, StratumError};
use stratum_types::{CkptId, VarId};

/// Per-rank, per-level checkpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelMeta {
    /// Checkpoint file path relative to the level's root directory
    /// (exec-local for L1-L3, exec-global for L4).
    pub ckpt_file: String,
    /// Cycle this sidecar commits.
    pub ckpt_id: CkptId,
    /// File size in bytes.
    pub fs: u64,
    /// Padded maximum file size across the group (L3).
    pub max_fs: u64,
    /// Partner copy size stored on this rank (L2).
    pub pfs: u64,
    /// Hex MD5 of the checkpoint file.
    pub checksum: String,
    /// Hex MD5 of the stored partner copy (L2).
    pub ptner_checksum: Option<String>,
    /// Hex MD5 of the parity fragment held by this rank (L3).
    pub rs_checksum: Option<String>,
    /// `(id, size)` of every recorded variable, in write order.
    pub vars: Vec<(VarId, u64)>,
}

impl LevelMeta {
    /// Serialize as `key=value` lines.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ckpt_file={}", self.ckpt_file);
        let _ = writeln!(out, "ckpt_id={}", self.ckpt_id);
        let _ = writeln!(out, "fs={}", self.fs);
        let _ = writeln!(out, "maxFs={}", self.max_fs);
        let _ = writeln!(out, "pfs={}", self.pfs);
        let _ = writeln!(out, "nbVar={}", self.vars.len());
        for (index, (id, size)) in self.vars.iter().enumerate() {
            let _ = writeln!(out, "varID_{index}={id}");
            let _ = writeln!(out, "varSize_{index}={size}");
        }
        let _ = writeln!(out, "checksum={}", self.checksum);
        if let Some(ptner) = &self.ptner_checksum {
            let _ = writeln!(out, "ptner_checksum={ptner}");
        }
        if let Some(rs) = &self.rs_checksum {
            let _ = writeln!(out, "rs_checksum={rs}");
        }
        out
    }

    /// Parse `key=value` lines.
    pub fn from_text(text: &str) -> Result<Self> {
        let lookup = parse_pairs(text);
        let get = |key: &str| -> Result<&str> {
            lookup
                .iter()
                .find(|(k, _)| *k == key)
                .map(|&(_, v)| v)
                .ok_or_else(|| StratumError::FormatCorrupt {
                    detail: format!("sidecar is missing key '{key}'"),
                })
        };
        let parse_u64 = |key: &str| -> Result<u64> {
            get(key)?.parse().map_err(|_| StratumError::FormatCorrupt {
                detail: format!("sidecar key '{key}' is not a number"),
            })
        };

        let nb_var = parse_u64("nbVar")? as usize;
        let mut vars = Vec::with_capacity(nb_var);
        for index in 0..nb_var {
            let id = parse_u64(&format!("varID_{index}"))? as u32;
            let size = parse_u64(&format!("varSize_{index}"))?;
            vars.push((VarId(id), size));
        }

        Ok(Self {
            ckpt_file: get("ckpt_file")?.to_owned(),
            ckpt_id: parse_u64("ckpt_id")? as u32,
            fs: parse_u64("fs")?,
            max_fs: parse_u64("maxFs")?,
            pfs: parse_u64("pfs")?,
            checksum: get("checksum")?.to_owned(),
            ptner_checksum: get("ptner_checksum").ok().map(str::to_owned),
            rs_checksum: get("rs_checksum").ok().map(str::to_owned),
            vars,
        })
    }

    /// Write to `path`, replacing any previous sidecar.
    pub fn store(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Load and parse the sidecar at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|_| StratumError::FileMissing {
            path: path.to_path_buf(),
        })?;
        Self::from_text(&text)
    }
}

/// Crash flag and execution id persisted across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRecord {
    /// True while an execution is in flight or crashed; cleared by a clean
    /// finalize (unless the last checkpoint is kept for a warm restart).
    pub failure: bool,
    pub exec_id: String,
}

impl RestartRecord {
    pub fn store(&self, path: &Path) -> Result<()> {
        fs::write(
            path,
            format!("failure={}\nexec_id={}\n", u8::from(self.failure), self.exec_id),
        )?;
        Ok(())
    }

    /// Load the record; `None` when no previous execution left one.
    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        let pairs = parse_pairs(&text);
        let failure = pairs.iter().find(|(k, _)| *k == "failure")?.1 == "1";
        let exec_id = pairs.iter().find(|(k, _)| *k == "exec_id")?.1.to_owned();
        Some(Self { failure, exec_id })
    }
}

fn parse_pairs(text: &str) -> Vec<(&str, &str)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once('=')
        })
        .collect()
}
