//! Directory layout of one execution.
//!
//! ```text
//! <local_dir>/<exec_id>/l1/<rank>-Ckpt<cid>.fti
//!                      /l2/... + Ptner-Rank<owner>.fti
//!                      /l3/... + <rank>-RSed<cid>.fti
//!                      /dCP/dCPFile-Rank<rank>.fti
//!                      /tmp/
//! <global_dir>/<exec_id>/l4/<rank>-Ckpt<cid>.fti
//!                       /l4_archive/<timestamp>/
//!                       /tmp/
//! <meta_dir>/<exec_id>/l{1..4}/<rank>.meta
//! <meta_dir>/restart
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use stratum_error::Result;
use stratum_types::{CkptId, Config, Level};

/// Resolved directories of the current execution.
#[derive(Debug, Clone)]
pub struct ExecPaths {
    /// `<local_dir>/<exec_id>`.
    pub local: PathBuf,
    /// `<global_dir>/<exec_id>`.
    pub global: PathBuf,
    /// `<meta_dir>/<exec_id>`.
    pub meta: PathBuf,
    /// Restart record, shared by every execution under this config.
    pub restart_record: PathBuf,
    /// Staging target directory.
    pub stage: PathBuf,
}

impl ExecPaths {
    /// Resolve the layout; creates nothing.
    #[must_use]
    pub fn resolve(cfg: &Config, exec_id: &str) -> Self {
        Self {
            local: cfg.local_dir.join(exec_id),
            global: cfg.global_dir.join(exec_id),
            meta: cfg.meta_dir.join(exec_id),
            restart_record: cfg.meta_dir.join("restart"),
            stage: cfg.stage_dir.clone(),
        }
    }

    /// Create every directory of the layout. Idempotent; safe to run on
    /// every rank concurrently.
    pub fn create_all(&self, keep_l4: bool) -> Result<()> {
        for level in Level::ALL {
            fs::create_dir_all(self.level_dir(level))?;
            fs::create_dir_all(self.meta_level_dir(level))?;
        }
        fs::create_dir_all(self.dcp_dir())?;
        fs::create_dir_all(self.local_tmp())?;
        fs::create_dir_all(self.global_tmp())?;
        if keep_l4 {
            fs::create_dir_all(self.archive_root())?;
        }
        Ok(())
    }

    /// Data directory of a level (`l1`-`l3` node-local, `l4` global).
    #[must_use]
    pub fn level_dir(&self, level: Level) -> PathBuf {
        match level {
            Level::L4 => self.global.join(level.dir_name()),
            local => self.local.join(local.dir_name()),
        }
    }

    /// Sidecar directory of a level.
    #[must_use]
    pub fn meta_level_dir(&self, level: Level) -> PathBuf {
        self.meta.join(level.dir_name())
    }

    /// Persistent differential-checkpoint directory.
    #[must_use]
    pub fn dcp_dir(&self) -> PathBuf {
        self.local.join("dCP")
    }

    /// Node-local scratch for atomic commits.
    #[must_use]
    pub fn local_tmp(&self) -> PathBuf {
        self.local.join("tmp")
    }

    /// Global scratch for atomic commits.
    #[must_use]
    pub fn global_tmp(&self) -> PathBuf {
        self.global.join("tmp")
    }

    /// Root of archived L4 sets.
    #[must_use]
    pub fn archive_root(&self) -> PathBuf {
        self.global.join("l4_archive")
    }

    /// Checkpoint container of `rank` for cycle `cid` at `level`.
    #[must_use]
    pub fn ckpt_file(&self, level: Level, rank: u32, cid: CkptId) -> PathBuf {
        self.level_dir(level).join(ckpt_file_name(rank, cid))
    }

    /// Partner copy held for `owner`.
    #[must_use]
    pub fn partner_file(&self, owner: u32) -> PathBuf {
        self.level_dir(Level::L2)
            .join(format!("Ptner-Rank{owner}.fti"))
    }

    /// Reed-Solomon parity fragment of `rank` for cycle `cid`.
    #[must_use]
    pub fn rs_file(&self, rank: u32, cid: CkptId) -> PathBuf {
        self.level_dir(Level::L3)
            .join(format!("{rank}-RSed{cid}.fti"))
    }

    /// Persistent dCP container of `rank`.
    #[must_use]
    pub fn dcp_file(&self, rank: u32) -> PathBuf {
        self.dcp_dir().join(format!("dCPFile-Rank{rank}.fti"))
    }

    /// Sidecar of `rank` at `level`; overwritten on every commit.
    #[must_use]
    pub fn sidecar_file(&self, level: Level, rank: u32) -> PathBuf {
        self.meta_level_dir(level).join(format!("{rank}.meta"))
    }

    /// Scratch name in the right tmp directory for a target file.
    #[must_use]
    pub fn tmp_for(&self, level: Level, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map_or_else(|| "scratch".into(), |name| name.to_os_string());
        match level {
            Level::L4 => self.global_tmp().join(name),
            _ => self.local_tmp().join(name),
        }
    }

    /// Archive directory for the previous L4 set, stamped by the caller.
    #[must_use]
    pub fn archive_dir(&self, stamp: &str) -> PathBuf {
        self.archive_root().join(stamp)
    }
}

/// `{rank}-Ckpt{cid}.fti`.
#[must_use]
pub fn ckpt_file_name(rank: u32, cid: CkptId) -> String {
    format!("{rank}-Ckpt{cid}.fti")
}
