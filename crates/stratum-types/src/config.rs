//! Engine configuration and its validation/coercion rules.
//!
//! `validate` distinguishes two outcomes the same way the recovery planner
//! distinguishes levels: settings that make the run meaningless are hard
//! `ConfigInvalid` errors, settings that merely degrade a feature are coerced
//! to a safe default with a warning.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stratum_error::{Result, StratumError};
use tracing::warn;

/// Differential-checkpoint hash mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcpMode {
    /// 16-byte MD5 digest per block.
    Md5,
    /// 4-byte CRC32 digest per block.
    Crc32,
}

/// L4 writer strategy. Selection happens once, at writer construction;
/// the hot path never branches on this again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// One file per rank, written with plain file i/o and committed by rename.
    Posix,
    /// Collective parallel i/o into a shared file.
    ParallelIo,
    /// Parallel packaging format (many ranks per container file).
    Packaged,
    /// Structured self-describing output.
    Structured,
}

/// Smallest accepted dCP block size in bytes.
pub const DCP_BLOCK_SIZE_MIN: u32 = 512;
/// Largest accepted dCP block size in bytes.
pub const DCP_BLOCK_SIZE_MAX: u32 = u16::MAX as u32;

const BLOCK_SIZE_MIN: u32 = 1024;
const BLOCK_SIZE_MAX: u32 = 2048 * 1024;
const TRANSFER_SIZE_MIN: u32 = 8 * 1024 * 1024;
const TRANSFER_SIZE_MAX: u32 = 64 * 1024 * 1024;
const TRANSFER_SIZE_DEFAULT: u32 = 16 * 1024 * 1024;
const MAX_SYNC_INTERVAL_DEFAULT: u32 = 512;

/// Full engine configuration. Hosts deserialize this from whatever source
/// they like; the engine only ever sees the validated value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-local checkpoint directory (L1-L3 files).
    pub local_dir: PathBuf,
    /// Parallel-filesystem directory (L4 files).
    pub global_dir: PathBuf,
    /// Metadata directory (sidecar files, restart record).
    pub meta_dir: PathBuf,
    /// Target directory for staged files.
    pub stage_dir: PathBuf,

    /// Dedicated head processes per node (0 or 1).
    pub heads_per_node: u32,
    /// Processes per node.
    pub node_size: u32,
    /// Nodes per group; the unit of L2 pairing and L3 encoding.
    pub group_size: u32,

    /// Checkpoint interval in minutes per level; `None` disables scheduling.
    pub ckpt_interval: [Option<u32>; 4],
    /// dCP-flavored L4 interval in minutes.
    pub dcp_l4_interval: Option<u32>,
    /// Whether L2/L3/L4 post-processing runs on the application rank.
    /// L1 is always inline.
    pub inline_level: [bool; 4],

    /// Enable differential checkpointing for the container format.
    pub enable_dcp: bool,
    /// dCP digest mode.
    pub dcp_mode: DcpMode,
    /// dCP block size in bytes, `[512, 65535]`.
    pub dcp_block_size: u32,

    /// Enable the staging subsystem.
    pub enable_staging: bool,
    /// Heads return to user code after finalize instead of exiting.
    pub keep_heads_alive: bool,
    /// Archive the previous L4 set instead of deleting it.
    pub keep_l4: bool,
    /// Preserve the last checkpoint at finalize.
    pub keep_last_ckpt: bool,

    /// Point-to-point exchange block size in bytes, `[1 KiB, 2 MiB]`.
    pub block_size: u32,
    /// Local-to-PFS transfer chunk in bytes, coerced into `[8 MiB, 64 MiB]`.
    pub transfer_size: u32,
    /// Upper bound on iterations between snapshot resyncs; power of two.
    pub max_sync_interval: u32,

    /// Message tag for checkpoint requests.
    pub ckpt_tag: i32,
    /// Message tag for staging traffic.
    pub stage_tag: i32,
    /// Message tag for finalize traffic.
    pub final_tag: i32,
    /// Message tag for everything else.
    pub general_tag: i32,

    /// L4 writer strategy.
    pub io_mode: SerializerKind,
    /// Console verbosity, 1 (debug) to 3 (warnings only).
    pub verbosity: u8,
    /// Derive node ids from ranks instead of hostnames (single-host runs).
    pub local_test: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("./local"),
            global_dir: PathBuf::from("./global"),
            meta_dir: PathBuf::from("./meta"),
            stage_dir: PathBuf::from("./stage"),
            heads_per_node: 0,
            node_size: 1,
            group_size: 1,
            ckpt_interval: [None; 4],
            dcp_l4_interval: None,
            inline_level: [true; 4],
            enable_dcp: false,
            dcp_mode: DcpMode::Md5,
            dcp_block_size: 16 * 1024,
            enable_staging: false,
            keep_heads_alive: false,
            keep_l4: false,
            keep_last_ckpt: false,
            block_size: 1024 * 1024,
            transfer_size: TRANSFER_SIZE_DEFAULT,
            max_sync_interval: MAX_SYNC_INTERVAL_DEFAULT,
            ckpt_tag: 711,
            stage_tag: 406,
            final_tag: 3107,
            general_tag: 2612,
            io_mode: SerializerKind::Posix,
            verbosity: 2,
            local_test: true,
        }
    }
}

impl Config {
    /// Whether a level has interval scheduling enabled.
    #[must_use]
    pub fn level_scheduled(&self, index: usize) -> bool {
        self.ckpt_interval[index].is_some_and(|minutes| minutes > 0)
    }

    /// Validate rank-independent settings, coercing recoverable ones.
    ///
    /// Topology-dependent rules (divisibility, group-size bounds) live in
    /// [`crate::Topology::derive`], which sees the rank count.
    pub fn validate(&mut self) -> Result<()> {
        if self.heads_per_node > 1 {
            return Err(StratumError::config(format!(
                "heads_per_node must be 0 or 1, got {}",
                self.heads_per_node
            )));
        }
        if self.node_size == 0 {
            return Err(StratumError::config("node_size must be at least 1"));
        }
        if self.node_size <= self.heads_per_node {
            return Err(StratumError::config(format!(
                "node_size {} leaves no application ranks after {} head(s)",
                self.node_size, self.heads_per_node
            )));
        }
        if self.keep_heads_alive && self.heads_per_node == 0 {
            return Err(StratumError::config(
                "keep_heads_alive requires a dedicated head process",
            ));
        }
        if !(1..=3).contains(&self.verbosity) {
            return Err(StratumError::config(format!(
                "verbosity must be 1, 2 or 3, got {}",
                self.verbosity
            )));
        }
        if !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&self.block_size) {
            return Err(StratumError::config(format!(
                "block_size must be between {BLOCK_SIZE_MIN} and {BLOCK_SIZE_MAX} bytes, got {}",
                self.block_size
            )));
        }
        for index in 1..4 {
            if !self.inline_level[index] && self.heads_per_node != 1 {
                return Err(StratumError::config(format!(
                    "level {} is offloaded but no head process is configured",
                    index + 1
                )));
            }
        }
        self.inline_level[0] = true;

        if self.enable_dcp
            && !(DCP_BLOCK_SIZE_MIN..=DCP_BLOCK_SIZE_MAX).contains(&self.dcp_block_size)
        {
            warn!(
                dcp_block_size = self.dcp_block_size,
                "dCP block size must be between {DCP_BLOCK_SIZE_MIN} and {DCP_BLOCK_SIZE_MAX} \
                 bytes, dCP disabled"
            );
            self.enable_dcp = false;
        }
        if self.dcp_l4_interval.is_some() && !self.enable_dcp {
            warn!("dCP L4 interval set but dCP is disabled, setting ignored");
            self.dcp_l4_interval = None;
        }

        if !(TRANSFER_SIZE_MIN..=TRANSFER_SIZE_MAX).contains(&self.transfer_size) {
            warn!(
                transfer_size = self.transfer_size,
                "transfer size out of range, using {TRANSFER_SIZE_DEFAULT} bytes"
            );
            self.transfer_size = TRANSFER_SIZE_DEFAULT;
        }

        if self.max_sync_interval == 0 {
            self.max_sync_interval = MAX_SYNC_INTERVAL_DEFAULT;
        } else if !self.max_sync_interval.is_power_of_two() {
            let coerced = previous_power_of_two(self.max_sync_interval);
            warn!(
                requested = self.max_sync_interval,
                coerced, "max_sync_interval must be a power of two, using nearest lower value"
            );
            self.max_sync_interval = coerced;
        }

        if self.enable_staging && self.heads_per_node == 0 {
            warn!("staging enabled without a dedicated head, transfers run inline");
        }
        if self.io_mode != SerializerKind::Posix {
            warn!(
                io_mode = ?self.io_mode,
                "selected L4 serializer is not available in this build, using posix"
            );
            self.io_mode = SerializerKind::Posix;
        }
        Ok(())
    }
}

fn previous_power_of_two(value: u32) -> u32 {
    let mut check = 1_u32;
    while (check << 1) < value && (check << 1) > 0 {
        check <<= 1;
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let mut cfg = Config::default();
        cfg.validate().expect("defaults must be valid");
        assert!(cfg.inline_level[0]);
    }

    #[test]
    fn test_two_heads_rejected() {
        let mut cfg = Config {
            heads_per_node: 2,
            node_size: 4,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(StratumError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_keep_heads_alive_without_heads_rejected() {
        let mut cfg = Config {
            keep_heads_alive: true,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(StratumError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_offline_level_without_head_rejected() {
        let mut cfg = Config::default();
        cfg.inline_level[3] = false;
        assert!(matches!(
            cfg.validate(),
            Err(StratumError::ConfigInvalid { .. })
        ));

        let mut cfg = Config {
            heads_per_node: 1,
            node_size: 2,
            ..Config::default()
        };
        cfg.inline_level[3] = false;
        cfg.validate().expect("offline level with a head is fine");
    }

    #[test]
    fn test_dcp_block_size_out_of_range_disables_dcp() {
        let mut cfg = Config {
            enable_dcp: true,
            dcp_block_size: 128,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert!(!cfg.enable_dcp);

        let mut cfg = Config {
            enable_dcp: true,
            dcp_block_size: 100_000,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert!(!cfg.enable_dcp);
    }

    #[test]
    fn test_transfer_size_coerced_to_default() {
        let mut cfg = Config {
            transfer_size: 1024,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.transfer_size, TRANSFER_SIZE_DEFAULT);
    }

    #[test]
    fn test_block_size_bounds_are_hard_errors() {
        let mut cfg = Config {
            block_size: 512,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = Config {
            block_size: 4 * 1024 * 1024,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_max_sync_interval_rounds_down_to_power_of_two() {
        let mut cfg = Config {
            max_sync_interval: 600,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.max_sync_interval, 512);

        let mut cfg = Config {
            max_sync_interval: 0,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.max_sync_interval, 512);
    }

    #[test]
    fn test_non_posix_serializer_coerced() {
        let mut cfg = Config {
            io_mode: SerializerKind::Structured,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.io_mode, SerializerKind::Posix);
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.block_size, cfg.block_size);
        assert_eq!(back.io_mode, cfg.io_mode);
    }
}
