//! Interval-driven checkpoint scheduling.
//!
//! Each level carries an interval in minutes. On every `snapshot` call the
//! scheduler compares the wall-clock minute counter against the intervals
//! and picks the most durable level that is due, so an L4 minute wins over
//! a simultaneous L1 minute.

use stratum_types::{Config, Level};

/// Pure scheduling state; the engine feeds it the elapsed minutes.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSched {
    last_fired_minute: [Option<u32>; 4],
}

impl SnapshotSched {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The level due at `minute`, if any. Levels are scanned most durable
    /// first; a level fires at most once per due minute.
    pub fn due(&mut self, cfg: &Config, minute: u32) -> Option<Level> {
        if minute == 0 {
            return None;
        }
        for level in Level::ALL.iter().rev() {
            let Some(interval) = cfg.ckpt_interval[level.index()] else {
                continue;
            };
            if interval == 0 || minute % interval != 0 {
                continue;
            }
            if self.last_fired_minute[level.index()] == Some(minute) {
                continue;
            }
            // Firing a higher level satisfies the lower ones for this
            // minute as well.
            for lower in Level::ALL {
                if lower <= *level && minute % cfg.ckpt_interval[lower.index()].unwrap_or(u32::MAX).max(1) == 0 {
                    self.last_fired_minute[lower.index()] = Some(minute);
                }
            }
            return Some(*level);
        }
        None
    }
}
