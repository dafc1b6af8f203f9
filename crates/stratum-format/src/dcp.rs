//! Differential-checkpoint hash rows.
//!
//! Each variable chunk optionally carries one hash row per `block_size`
//! slice of its content. A row that was never written is invalid; a row
//! whose content changed since the previous committed checkpoint is dirty
//! and must be emitted. Dirty bits survive failed checkpoints so the next
//! attempt re-sends the same ranges.

use stratum_error::{Result, StratumError};
use stratum_types::DcpMode;
use stratum_types::config::{DCP_BLOCK_SIZE_MAX, DCP_BLOCK_SIZE_MIN};

use crate::{MD5_DIGEST_LEN, md5_digest};

/// Validated dCP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcpConfig {
    pub mode: DcpMode,
    pub block_size: u32,
}

impl DcpConfig {
    pub fn new(mode: DcpMode, block_size: u32) -> Result<Self> {
        if !(DCP_BLOCK_SIZE_MIN..=DCP_BLOCK_SIZE_MAX).contains(&block_size) {
            return Err(StratumError::OutOfRange {
                what: "dCP block size".to_owned(),
                value: block_size.to_string(),
            });
        }
        Ok(Self { mode, block_size })
    }
}

/// Digest of one dCP block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcpDigest {
    Md5([u8; MD5_DIGEST_LEN]),
    Crc32(u32),
}

impl DcpDigest {
    fn of(mode: DcpMode, bytes: &[u8]) -> Self {
        match mode {
            DcpMode::Md5 => Self::Md5(md5_digest(bytes)),
            DcpMode::Crc32 => Self::Crc32(crc32fast::hash(bytes)),
        }
    }
}

/// State of one dCP block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRow {
    pub digest: DcpDigest,
    /// Content differs from the previous committed checkpoint.
    pub dirty: bool,
    /// The row has been written at least once.
    pub valid: bool,
}

/// Per-chunk array of dCP hash rows plus the emission cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHashes {
    mode: DcpMode,
    block_size: u32,
    rows: Vec<HashRow>,
    cursor: usize,
}

impl DiffHashes {
    /// Allocate rows for a chunk of `chunk_size` bytes, all invalid.
    #[must_use]
    pub fn new(cfg: DcpConfig, chunk_size: u64) -> Self {
        let mut hashes = Self {
            mode: cfg.mode,
            block_size: cfg.block_size,
            rows: Vec::new(),
            cursor: 0,
        };
        hashes.resize(chunk_size);
        hashes
    }

    fn nb_hashes(&self, chunk_size: u64) -> usize {
        (chunk_size.div_ceil(u64::from(self.block_size))) as usize
    }

    /// Number of rows currently allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows flagged dirty.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.rows.iter().filter(|row| row.dirty).count()
    }

    /// Grow or shrink the row array after a chunk resize. New rows start
    /// invalid; truncated rows are dropped.
    pub fn resize(&mut self, chunk_size: u64) {
        let target = self.nb_hashes(chunk_size);
        if target > self.rows.len() {
            self.rows.resize(
                target,
                HashRow {
                    digest: DcpDigest::Crc32(0),
                    dirty: false,
                    valid: false,
                },
            );
        } else {
            self.rows.truncate(target);
        }
        self.cursor = self.cursor.min(self.rows.len());
    }

    /// Hash block `index` of `chunk` and update the stored row.
    ///
    /// Returns whether the block differs from the stored digest. The stored
    /// digest is replaced immediately; the dirty bit records that the block
    /// still needs to reach a committed file.
    pub fn compare(&mut self, index: usize, chunk: &[u8]) -> Result<bool> {
        let row = self
            .rows
            .get_mut(index)
            .ok_or_else(|| StratumError::internal(format!("dCP row {index} out of bounds")))?;
        let start = index * self.block_size as usize;
        let end = (start + self.block_size as usize).min(chunk.len());
        if start >= chunk.len() {
            return Err(StratumError::internal(format!(
                "dCP block {index} starts at {start}, beyond chunk of {} bytes",
                chunk.len()
            )));
        }
        let digest = DcpDigest::of(self.mode, &chunk[start..end]);
        let changed = !row.valid || row.digest != digest;
        if changed {
            row.digest = digest;
            row.dirty = true;
            row.valid = true;
        }
        Ok(changed)
    }

    /// Compare every block of `chunk` against the stored rows.
    pub fn scan(&mut self, chunk: &[u8]) -> Result<usize> {
        let mut changed = 0;
        for index in 0..self.rows.len() {
            if self.compare(index, chunk)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Restart the emission cursor for a new checkpoint cycle.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Next maximal run of contiguous dirty blocks at or after the cursor,
    /// as a `(byte offset, byte length)` range within the chunk. `None`
    /// means no further changes this cycle.
    pub fn next_changed_range(&mut self, chunk_size: u64) -> Option<(u64, u64)> {
        while self.cursor < self.rows.len() && !self.rows[self.cursor].dirty {
            self.cursor += 1;
        }
        if self.cursor >= self.rows.len() {
            return None;
        }
        let first = self.cursor;
        while self.cursor < self.rows.len() && self.rows[self.cursor].dirty {
            self.cursor += 1;
        }
        let offset = first as u64 * u64::from(self.block_size);
        let end = (self.cursor as u64 * u64::from(self.block_size)).min(chunk_size);
        Some((offset, end - offset))
    }

    /// Mark every row clean after a successful commit.
    pub fn clear_dirty(&mut self) {
        for row in &mut self.rows {
            row.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DcpConfig {
        DcpConfig::new(DcpMode::Md5, 512).unwrap()
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(DcpConfig::new(DcpMode::Md5, 511).is_err());
        assert!(DcpConfig::new(DcpMode::Md5, 512).is_ok());
        assert!(DcpConfig::new(DcpMode::Crc32, 65535).is_ok());
        assert!(DcpConfig::new(DcpMode::Crc32, 65536).is_err());
    }

    #[test]
    fn test_row_count_covers_partial_tail() {
        let hashes = DiffHashes::new(cfg(), 1024);
        assert_eq!(hashes.len(), 2);
        let hashes = DiffHashes::new(cfg(), 1025);
        assert_eq!(hashes.len(), 3);
        let hashes = DiffHashes::new(cfg(), 0);
        assert!(hashes.is_empty());
    }

    #[test]
    fn test_first_scan_marks_everything_dirty() {
        let chunk = vec![7_u8; 2048];
        let mut hashes = DiffHashes::new(cfg(), chunk.len() as u64);
        let changed = hashes.scan(&chunk).unwrap();
        assert_eq!(changed, 4);
        assert_eq!(hashes.dirty_count(), 4);
    }

    #[test]
    fn test_unchanged_rescan_stays_clean() {
        let chunk = vec![7_u8; 2048];
        let mut hashes = DiffHashes::new(cfg(), chunk.len() as u64);
        hashes.scan(&chunk).unwrap();
        hashes.clear_dirty();

        let changed = hashes.scan(&chunk).unwrap();
        assert_eq!(changed, 0);
        assert_eq!(hashes.dirty_count(), 0);
    }

    #[test]
    fn test_single_block_update_detected() {
        let mut chunk = vec![0_u8; 2048];
        let mut hashes = DiffHashes::new(cfg(), chunk.len() as u64);
        hashes.scan(&chunk).unwrap();
        hashes.clear_dirty();

        // Touch bytes [100, 200): block 0 only.
        for byte in &mut chunk[100..200] {
            *byte = 0xFF;
        }
        assert_eq!(hashes.scan(&chunk).unwrap(), 1);

        hashes.reset_cursor();
        let range = hashes.next_changed_range(chunk.len() as u64);
        assert_eq!(range, Some((0, 512)));
        assert_eq!(hashes.next_changed_range(chunk.len() as u64), None);
    }

    #[test]
    fn test_contiguous_dirty_blocks_coalesce() {
        let chunk = vec![1_u8; 512 * 5 + 100];
        let mut hashes = DiffHashes::new(cfg(), chunk.len() as u64);
        hashes.scan(&chunk).unwrap();
        hashes.clear_dirty();

        // Dirty blocks 1, 2 and the partial tail block 5.
        let mut modified = chunk.clone();
        modified[512] = 9;
        modified[1024] = 9;
        modified[512 * 5 + 1] = 9;
        hashes.scan(&modified).unwrap();

        hashes.reset_cursor();
        assert_eq!(
            hashes.next_changed_range(modified.len() as u64),
            Some((512, 1024))
        );
        assert_eq!(
            hashes.next_changed_range(modified.len() as u64),
            Some((512 * 5, 100)),
            "tail range must clip to the chunk size"
        );
        assert_eq!(hashes.next_changed_range(modified.len() as u64), None);
    }

    #[test]
    fn test_dirty_survives_until_cleared() {
        let chunk = vec![3_u8; 1024];
        let mut hashes = DiffHashes::new(cfg(), 1024);
        hashes.scan(&chunk).unwrap();
        assert_eq!(hashes.dirty_count(), 2);

        // A second scan with identical bytes does not report changes but the
        // uncommitted dirty bits remain set.
        assert_eq!(hashes.scan(&chunk).unwrap(), 0);
        assert_eq!(hashes.dirty_count(), 2);
    }

    #[test]
    fn test_resize_preserves_leading_rows() {
        let chunk = vec![5_u8; 2048];
        let mut hashes = DiffHashes::new(cfg(), 2048);
        hashes.scan(&chunk).unwrap();
        hashes.clear_dirty();

        hashes.resize(3000);
        assert_eq!(hashes.len(), 6);
        // Leading rows keep their digests: rescan of unchanged prefix blocks
        // reports only the fresh rows.
        let grown = vec![5_u8; 3000];
        let changed = hashes.scan(&grown).unwrap();
        assert_eq!(changed, 2);

        hashes.resize(512);
        assert_eq!(hashes.len(), 1);
    }

    #[test]
    fn test_crc32_mode() {
        let chunk = vec![0xAB_u8; 600];
        let cfg = DcpConfig::new(DcpMode::Crc32, 512).unwrap();
        let mut hashes = DiffHashes::new(cfg, 600);
        assert_eq!(hashes.scan(&chunk).unwrap(), 2);
        assert!(matches!(
            hashes.next_changed_range(600),
            Some((0, 600))
        ));
    }
}
