//! Container writer: full rewrite with atomic rename, or in-place
//! differential patching when dCP is active.
//!
//! The differential path relies on the chain's stable layout: only dirty
//! dCP ranges and the (always rewritten) header records touch the disk, so
//! an unchanged registry produces a byte-identical logical file at near-zero
//! payload cost.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use stratum_error::{Result, StratumError};
use stratum_types::VarId;
use tracing::{debug, info};

use crate::chain::BlockChain;
use crate::dcp::DcpConfig;
use crate::meta::FileMeta;
use crate::{F_META, hex_digest, md5_digest};

/// One protected variable at quiesce time: id, registry index, staged bytes.
#[derive(Debug, Clone, Copy)]
pub struct VarSnapshot<'a> {
    pub id: VarId,
    pub idx: u32,
    pub bytes: &'a [u8],
}

/// How the written file reaches its final path.
#[derive(Debug, Clone, Copy)]
pub enum CommitMode<'p> {
    /// Write everything to `tmp`, fsync, rename over the final path.
    AtomicRename { tmp: &'p Path },
    /// Patch the existing file in place (differential checkpoints).
    InPlace,
}

/// Outcome of a successful container write.
#[derive(Debug, Clone)]
pub struct WriteSummary {
    /// Final file size.
    pub fs: u64,
    /// Total protected data covered by the file.
    pub data_size: u64,
    /// Payload bytes actually written this cycle.
    pub payload_written: u64,
    /// The sealed file meta as it appears on disk.
    pub meta: FileMeta,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as i64)
}

fn snapshot_slice<'a>(var: &VarSnapshot<'a>, dptr: u64, len: u64) -> Result<&'a [u8]> {
    let start = dptr as usize;
    let end = start + len as usize;
    if end > var.bytes.len() {
        return Err(StratumError::internal(format!(
            "chunk of variable {} addresses [{start}, {end}) beyond {} staged bytes",
            var.id,
            var.bytes.len()
        )));
    }
    Ok(&var.bytes[start..end])
}

/// Write (or patch) the container at `path` from the registry snapshot.
///
/// On success the chain is marked committed: blocks freeze, `has_ckpt` is
/// set, dCP dirty bits clear. On failure the chain keeps its update and
/// dirty state so the next attempt re-emits everything still pending.
pub fn write_container(
    path: &Path,
    commit: CommitMode<'_>,
    chain: &mut BlockChain,
    vars: &[VarSnapshot<'_>],
    dcp: Option<DcpConfig>,
) -> Result<WriteSummary> {
    let layout: Vec<(VarId, u32, u64)> = vars
        .iter()
        .map(|var| (var.id, var.idx, var.bytes.len() as u64))
        .collect();
    chain.update_layout(&layout, dcp);
    let fs = chain.freeze_layout()?;
    let data_size: u64 = layout.iter().map(|&(_, _, size)| size).sum();

    let find_var = |id: VarId| -> Result<&VarSnapshot<'_>> {
        vars.iter()
            .find(|var| var.id == id)
            .ok_or_else(|| StratumError::UnknownVariable { id: id.get() })
    };

    // Pass 1: chunk content hashes, dCP scans, record seals.
    for block in &mut chain.blocks {
        for chunk in &mut block.chunks {
            if chunk.has_content {
                let var = find_var(chunk.id)?;
                let slice = snapshot_slice(var, chunk.dptr, chunk.chunk_size)?;
                chunk.hash = md5_digest(slice);
                if let Some(hashes) = chunk.diff_hashes.as_mut() {
                    hashes.scan(slice)?;
                    hashes.reset_cursor();
                }
            }
            chunk.seal();
        }
        block.seal();
    }

    let mut payload_written = 0_u64;
    let mut meta = FileMeta {
        ckpt_size: data_size,
        fs,
        max_fs: fs,
        pt_fs: 0,
        timestamp: now_nanos(),
        dcp_size: 0,
        data_size,
        ..FileMeta::default()
    };

    match commit {
        CommitMode::AtomicRename { tmp } => {
            let mut buffer = vec![0_u8; fs as usize];
            let mut offset = F_META;
            for block in &chain.blocks {
                let header = block.header_bytes();
                buffer[offset..offset + header.len()].copy_from_slice(&header);
                offset += header.len();
                for chunk in &block.chunks {
                    let header = chunk.to_bytes();
                    buffer[offset..offset + header.len()].copy_from_slice(&header);
                    offset += header.len();
                }
                for chunk in &block.chunks {
                    if chunk.has_content {
                        let var = find_var(chunk.id)?;
                        let slice = snapshot_slice(var, chunk.dptr, chunk.chunk_size)?;
                        let start = chunk.fptr as usize;
                        buffer[start..start + slice.len()].copy_from_slice(slice);
                        payload_written += chunk.chunk_size;
                    }
                    offset += chunk.container_size as usize;
                }
            }
            debug_assert_eq!(offset as u64, fs);

            meta.dcp_size = payload_written;
            meta.checksum = hex_digest(&md5_digest(&buffer[F_META..]));
            meta.seal();
            buffer[..F_META].copy_from_slice(&meta.to_bytes());

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(tmp)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
            drop(file);
            fs::rename(tmp, path)?;
        }
        CommitMode::InPlace => {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?;
            let old_len = file.metadata()?.len();
            if old_len < fs {
                file.set_len(fs)?;
            }

            for block in &chain.blocks {
                for chunk in &block.chunks {
                    if !chunk.has_content {
                        continue;
                    }
                    let var = find_var(chunk.id)?;
                    match chunk.diff_hashes.clone() {
                        Some(mut hashes) => {
                            hashes.reset_cursor();
                            while let Some((range_off, range_len)) =
                                hashes.next_changed_range(chunk.chunk_size)
                            {
                                let slice =
                                    snapshot_slice(var, chunk.dptr + range_off, range_len)?;
                                file.seek(SeekFrom::Start(chunk.fptr + range_off))?;
                                file.write_all(slice)?;
                                payload_written += range_len;
                            }
                        }
                        None => {
                            let slice = snapshot_slice(var, chunk.dptr, chunk.chunk_size)?;
                            file.seek(SeekFrom::Start(chunk.fptr))?;
                            file.write_all(slice)?;
                            payload_written += chunk.chunk_size;
                        }
                    }
                }
            }

            // Headers are always rewritten: chunk hashes and sizes moved.
            let mut offset = F_META as u64;
            for block in &chain.blocks {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&block.header_bytes())?;
                for chunk in &block.chunks {
                    file.write_all(&chunk.to_bytes())?;
                }
                offset += block.dbsize;
            }

            // The payload checksum covers stale container regions too, so
            // hash what is actually on disk.
            file.seek(SeekFrom::Start(F_META as u64))?;
            let mut tail = vec![0_u8; (fs as usize) - F_META];
            file.read_exact(&mut tail)?;
            meta.dcp_size = payload_written;
            meta.checksum = hex_digest(&md5_digest(&tail));
            meta.seal();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&meta.to_bytes())?;
            file.sync_all()?;
        }
    }

    chain.mark_committed();
    info!(
        path = %path.display(),
        fs,
        data_size,
        payload_written,
        "container committed"
    );
    Ok(WriteSummary {
        fs,
        data_size,
        payload_written,
        meta,
    })
}

/// Read only the leading file-meta record.
pub fn read_meta(path: &Path) -> Result<FileMeta> {
    let mut file = fs::File::open(path).map_err(|_| StratumError::FileMissing {
        path: path.to_path_buf(),
    })?;
    let mut head = vec![0_u8; F_META];
    file.read_exact(&mut head)
        .map_err(|_| StratumError::FormatCorrupt {
            detail: format!("{} is shorter than the meta region", path.display()),
        })?;
    FileMeta::from_bytes(&head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 256) as u8).collect()
    }

    #[test]
    fn test_full_write_then_read_meta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rank0.fti");
        let tmp = dir.path().join("rank0.fti.part");
        let data = pattern(4096);
        let mut chain = BlockChain::new();
        let summary = write_container(
            &path,
            CommitMode::AtomicRename { tmp: &tmp },
            &mut chain,
            &[VarSnapshot {
                id: VarId(1),
                idx: 0,
                bytes: &data,
            }],
            None,
        )
        .unwrap();
        assert_eq!(summary.data_size, 4096);
        assert_eq!(summary.payload_written, 4096);
        assert!(!tmp.exists(), "tmp renamed away");

        let meta = read_meta(&path).unwrap();
        assert_eq!(meta.fs, summary.fs);
        assert_eq!(meta.data_size, 4096);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            summary.fs,
            "file size matches meta"
        );
    }

    #[test]
    fn test_io_failure_leaves_chain_uncommitted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rank0.fti");
        let tmp = dir.path().join("no-such-dir").join("tmp.fti");
        let data = pattern(128);
        let mut chain = BlockChain::new();

        let result = write_container(
            &path,
            CommitMode::AtomicRename { tmp: &tmp },
            &mut chain,
            &[VarSnapshot {
                id: VarId(1),
                idx: 0,
                bytes: &data,
            }],
            None,
        );
        assert!(matches!(result, Err(StratumError::Io(_))));
        assert!(
            !chain.blocks.iter().any(|block| block.complete),
            "failed write must not commit the chain"
        );
        assert!(
            chain.blocks[0].chunks.iter().all(|chunk| chunk.update),
            "pending header updates survive the failure"
        );
    }
}
