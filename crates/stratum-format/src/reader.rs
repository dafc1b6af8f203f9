//! Container reader: parse, verify every hash, expose variable bytes.
//!
//! Verification order mirrors the write path in reverse: meta self-hash,
//! payload checksum, block self-hashes, chunk self-hashes, then chunk
//! content hashes. Any mismatch surfaces as `ChecksumMismatch`, which the
//! recovery planner treats as a missing file.

use std::fs;
use std::path::Path;

use stratum_error::{Result, StratumError};
use stratum_types::VarId;
use tracing::debug;

use crate::chain::{BlockChain, DataBlock, VarChunk};
use crate::meta::FileMeta;
use crate::wire::{read_array, read_u32, read_u64};
use crate::{F_META, MD5_DIGEST_LEN, hex_digest, md5_digest};

/// A fully verified container held in memory.
#[derive(Debug)]
pub struct ContainerReader {
    pub meta: FileMeta,
    pub chain: BlockChain,
    bytes: Vec<u8>,
}

impl ContainerReader {
    /// Read and verify the container at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|_| StratumError::FileMissing {
            path: path.to_path_buf(),
        })?;
        Self::from_bytes(bytes)
    }

    /// Verify a container already in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < F_META {
            return Err(StratumError::FormatCorrupt {
                detail: format!("container of {} bytes has no meta region", bytes.len()),
            });
        }
        let meta = FileMeta::from_bytes(&bytes[..F_META])?;
        if meta.fs != bytes.len() as u64 {
            return Err(StratumError::FormatCorrupt {
                detail: format!(
                    "meta claims {} bytes but the file holds {}",
                    meta.fs,
                    bytes.len()
                ),
            });
        }
        let computed = hex_digest(&md5_digest(&bytes[F_META..]));
        if computed != meta.checksum {
            return Err(StratumError::ChecksumMismatch {
                what: "container payload".to_owned(),
                stored: String::from_utf8_lossy(&meta.checksum).into_owned(),
                computed: String::from_utf8_lossy(&computed).into_owned(),
            });
        }

        let mut chain = BlockChain::new();
        let mut cursor = F_META;
        while cursor < bytes.len() {
            let block_start = cursor;
            let numvars = read_u32(&bytes, &mut cursor, "block numvars")?;
            let dbsize = read_u64(&bytes, &mut cursor, "block dbsize")?;
            let my_hash = read_array::<MD5_DIGEST_LEN>(&bytes, &mut cursor, "block self-hash")?;
            let mut block = DataBlock {
                dbsize,
                my_hash,
                complete: true,
                chunks: Vec::with_capacity(numvars as usize),
            };
            for _ in 0..numvars {
                block.chunks.push(VarChunk::from_bytes(&bytes, &mut cursor)?);
            }
            // The self-hash covers numvars, so verify once the chunk count
            // is re-established.
            let computed = block.compute_self_hash();
            if computed != my_hash {
                return Err(StratumError::ChecksumMismatch {
                    what: format!("block header at offset {block_start}"),
                    stored: format!("{my_hash:02x?}"),
                    computed: format!("{computed:02x?}"),
                });
            }
            if block.meta_size() > dbsize {
                return Err(StratumError::FormatCorrupt {
                    detail: format!(
                        "block at offset {block_start} metadata ({}) exceeds dbsize {dbsize}",
                        block.meta_size()
                    ),
                });
            }
            cursor = block_start + dbsize as usize;
            if cursor > bytes.len() {
                return Err(StratumError::FormatCorrupt {
                    detail: format!("block at offset {block_start} runs past the file end"),
                });
            }
            chain.blocks.push(block);
        }

        // Content hashes last; container regions without content are skipped.
        for block in &chain.blocks {
            for chunk in &block.chunks {
                if !chunk.has_content {
                    continue;
                }
                let start = chunk.fptr as usize;
                let end = start + chunk.chunk_size as usize;
                if end > bytes.len() {
                    return Err(StratumError::FormatCorrupt {
                        detail: format!(
                            "chunk of variable {} addresses [{start}, {end}) past the file end",
                            chunk.id
                        ),
                    });
                }
                let computed = md5_digest(&bytes[start..end]);
                if computed != chunk.hash {
                    return Err(StratumError::ChecksumMismatch {
                        what: format!("content of variable {} chunk {}", chunk.id, chunk.container_id),
                        stored: format!("{:02x?}", chunk.hash),
                        computed: format!("{computed:02x?}"),
                    });
                }
            }
        }

        debug!(
            blocks = chain.blocks.len(),
            fs = meta.fs,
            "container verified"
        );
        Ok(Self { meta, chain, bytes })
    }

    /// Distinct variable ids with content, in chain order.
    #[must_use]
    pub fn var_ids(&self) -> Vec<VarId> {
        self.chain
            .var_ids()
            .into_iter()
            .filter(|&id| self.chain.content_size(id) > 0)
            .collect()
    }

    /// Stored byte size of one variable.
    #[must_use]
    pub fn var_size(&self, id: VarId) -> u64 {
        self.chain.content_size(id)
    }

    /// Reassemble one variable from its chunks.
    pub fn var_bytes(&self, id: VarId) -> Result<Vec<u8>> {
        let total = self.chain.content_size(id);
        if total == 0 {
            return Err(StratumError::UnknownVariable { id: id.get() });
        }
        let mut out = vec![0_u8; total as usize];
        for chunk in self.chain.chunks_of(id) {
            if !chunk.has_content {
                continue;
            }
            let src = chunk.fptr as usize..(chunk.fptr + chunk.chunk_size) as usize;
            let dst = chunk.dptr as usize..(chunk.dptr + chunk.chunk_size) as usize;
            out[dst].copy_from_slice(&self.bytes[src]);
        }
        Ok(out)
    }

    /// Every stored variable with its bytes.
    pub fn vars(&self) -> Result<Vec<(VarId, Vec<u8>)>> {
        self.var_ids()
            .into_iter()
            .map(|id| Ok((id, self.var_bytes(id)?)))
            .collect()
    }
}
