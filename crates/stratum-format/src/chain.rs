//! Data-block chain: the arena of blocks and variable chunks that gives a
//! container file its layout.
//!
//! Blocks are held by index in a `Vec`; ordering is the chain order.
//! A block that has been committed by a checkpoint is complete: its chunk
//! array and container offsets are frozen. All growth lands in the open
//! block at the tail (created on demand), so container `fptr` values are
//! stable across cycles of the same execution.

use stratum_error::{Result, StratumError};
use stratum_types::VarId;

use crate::dcp::{DcpConfig, DiffHashes};
use crate::wire::{push_bool, push_u32, push_u64, read_array, read_bool, read_u32, read_u64};
use crate::{F_DB, F_DBVAR, F_META, MD5_DIGEST_LEN, md5_digest};

/// A maximal contiguous region of one variable stored in a single block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarChunk {
    /// Protected variable this chunk belongs to.
    pub id: VarId,
    /// Registry index of the variable at write time.
    pub idx: u32,
    /// Ordinal of this container among the variable's containers.
    pub container_id: u32,
    /// Whether the container currently holds checkpoint data.
    pub has_content: bool,
    /// Whether the container was present in the previous committed file.
    pub has_ckpt: bool,
    /// Offset of this chunk inside the variable.
    pub dptr: u64,
    /// Absolute file offset of the container.
    pub fptr: u64,
    /// Bytes of variable data stored in this container.
    pub chunk_size: u64,
    /// Reserved container size; never shrinks, `>= chunk_size`.
    pub container_size: u64,
    /// MD5 of the chunk content.
    pub hash: [u8; MD5_DIGEST_LEN],
    /// MD5 of this header with `my_hash` zeroed.
    pub my_hash: [u8; MD5_DIGEST_LEN],
    /// Header must be rewritten in the next file update. Runtime only.
    pub update: bool,
    /// dCP rows covering this chunk. Runtime only, allocated lazily.
    pub diff_hashes: Option<DiffHashes>,
}

impl VarChunk {
    fn serialize(&self, zero_self_hash: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(F_DBVAR);
        push_u32(&mut buf, self.id.get());
        push_u32(&mut buf, self.idx);
        push_u32(&mut buf, self.container_id);
        push_bool(&mut buf, self.has_content);
        push_bool(&mut buf, self.has_ckpt);
        push_u64(&mut buf, self.dptr);
        push_u64(&mut buf, self.fptr);
        push_u64(&mut buf, self.chunk_size);
        push_u64(&mut buf, self.container_size);
        buf.extend_from_slice(&self.hash);
        if zero_self_hash {
            buf.extend_from_slice(&[0_u8; MD5_DIGEST_LEN]);
        } else {
            buf.extend_from_slice(&self.my_hash);
        }
        debug_assert_eq!(buf.len(), F_DBVAR);
        buf
    }

    /// On-disk header bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.serialize(false)
    }

    /// Fill in `my_hash` from the current field values.
    pub fn seal(&mut self) {
        self.my_hash = md5_digest(&self.serialize(true));
    }

    /// Parse one chunk header and verify its self-hash.
    pub fn from_bytes(bytes: &[u8], cursor: &mut usize) -> Result<Self> {
        let id = VarId(read_u32(bytes, cursor, "chunk id")?);
        let idx = read_u32(bytes, cursor, "chunk idx")?;
        let container_id = read_u32(bytes, cursor, "container id")?;
        let has_content = read_bool(bytes, cursor, "has_content")?;
        let has_ckpt = read_bool(bytes, cursor, "has_ckpt")?;
        let dptr = read_u64(bytes, cursor, "dptr")?;
        let fptr = read_u64(bytes, cursor, "fptr")?;
        let chunk_size = read_u64(bytes, cursor, "chunk_size")?;
        let container_size = read_u64(bytes, cursor, "container_size")?;
        let hash = read_array::<MD5_DIGEST_LEN>(bytes, cursor, "chunk hash")?;
        let my_hash = read_array::<MD5_DIGEST_LEN>(bytes, cursor, "chunk self-hash")?;
        let chunk = Self {
            id,
            idx,
            container_id,
            has_content,
            has_ckpt,
            dptr,
            fptr,
            chunk_size,
            container_size,
            hash,
            my_hash,
            update: false,
            diff_hashes: None,
        };
        let computed = md5_digest(&chunk.serialize(true));
        if computed != chunk.my_hash {
            return Err(StratumError::ChecksumMismatch {
                what: format!("chunk header of variable {id}"),
                stored: format!("{:02x?}", chunk.my_hash),
                computed: format!("{computed:02x?}"),
            });
        }
        if chunk.chunk_size > chunk.container_size {
            return Err(StratumError::FormatCorrupt {
                detail: format!(
                    "chunk of variable {id} claims {} bytes in a {}-byte container",
                    chunk.chunk_size, chunk.container_size
                ),
            });
        }
        Ok(chunk)
    }
}

/// One data block: header plus its chunk array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Metadata-plus-containers size of the block in bytes.
    pub dbsize: u64,
    /// MD5 of the header with `my_hash` zeroed.
    pub my_hash: [u8; MD5_DIGEST_LEN],
    /// Frozen by a committed checkpoint; no chunks may be added.
    pub complete: bool,
    pub chunks: Vec<VarChunk>,
}

impl DataBlock {
    fn new() -> Self {
        Self {
            dbsize: 0,
            my_hash: [0; MD5_DIGEST_LEN],
            complete: false,
            chunks: Vec::new(),
        }
    }

    /// Number of chunk headers in this block.
    #[must_use]
    pub fn numvars(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Metadata region size: block header plus chunk headers.
    #[must_use]
    pub fn meta_size(&self) -> u64 {
        (F_DB + self.chunks.len() * F_DBVAR) as u64
    }

    fn serialize_header(&self, zero_self_hash: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(F_DB);
        push_u32(&mut buf, self.numvars());
        push_u64(&mut buf, self.dbsize);
        if zero_self_hash {
            buf.extend_from_slice(&[0_u8; MD5_DIGEST_LEN]);
        } else {
            buf.extend_from_slice(&self.my_hash);
        }
        debug_assert_eq!(buf.len(), F_DB);
        buf
    }

    /// On-disk header bytes.
    #[must_use]
    pub fn header_bytes(&self) -> Vec<u8> {
        self.serialize_header(false)
    }

    /// Self-hash over the header with the hash bytes zeroed.
    #[must_use]
    pub fn compute_self_hash(&self) -> [u8; MD5_DIGEST_LEN] {
        md5_digest(&self.serialize_header(true))
    }

    /// Fill in `my_hash`.
    pub fn seal(&mut self) {
        self.my_hash = self.compute_self_hash();
    }
}

/// The whole chain, kept by the engine across checkpoint cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockChain {
    pub blocks: Vec<DataBlock>,
}

impl BlockChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks of one variable in chain order.
    pub fn chunks_of(&self, id: VarId) -> impl Iterator<Item = &VarChunk> {
        self.blocks
            .iter()
            .flat_map(|block| block.chunks.iter())
            .filter(move |chunk| chunk.id == id)
    }

    fn chunks_of_mut(&mut self, id: VarId) -> impl Iterator<Item = &mut VarChunk> {
        self.blocks
            .iter_mut()
            .flat_map(|block| block.chunks.iter_mut())
            .filter(move |chunk| chunk.id == id)
    }

    /// Bytes of `id` currently marked as content.
    #[must_use]
    pub fn content_size(&self, id: VarId) -> u64 {
        self.chunks_of(id).map(|chunk| chunk.chunk_size).sum()
    }

    /// Distinct variable ids present in the chain.
    #[must_use]
    pub fn var_ids(&self) -> Vec<VarId> {
        let mut ids: Vec<VarId> = Vec::new();
        for block in &self.blocks {
            for chunk in &block.chunks {
                if !ids.contains(&chunk.id) {
                    ids.push(chunk.id);
                }
            }
        }
        ids
    }

    fn open_block(&mut self) -> &mut DataBlock {
        let needs_new = self.blocks.last().is_none_or(|block| block.complete);
        if needs_new {
            self.blocks.push(DataBlock::new());
        }
        self.blocks.last_mut().expect("block just ensured")
    }

    /// Bring the chain's chunk coverage in line with the registry snapshot.
    ///
    /// `vars` is `(id, registry index, byte size)` in registration order.
    /// Existing containers are refilled first (shrinkage keeps them, growth
    /// reuses them), then one fresh chunk per still-uncovered variable tail
    /// is appended to the open block. Variables absent from `vars` lose
    /// their content flag but keep their containers.
    pub fn update_layout(&mut self, vars: &[(VarId, u32, u64)], dcp: Option<DcpConfig>) {
        for &(id, idx, size) in vars {
            let mut covered = 0_u64;
            let mut containers = 0_u32;
            for chunk in self.chunks_of_mut(id) {
                containers += 1;
                let want = (size - covered).min(chunk.container_size);
                let has_content = want > 0;
                if chunk.chunk_size != want
                    || chunk.has_content != has_content
                    || chunk.dptr != covered
                    || chunk.idx != idx
                {
                    chunk.chunk_size = want;
                    chunk.has_content = has_content;
                    chunk.dptr = covered;
                    chunk.idx = idx;
                    chunk.update = true;
                }
                if let Some(cfg) = dcp {
                    chunk
                        .diff_hashes
                        .get_or_insert_with(|| DiffHashes::new(cfg, 0))
                        .resize(want);
                }
                covered += want;
            }
            if covered < size {
                let chunk_size = size - covered;
                let mut chunk = VarChunk {
                    id,
                    idx,
                    container_id: containers,
                    has_content: true,
                    has_ckpt: false,
                    dptr: covered,
                    fptr: 0,
                    chunk_size,
                    container_size: chunk_size,
                    hash: [0; MD5_DIGEST_LEN],
                    my_hash: [0; MD5_DIGEST_LEN],
                    update: true,
                    diff_hashes: None,
                };
                if let Some(cfg) = dcp {
                    chunk.diff_hashes = Some(DiffHashes::new(cfg, chunk_size));
                }
                self.open_block().chunks.push(chunk);
            }
        }

        // Freed variables: drop content, keep containers.
        let live: Vec<VarId> = vars.iter().map(|&(id, _, _)| id).collect();
        for block in &mut self.blocks {
            for chunk in &mut block.chunks {
                if !live.contains(&chunk.id) && chunk.has_content {
                    chunk.has_content = false;
                    chunk.chunk_size = 0;
                    chunk.update = true;
                    if let Some(hashes) = chunk.diff_hashes.as_mut() {
                        hashes.resize(0);
                    }
                }
            }
        }
    }

    /// Assign file offsets to the open tail of the chain and recompute
    /// block sizes. Returns the file size.
    ///
    /// Complete blocks keep their stored offsets; the walk only verifies
    /// the running offset against them.
    pub fn freeze_layout(&mut self) -> Result<u64> {
        let mut offset = F_META as u64;
        for block in &mut self.blocks {
            let meta_size = block.meta_size();
            let containers: u64 = block.chunks.iter().map(|chunk| chunk.container_size).sum();
            let dbsize = meta_size + containers;
            if block.complete {
                if block.dbsize != dbsize {
                    return Err(StratumError::internal(format!(
                        "complete block changed size: stored {}, computed {dbsize}",
                        block.dbsize
                    )));
                }
            } else {
                block.dbsize = dbsize;
                let mut container_offset = offset + meta_size;
                for chunk in &mut block.chunks {
                    if chunk.fptr != container_offset {
                        chunk.fptr = container_offset;
                        chunk.update = true;
                    }
                    container_offset += chunk.container_size;
                }
            }
            offset += block.dbsize;
        }
        Ok(offset)
    }

    /// Freeze the chain after a successful commit: blocks become complete,
    /// content is known to be in the file, dirty dCP rows are cleared.
    pub fn mark_committed(&mut self) {
        for block in &mut self.blocks {
            block.complete = true;
            for chunk in &mut block.chunks {
                if chunk.has_content {
                    chunk.has_ckpt = true;
                }
                chunk.update = false;
                if let Some(hashes) = chunk.diff_hashes.as_mut() {
                    hashes.clear_dirty();
                    hashes.reset_cursor();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(chain: &BlockChain, id: u32) -> Vec<(u64, u64, bool)> {
        chain
            .chunks_of(VarId(id))
            .map(|chunk| (chunk.chunk_size, chunk.container_size, chunk.has_content))
            .collect()
    }

    #[test]
    fn test_first_layout_creates_one_block() {
        let mut chain = BlockChain::new();
        chain.update_layout(&[(VarId(1), 0, 100), (VarId(2), 1, 200)], None);
        assert_eq!(chain.blocks.len(), 1);
        assert_eq!(chain.blocks[0].numvars(), 2);

        let fs = chain.freeze_layout().unwrap();
        let meta_size = (F_DB + 2 * F_DBVAR) as u64;
        assert_eq!(fs, F_META as u64 + meta_size + 300);

        let first = chain.chunks_of(VarId(1)).next().unwrap();
        assert_eq!(first.fptr, F_META as u64 + meta_size);
        let second = chain.chunks_of(VarId(2)).next().unwrap();
        assert_eq!(second.fptr, first.fptr + 100);
    }

    #[test]
    fn test_growth_appends_to_new_block_after_commit() {
        let mut chain = BlockChain::new();
        chain.update_layout(&[(VarId(1), 0, 100)], None);
        chain.freeze_layout().unwrap();
        let original_fptr = chain.chunks_of(VarId(1)).next().unwrap().fptr;
        chain.mark_committed();

        chain.update_layout(&[(VarId(1), 0, 250)], None);
        assert_eq!(chain.blocks.len(), 2, "growth lands in a fresh block");
        chain.freeze_layout().unwrap();

        let chunks: Vec<_> = chain.chunks_of(VarId(1)).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].fptr, original_fptr, "committed fptr is stable");
        assert_eq!(chunks[0].chunk_size, 100);
        assert_eq!(chunks[1].dptr, 100);
        assert_eq!(chunks[1].chunk_size, 150);
        assert_eq!(chunks[1].container_id, 1);
    }

    #[test]
    fn test_shrink_keeps_containers() {
        let mut chain = BlockChain::new();
        chain.update_layout(&[(VarId(1), 0, 100)], None);
        chain.freeze_layout().unwrap();
        chain.mark_committed();
        chain.update_layout(&[(VarId(1), 0, 250)], None);
        chain.freeze_layout().unwrap();
        chain.mark_committed();

        chain.update_layout(&[(VarId(1), 0, 60)], None);
        let fs_before = chain.freeze_layout().unwrap();
        assert_eq!(
            sizes(&chain, 1),
            vec![(60, 100, true), (0, 150, false)],
            "trailing container retained without content"
        );

        // Regrow inside the reserved containers: no new chunk, same size.
        chain.update_layout(&[(VarId(1), 0, 220)], None);
        let fs_after = chain.freeze_layout().unwrap();
        assert_eq!(sizes(&chain, 1), vec![(100, 100, true), (120, 150, true)]);
        assert_eq!(fs_before, fs_after);
    }

    #[test]
    fn test_freed_variable_loses_content_keeps_layout() {
        let mut chain = BlockChain::new();
        chain.update_layout(&[(VarId(1), 0, 100), (VarId(2), 1, 50)], None);
        let fs = chain.freeze_layout().unwrap();
        chain.mark_committed();

        chain.update_layout(&[(VarId(2), 0, 50)], None);
        assert_eq!(chain.freeze_layout().unwrap(), fs);
        assert_eq!(sizes(&chain, 1), vec![(0, 100, false)]);
        assert_eq!(chain.content_size(VarId(1)), 0);
        assert_eq!(chain.content_size(VarId(2)), 50);
    }

    #[test]
    fn test_chunk_header_round_trip() {
        let mut chunk = VarChunk {
            id: VarId(7),
            idx: 3,
            container_id: 2,
            has_content: true,
            has_ckpt: false,
            dptr: 4096,
            fptr: 8192,
            chunk_size: 100,
            container_size: 128,
            hash: md5_digest(b"content"),
            my_hash: [0; MD5_DIGEST_LEN],
            update: false,
            diff_hashes: None,
        };
        chunk.seal();
        let bytes = chunk.to_bytes();
        assert_eq!(bytes.len(), F_DBVAR);
        let mut cursor = 0;
        let parsed = VarChunk::from_bytes(&bytes, &mut cursor).unwrap();
        assert_eq!(parsed, chunk);

        let mut tampered = chunk.to_bytes();
        tampered[4] ^= 1; // idx field
        let mut cursor = 0;
        assert!(matches!(
            VarChunk::from_bytes(&tampered, &mut cursor),
            Err(StratumError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_dcp_rows_follow_chunk_sizes() {
        let cfg = DcpConfig::new(stratum_types::DcpMode::Md5, 512).unwrap();
        let mut chain = BlockChain::new();
        chain.update_layout(&[(VarId(1), 0, 1536)], Some(cfg));
        let rows = chain
            .chunks_of(VarId(1))
            .next()
            .unwrap()
            .diff_hashes
            .as_ref()
            .unwrap()
            .len();
        assert_eq!(rows, 3);

        chain.freeze_layout().unwrap();
        chain.mark_committed();
        chain.update_layout(&[(VarId(1), 0, 512)], Some(cfg));
        let rows = chain
            .chunks_of(VarId(1))
            .next()
            .unwrap()
            .diff_hashes
            .as_ref()
            .unwrap()
            .len();
        assert_eq!(rows, 1);
    }
}
