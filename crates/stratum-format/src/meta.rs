//! File-meta record: sizes, timestamp, payload checksum, self-hash.

use stratum_error::{Result, StratumError};

use crate::wire::{push_i64, push_u32, push_u64, read_array, read_i64, read_u32, read_u64};
use crate::{CONTAINER_MAGIC, CONTAINER_VERSION, F_META, MD5_DIGEST_LEN, MD5_HEX_LEN, md5_digest};

/// Leading record of every container file.
///
/// `checksum` is the lowercase hex MD5 of the file bytes after the meta
/// region (`[F_META, fs)`). `my_hash` is the MD5 of this record serialized
/// with both `checksum` and `my_hash` zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Hex MD5 of the payload region.
    pub checksum: [u8; MD5_HEX_LEN],
    /// MD5 of this record with the hash fields zeroed.
    pub my_hash: [u8; MD5_DIGEST_LEN],
    /// Bytes of protected data written by this checkpoint.
    pub ckpt_size: u64,
    /// File size in bytes.
    pub fs: u64,
    /// Maximum file size across the encoding group.
    pub max_fs: u64,
    /// Partner copy file size.
    pub pt_fs: u64,
    /// Creation time in nanoseconds since the epoch.
    pub timestamp: i64,
    /// Payload bytes actually emitted (differs from `data_size` under dCP).
    pub dcp_size: u64,
    /// Total size of protected data, excluding all metadata.
    pub data_size: u64,
}

impl Default for FileMeta {
    fn default() -> Self {
        Self {
            checksum: [b'0'; MD5_HEX_LEN],
            my_hash: [0; MD5_DIGEST_LEN],
            ckpt_size: 0,
            fs: 0,
            max_fs: 0,
            pt_fs: 0,
            timestamp: 0,
            dcp_size: 0,
            data_size: 0,
        }
    }
}

impl FileMeta {
    /// Serialize, optionally zeroing the hash fields for self-hashing.
    fn serialize(&self, zero_hashes: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(F_META);
        buf.extend_from_slice(&CONTAINER_MAGIC);
        push_u32(&mut buf, CONTAINER_VERSION);
        if zero_hashes {
            buf.extend_from_slice(&[0_u8; MD5_HEX_LEN]);
            buf.extend_from_slice(&[0_u8; MD5_DIGEST_LEN]);
        } else {
            buf.extend_from_slice(&self.checksum);
            buf.extend_from_slice(&self.my_hash);
        }
        push_u64(&mut buf, self.ckpt_size);
        push_u64(&mut buf, self.fs);
        push_u64(&mut buf, self.max_fs);
        push_u64(&mut buf, self.pt_fs);
        push_i64(&mut buf, self.timestamp);
        push_u64(&mut buf, self.dcp_size);
        push_u64(&mut buf, self.data_size);
        debug_assert_eq!(buf.len(), F_META);
        buf
    }

    /// On-disk bytes of this record.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.serialize(false)
    }

    /// Compute the self-hash over the record with hash fields zeroed.
    #[must_use]
    pub fn compute_self_hash(&self) -> [u8; MD5_DIGEST_LEN] {
        md5_digest(&self.serialize(true))
    }

    /// Fill in `my_hash`. Call after every other field is final.
    pub fn seal(&mut self) {
        self.my_hash = self.compute_self_hash();
    }

    /// Parse and verify the self-hash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < F_META {
            return Err(StratumError::FormatCorrupt {
                detail: format!(
                    "file meta too short: expected {F_META} bytes, got {}",
                    bytes.len()
                ),
            });
        }
        let mut cursor = 0_usize;
        let magic = read_array::<8>(bytes, &mut cursor, "magic")?;
        if magic != CONTAINER_MAGIC {
            return Err(StratumError::FormatCorrupt {
                detail: format!("invalid container magic: {magic:02x?}"),
            });
        }
        let version = read_u32(bytes, &mut cursor, "version")?;
        if version != CONTAINER_VERSION {
            return Err(StratumError::FormatCorrupt {
                detail: format!(
                    "unsupported container version {version}, expected {CONTAINER_VERSION}"
                ),
            });
        }
        let checksum = read_array::<MD5_HEX_LEN>(bytes, &mut cursor, "checksum")?;
        let my_hash = read_array::<MD5_DIGEST_LEN>(bytes, &mut cursor, "my_hash")?;
        let meta = Self {
            checksum,
            my_hash,
            ckpt_size: read_u64(bytes, &mut cursor, "ckpt_size")?,
            fs: read_u64(bytes, &mut cursor, "fs")?,
            max_fs: read_u64(bytes, &mut cursor, "max_fs")?,
            pt_fs: read_u64(bytes, &mut cursor, "pt_fs")?,
            timestamp: read_i64(bytes, &mut cursor, "timestamp")?,
            dcp_size: read_u64(bytes, &mut cursor, "dcp_size")?,
            data_size: read_u64(bytes, &mut cursor, "data_size")?,
        };
        let computed = meta.compute_self_hash();
        if computed != meta.my_hash {
            return Err(StratumError::ChecksumMismatch {
                what: "file meta self-hash".to_owned(),
                stored: format!("{:02x?}", meta.my_hash),
                computed: format!("{computed:02x?}"),
            });
        }
        Ok(meta)
    }
}
