//! FTI-FF: the self-describing per-rank container used for on-node
//! checkpoint files.
//!
//! A file is a fixed-size file-meta record followed by a chain of data
//! blocks. Each block carries a header, an array of variable-chunk headers
//! and the chunk containers those headers address via absolute `fptr`
//! offsets. Every record protects itself with an MD5 self-hash (computed
//! over its serialization with the hash bytes zeroed) and the file meta
//! additionally carries the hex MD5 of everything after the meta region.
//!
//! The chain is append-only in layout: once a block has been committed by a
//! checkpoint its container offsets never move, which is what allows the
//! differential writer to patch files in place.

pub mod chain;
pub mod dcp;
pub mod meta;
pub mod reader;
pub mod wire;
pub mod writer;

pub use chain::{BlockChain, DataBlock, VarChunk};
pub use dcp::{DcpConfig, DcpDigest, DiffHashes, HashRow};
pub use meta::FileMeta;
pub use reader::ContainerReader;
pub use writer::{CommitMode, VarSnapshot, WriteSummary, read_meta, write_container};

/// Magic bytes opening every container file.
pub const CONTAINER_MAGIC: [u8; 8] = *b"STRMFTIF";
/// Current wire version.
pub const CONTAINER_VERSION: u32 = 1;

/// MD5 digest length in bytes.
pub const MD5_DIGEST_LEN: usize = 16;
/// Hex-encoded MD5 digest length in bytes.
pub const MD5_HEX_LEN: usize = 32;

/// Serialized size of the file-meta record.
/// `magic + version + checksum(hex) + my_hash + 7 x u64`.
pub const F_META: usize = 8 + 4 + MD5_HEX_LEN + MD5_DIGEST_LEN + 7 * 8;
/// Serialized size of a data-block header: `numvars + dbsize + my_hash`.
pub const F_DB: usize = 4 + 8 + MD5_DIGEST_LEN;
/// Serialized size of a variable-chunk header.
pub const F_DBVAR: usize = 4 + 4 + 4 + 1 + 1 + 8 + 8 + 8 + 8 + MD5_DIGEST_LEN + MD5_DIGEST_LEN;

/// Lowercase hex encoding of a digest.
#[must_use]
pub fn hex_digest(digest: &[u8; MD5_DIGEST_LEN]) -> [u8; MD5_HEX_LEN] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0_u8; MD5_HEX_LEN];
    for (index, byte) in digest.iter().enumerate() {
        out[index * 2] = HEX[(byte >> 4) as usize];
        out[index * 2 + 1] = HEX[(byte & 0x0F) as usize];
    }
    out
}

/// MD5 of a byte slice.
#[must_use]
pub fn md5_digest(bytes: &[u8]) -> [u8; MD5_DIGEST_LEN] {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_are_published() {
        assert_eq!(F_META, 116);
        assert_eq!(F_DB, 28);
        assert_eq!(F_DBVAR, 78);
    }

    #[test]
    fn test_hex_digest_known_value() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        let digest = md5_digest(b"");
        assert_eq!(&hex_digest(&digest), b"d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_md5_known_vector() {
        // RFC 1321 test vector: MD5("abc").
        let digest = md5_digest(b"abc");
        assert_eq!(&hex_digest(&digest), b"900150983cd24fb0d6963f7d28e17f72");
    }
}
