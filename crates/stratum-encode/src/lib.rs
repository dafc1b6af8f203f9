//! Level encoders for the checkpoint hierarchy.
//!
//! L1 is a plain container write handled by the engine; this crate covers
//! what the higher levels add on top: the L2 partner ring exchange, the L3
//! Reed-Solomon group encoding with its GF(2^16) arithmetic, and the L4
//! flush strategies targeting the parallel filesystem.

pub mod galois;
pub mod level2;
pub mod level3;
pub mod level4;
pub mod rs;

pub use level2::{PartnerCopy, exchange_partner};
pub use level3::{GroupDecode, GroupEncode, ParityFragment, decode_group, encode_group};
pub use level4::{CkptWriter, FlushReceipt, PosixWriter, copy_file_atomic, file_digest, writer_for};
pub use rs::{PARITY_SHARDS, RsCode};
