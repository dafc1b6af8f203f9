//! Core type definitions shared by every stratum crate.
//!
//! The engine is an explicit value: nothing in this crate is a process-wide
//! singleton. Configuration, topology and type descriptors are plain data
//! owned by whoever constructed them.

pub mod buffer;
pub mod config;
pub mod level;
pub mod topology;
pub mod typedesc;

pub use buffer::{DeviceStager, Placement, ProtectedBuffer};
pub use config::{Config, DcpMode, SerializerKind};
pub use level::{Level, StageState, StatusToken};
pub use topology::Topology;
pub use typedesc::{CompositeType, PrimitiveType, TypeDesc, TypeField, TypeId, TypeKind, TypeTable};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a protected variable, unique within a rank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VarId(pub u32);

impl VarId {
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one checkpoint cycle, monotonically increasing per run.
pub type CkptId = u32;
