//! Shared handles to protected user memory.
//!
//! The registry holds a *reference* to the application's buffer, never
//! ownership. `ProtectedBuffer` is that reference: a cheaply clonable
//! handle the application writes through between checkpoints and the
//! engine reads from at quiesce points.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use stratum_error::Result;

use crate::VarId;

/// Memory placement tag for a protected variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Regular host memory.
    Default,
    /// High-bandwidth tier.
    Fast,
    /// Capacity tier.
    Slow,
    /// Device memory with a host mirror; must be staged before serializing.
    Device,
}

/// Callback that pulls device-resident bytes into the host mirror before a
/// serializer reads them.
pub trait DeviceStager: Send + Sync {
    /// Fill `host` with the current device contents of variable `id`.
    fn stage_to_host(&self, id: VarId, host: &mut [u8]) -> Result<()>;
}

/// Clonable handle to one protected memory region.
#[derive(Debug, Clone, Default)]
pub struct ProtectedBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl ProtectedBuffer {
    /// Allocate a zeroed region of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(vec![0_u8; len])),
        }
    }

    /// Wrap existing bytes.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Current length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Read access for serializers.
    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read()
    }

    /// Write access for the application and for recovery.
    #[must_use]
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.write()
    }

    /// Resize in place, zero-filling growth.
    pub fn resize(&self, new_len: usize) {
        self.inner.write().resize(new_len, 0);
    }

    /// Whether two handles reference the same region.
    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_the_region() {
        let buf = ProtectedBuffer::zeroed(8);
        let alias = buf.clone();
        alias.write()[3] = 0xAB;
        assert_eq!(buf.read()[3], 0xAB);
        assert!(buf.same_region(&alias));
    }

    #[test]
    fn test_resize_zero_fills() {
        let buf = ProtectedBuffer::from_vec(vec![1, 2, 3]);
        buf.resize(5);
        assert_eq!(&*buf.read(), &[1, 2, 3, 0, 0]);
        buf.resize(2);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_independent_buffers_are_distinct() {
        let a = ProtectedBuffer::zeroed(4);
        let b = ProtectedBuffer::zeroed(4);
        assert!(!a.same_region(&b));
    }
}
