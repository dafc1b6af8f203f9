//! Variable registry: the per-rank table of protected memory regions.
//!
//! The registry holds references (shared buffer handles), never ownership.
//! Ids come from the application and double as lookup keys; registration
//! order is the serialization order and stays stable across cycles.

use stratum_error::{Result, StratumError};
use stratum_types::{
    CompositeType, DeviceStager, Placement, ProtectedBuffer, TypeId, TypeTable, VarId,
};
use tracing::{debug, warn};

/// One protected variable.
#[derive(Debug, Clone)]
pub struct ProtectedVar {
    pub id: VarId,
    pub buffer: ProtectedBuffer,
    pub count: u64,
    pub type_id: TypeId,
    pub ele_size: u64,
    pub placement: Placement,
    /// Device-placed data must be staged to the host before serialization.
    pub host_sync_needed: bool,
    /// Dimension lengths for structured output, if declared.
    pub dims: Vec<u64>,
    /// Dataset name for structured output, if declared.
    pub name: Option<String>,
    /// Dataset group for structured output, if declared.
    pub group: Option<String>,
    /// Byte size last persisted by a committed checkpoint.
    pub stored_size: u64,
}

impl ProtectedVar {
    /// Current byte size, `count * ele_size`.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.count * self.ele_size
    }
}

/// Per-rank registry of protected variables plus the engine's type table.
#[derive(Debug, Default)]
pub struct DataRegistry {
    vars: Vec<ProtectedVar>,
    types: TypeTable,
}

impl DataRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            types: TypeTable::new(),
        }
    }

    /// The type table (primitives pre-seeded).
    #[must_use]
    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Register a sized opaque type.
    pub fn init_type(&mut self, size: usize, name: impl Into<String>) -> TypeId {
        self.types.init_type(size, name)
    }

    /// Register a composite type.
    pub fn init_composite(&mut self, size: usize, composite: CompositeType) -> Result<TypeId> {
        self.types.init_composite(size, composite)
    }

    fn position(&self, id: VarId) -> Option<usize> {
        self.vars.iter().position(|var| var.id == id)
    }

    /// Protect a user buffer under `id`.
    ///
    /// Re-protecting an existing id re-points the entry (new buffer, new
    /// count) and is observable in the next checkpoint. Re-protecting with
    /// a different type is an `IdReused` error.
    pub fn protect(
        &mut self,
        id: VarId,
        buffer: &ProtectedBuffer,
        count: u64,
        type_id: TypeId,
    ) -> Result<()> {
        let desc = self.types.get(type_id)?;
        let ele_size = desc.size as u64;
        if count * ele_size != buffer.len() as u64 {
            return Err(StratumError::config(format!(
                "variable {id}: {count} x {ele_size} bytes does not match a buffer of {} bytes",
                buffer.len()
            )));
        }
        if let Some(index) = self.position(id) {
            let var = &mut self.vars[index];
            if var.type_id != type_id {
                return Err(StratumError::IdReused { id: id.get() });
            }
            debug!(%id, count, "re-protecting variable");
            var.buffer = buffer.clone();
            var.count = count;
            return Ok(());
        }
        self.vars.push(ProtectedVar {
            id,
            buffer: buffer.clone(),
            count,
            type_id,
            ele_size,
            placement: Placement::Default,
            host_sync_needed: false,
            dims: Vec::new(),
            name: None,
            group: None,
            stored_size: 0,
        });
        debug!(%id, count, ele_size, "variable protected");
        Ok(())
    }

    /// Allocate an engine-owned region and protect it under a fresh id.
    pub fn protect_sized(
        &mut self,
        count: u64,
        type_id: TypeId,
        placement: Placement,
    ) -> Result<(VarId, ProtectedBuffer)> {
        let desc = self.types.get(type_id)?;
        let id = VarId(
            self.vars
                .iter()
                .map(|var| var.id.get() + 1)
                .max()
                .unwrap_or(0),
        );
        let buffer = ProtectedBuffer::zeroed((count * desc.size as u64) as usize);
        self.vars.push(ProtectedVar {
            id,
            buffer: buffer.clone(),
            count,
            type_id,
            ele_size: desc.size as u64,
            placement,
            host_sync_needed: placement == Placement::Device,
            dims: Vec::new(),
            name: None,
            group: None,
            stored_size: 0,
        });
        Ok((id, buffer))
    }

    /// Drop a variable from the registry. Its containers in the current
    /// chain survive without content.
    pub fn free(&mut self, id: VarId) -> Result<()> {
        let index = self
            .position(id)
            .ok_or(StratumError::UnknownVariable { id: id.get() })?;
        self.vars.remove(index);
        Ok(())
    }

    /// Resize a variable in place; growth zero-fills.
    pub fn realloc(&mut self, id: VarId, new_count: u64) -> Result<ProtectedBuffer> {
        let index = self
            .position(id)
            .ok_or(StratumError::UnknownVariable { id: id.get() })?;
        let var = &mut self.vars[index];
        var.buffer.resize((new_count * var.ele_size) as usize);
        var.count = new_count;
        Ok(var.buffer.clone())
    }

    /// Attach structured-output metadata to a variable.
    pub fn define_dataset(
        &mut self,
        id: VarId,
        dims: Vec<u64>,
        name: impl Into<String>,
        group: Option<String>,
    ) -> Result<()> {
        let index = self
            .position(id)
            .ok_or(StratumError::UnknownVariable { id: id.get() })?;
        let var = &mut self.vars[index];
        let elements: u64 = dims.iter().product();
        if elements != var.count {
            warn!(
                %id,
                elements,
                count = var.count,
                "dataset dimensions do not cover the variable"
            );
        }
        var.dims = dims;
        var.name = Some(name.into());
        var.group = group;
        Ok(())
    }

    /// Byte size last persisted for `id` (0 before the first commit).
    pub fn stored_size(&self, id: VarId) -> Result<u64> {
        self.get(id).map(|var| var.stored_size)
    }

    /// Record persisted sizes after a commit or recovery.
    pub fn set_stored_sizes(&mut self, sizes: &[(VarId, u64)]) {
        for &(id, size) in sizes {
            if let Some(index) = self.position(id) {
                self.vars[index].stored_size = size;
            }
        }
    }

    pub fn get(&self, id: VarId) -> Result<&ProtectedVar> {
        self.position(id)
            .map(|index| &self.vars[index])
            .ok_or(StratumError::UnknownVariable { id: id.get() })
    }

    /// All variables in registration order.
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, ProtectedVar> {
        self.vars.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total protected bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.vars.iter().map(ProtectedVar::byte_size).sum()
    }

    /// Pull device-placed variables into their host mirrors.
    pub fn stage_device_vars(&mut self, stager: Option<&dyn DeviceStager>) -> Result<()> {
        for var in &mut self.vars {
            if var.placement != Placement::Device || !var.host_sync_needed {
                continue;
            }
            let Some(stager) = stager else {
                return Err(StratumError::config(format!(
                    "variable {} is device-placed but no device stager is installed",
                    var.id
                )));
            };
            let mut guard = var.buffer.write();
            stager.stage_to_host(var.id, &mut guard)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_types::PrimitiveType;

    fn registry_with(id: u32, len: usize) -> (DataRegistry, ProtectedBuffer) {
        let mut registry = DataRegistry::new();
        let buffer = ProtectedBuffer::zeroed(len);
        registry
            .protect(
                VarId(id),
                &buffer,
                len as u64,
                PrimitiveType::Char.type_id(),
            )
            .unwrap();
        (registry, buffer)
    }

    #[test]
    fn test_protect_checks_size_arithmetic() {
        let mut registry = DataRegistry::new();
        let buffer = ProtectedBuffer::zeroed(100);
        // 100 bytes is not 100 doubles.
        let err = registry
            .protect(VarId(1), &buffer, 100, PrimitiveType::Double.type_id())
            .unwrap_err();
        assert!(matches!(err, StratumError::ConfigInvalid { .. }));
        registry
            .protect(VarId(1), &buffer, 100, PrimitiveType::Char.type_id())
            .unwrap();
    }

    #[test]
    fn test_reprotect_repoints_same_type() {
        let (mut registry, _old) = registry_with(1, 64);
        let new_buffer = ProtectedBuffer::zeroed(128);
        registry
            .protect(VarId(1), &new_buffer, 128, PrimitiveType::Char.type_id())
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(VarId(1)).unwrap().buffer.same_region(&new_buffer));
    }

    #[test]
    fn test_reprotect_with_new_type_is_id_reuse() {
        let (mut registry, _buffer) = registry_with(1, 64);
        let other = ProtectedBuffer::zeroed(64);
        let err = registry
            .protect(VarId(1), &other, 8, PrimitiveType::Double.type_id())
            .unwrap_err();
        assert!(matches!(err, StratumError::IdReused { id: 1 }));
    }

    #[test]
    fn test_protect_sized_allocates_fresh_ids() {
        let mut registry = DataRegistry::new();
        let (id_a, buf_a) =
            registry
                .protect_sized(16, PrimitiveType::Double.type_id(), Placement::Fast)
                .unwrap();
        let (id_b, _) = registry
            .protect_sized(4, PrimitiveType::Int.type_id(), Placement::Default)
            .unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(buf_a.len(), 128);
        assert_eq!(registry.total_size(), 128 + 16);
    }

    #[test]
    fn test_realloc_resizes_and_keeps_region() {
        let (mut registry, buffer) = registry_with(1, 64);
        buffer.write()[0] = 0x42;
        let handle = registry.realloc(VarId(1), 256).unwrap();
        assert!(handle.same_region(&buffer));
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.read()[0], 0x42);
        assert_eq!(registry.get(VarId(1)).unwrap().byte_size(), 256);
    }

    #[test]
    fn test_define_dataset_records_shape() {
        let mut registry = DataRegistry::new();
        let buffer = ProtectedBuffer::zeroed(16 * 16 * 8);
        registry
            .protect(
                VarId(1),
                &buffer,
                16 * 16,
                PrimitiveType::Double.type_id(),
            )
            .unwrap();
        registry
            .define_dataset(VarId(1), vec![16, 16], "temperature", Some("fields".to_owned()))
            .unwrap();
        let var = registry.get(VarId(1)).unwrap();
        assert_eq!(var.dims, vec![16, 16]);
        assert_eq!(var.name.as_deref(), Some("temperature"));
        assert_eq!(var.group.as_deref(), Some("fields"));

        assert!(registry
            .define_dataset(VarId(9), vec![1], "missing", None)
            .is_err());
    }

    #[test]
    fn test_free_and_stored_size() {
        let (mut registry, _buffer) = registry_with(1, 64);
        registry.set_stored_sizes(&[(VarId(1), 64)]);
        assert_eq!(registry.stored_size(VarId(1)).unwrap(), 64);
        registry.free(VarId(1)).unwrap();
        assert!(matches!(
            registry.stored_size(VarId(1)),
            Err(StratumError::UnknownVariable { id: 1 })
        ));
    }

    #[test]
    fn test_device_var_requires_stager() {
        let mut registry = DataRegistry::new();
        registry
            .protect_sized(8, PrimitiveType::Char.type_id(), Placement::Device)
            .unwrap();
        assert!(registry.stage_device_vars(None).is_err());

        struct FillStager;
        impl DeviceStager for FillStager {
            fn stage_to_host(&self, _id: VarId, host: &mut [u8]) -> Result<()> {
                host.fill(0xD7);
                Ok(())
            }
        }
        registry.stage_device_vars(Some(&FillStager)).unwrap();
        let var = registry.iter().next().unwrap();
        assert!(var.buffer.read().iter().all(|&byte| byte == 0xD7));
    }
}
