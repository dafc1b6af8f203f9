//! Data type descriptors for protected variables.
//!
//! Primitive descriptors are constants owned by the [`TypeTable`] and
//! returned by value; composites form a DAG because a field may only
//! reference a type that already exists in the table.

use serde::{Deserialize, Serialize};
use stratum_error::{Result, StratumError};

/// Handle to a registered type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TypeId(pub u32);

impl TypeId {
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Fixed-width primitive families recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    LongDouble,
}

impl PrimitiveType {
    /// All primitives in table registration order.
    pub const ALL: [Self; 11] = [
        Self::Char,
        Self::UChar,
        Self::Short,
        Self::UShort,
        Self::Int,
        Self::UInt,
        Self::Long,
        Self::ULong,
        Self::Float,
        Self::Double,
        Self::LongDouble,
    ];

    /// Element size in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Long | Self::ULong | Self::Double => 8,
            Self::LongDouble => 16,
        }
    }

    /// The table id this primitive is seeded under.
    #[must_use]
    pub fn type_id(self) -> TypeId {
        let index = Self::ALL
            .iter()
            .position(|p| *p == self)
            .expect("every primitive appears in ALL");
        TypeId(index as u32)
    }
}

/// One named field of a composite type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeField {
    /// Type of the field; must already exist in the table.
    pub type_id: TypeId,
    /// Byte offset inside the composite.
    pub offset: usize,
    /// Dimension lengths; empty means scalar.
    pub dims: Vec<usize>,
    /// Field name for structured output.
    pub name: String,
}

impl TypeField {
    /// Number of elements covered by the dimensions (1 for scalars).
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.dims.iter().product::<usize>().max(1)
    }
}

/// A composite of named fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeType {
    pub name: String,
    pub fields: Vec<TypeField>,
}

/// What a registered type is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    Primitive(PrimitiveType),
    /// Sized but structurally opaque; byte-oriented writers see only bytes.
    Opaque,
    Composite(CompositeType),
}

/// Full descriptor of a registered type, returned by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub id: TypeId,
    pub size: usize,
    pub name: String,
    pub kind: TypeKind,
}

/// Per-engine registry of type descriptors.
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<TypeDesc>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// Create a table pre-seeded with all primitive descriptors.
    #[must_use]
    pub fn new() -> Self {
        let types = PrimitiveType::ALL
            .iter()
            .enumerate()
            .map(|(index, &prim)| TypeDesc {
                id: TypeId(index as u32),
                size: prim.size(),
                name: format!("{prim:?}"),
                kind: TypeKind::Primitive(prim),
            })
            .collect();
        Self { types }
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Fetch a descriptor by id.
    pub fn get(&self, id: TypeId) -> Result<TypeDesc> {
        self.types
            .get(id.get() as usize)
            .cloned()
            .ok_or_else(|| StratumError::OutOfRange {
                what: "type id".to_owned(),
                value: id.get().to_string(),
            })
    }

    /// Register a sized opaque type.
    pub fn init_type(&mut self, size: usize, name: impl Into<String>) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            size,
            name: name.into(),
            kind: TypeKind::Opaque,
        });
        id
    }

    /// Register a composite type.
    ///
    /// Fields may only reference already-registered types, which makes the
    /// reference graph a DAG by construction. `size` must cover every field.
    pub fn init_composite(&mut self, size: usize, composite: CompositeType) -> Result<TypeId> {
        for field in &composite.fields {
            let field_type = self.get(field.type_id)?;
            let span = field.offset + field_type.size * field.element_count();
            if span > size {
                return Err(StratumError::config(format!(
                    "field '{}' of composite '{}' spans {span} bytes, beyond declared size {size}",
                    field.name, composite.name
                )));
            }
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDesc {
            id,
            size,
            name: composite.name.clone(),
            kind: TypeKind::Composite(composite),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_seeded() {
        let table = TypeTable::new();
        assert_eq!(table.len(), 11);
        let double = table.get(PrimitiveType::Double.type_id()).unwrap();
        assert_eq!(double.size, 8);
        assert!(matches!(
            double.kind,
            TypeKind::Primitive(PrimitiveType::Double)
        ));
    }

    #[test]
    fn test_opaque_type_registration() {
        let mut table = TypeTable::new();
        let id = table.init_type(24, "particle");
        let desc = table.get(id).unwrap();
        assert_eq!(desc.size, 24);
        assert!(matches!(desc.kind, TypeKind::Opaque));
    }

    #[test]
    fn test_composite_fields_must_fit() {
        let mut table = TypeTable::new();
        let composite = CompositeType {
            name: "pair".to_owned(),
            fields: vec![
                TypeField {
                    type_id: PrimitiveType::Int.type_id(),
                    offset: 0,
                    dims: vec![],
                    name: "a".to_owned(),
                },
                TypeField {
                    type_id: PrimitiveType::Double.type_id(),
                    offset: 8,
                    dims: vec![],
                    name: "b".to_owned(),
                },
            ],
        };
        let id = table.init_composite(16, composite.clone()).unwrap();
        assert_eq!(table.get(id).unwrap().size, 16);

        let err = table.init_composite(12, composite).unwrap_err();
        assert!(matches!(err, StratumError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_composite_array_field_span() {
        let mut table = TypeTable::new();
        let composite = CompositeType {
            name: "grid".to_owned(),
            fields: vec![TypeField {
                type_id: PrimitiveType::Float.type_id(),
                offset: 0,
                dims: vec![4, 4],
                name: "cells".to_owned(),
            }],
        };
        assert!(table.init_composite(64, composite.clone()).is_ok());
        assert!(table.init_composite(32, composite).is_err());
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let mut table = TypeTable::new();
        let composite = CompositeType {
            name: "broken".to_owned(),
            fields: vec![TypeField {
                type_id: TypeId(999),
                offset: 0,
                dims: vec![],
                name: "x".to_owned(),
            }],
        };
        assert!(table.init_composite(8, composite).is_err());
    }
}
