//! Explicit, session-owned registry of entity mappings.
//!
//! This replaces a process-global mapping registry: an application builds one
//! `MappingCatalog` at startup from the `#[derive(Mapped)]` types it uses and
//! hands it to every `Session` it opens. Invariant checks run once here, not
//! on every engine operation.

use std::any::TypeId;
use std::collections::HashMap;

use crate::error::{OrmError, OrmResult};
use crate::mapping::{EntityMapping, Mapped};

pub struct MappingCatalog {
    mappings: HashMap<TypeId, EntityMapping>,
}

impl MappingCatalog {
    pub fn builder() -> MappingCatalogBuilder {
        MappingCatalogBuilder {
            mappings: HashMap::new(),
        }
    }

    pub fn get(&self, entity_type: TypeId) -> Option<&EntityMapping> {
        self.mappings.get(&entity_type)
    }

    pub fn require(&self, entity_type: TypeId, type_name: &'static str) -> OrmResult<&EntityMapping> {
        self.get(entity_type)
            .ok_or(OrmError::MappingNotFound(type_name))
    }
}

#[derive(Default, Debug)]
pub struct MappingCatalogBuilder {
    mappings: HashMap<TypeId, EntityMapping>,
}

impl MappingCatalogBuilder {
    pub fn register_mapped<T: Mapped>(self) -> OrmResult<Self> {
        self.register(T::build_mapping())
    }

    pub fn register(mut self, mapping: EntityMapping) -> OrmResult<Self> {
        mapping.validate()?;
        for child in &mapping.children {
            // The child's own mapping need not be registered yet (registration
            // order is the caller's choice); cross-mapping consistency
            // involving parental-key arity is checked lazily by the engine
            // the first time it actually recurses into this child.
            let _ = child.target_type;
        }
        self.mappings.insert(mapping.entity_type, mapping);
        Ok(self)
    }

    pub fn build(self) -> MappingCatalog {
        MappingCatalog {
            mappings: self.mappings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Ident;
    use std::any::{Any, TypeId};
    use std::sync::Arc;

    #[derive(Default)]
    struct Widget;

    fn widget_mapping() -> EntityMapping {
        EntityMapping {
            entity_type: TypeId::of::<Widget>(),
            type_name: "Widget",
            schema: Ident::parse("public").unwrap(),
            table: Ident::parse("widgets").unwrap(),
            factory: Arc::new(|| Box::new(Widget) as crate::mapping::AnyEntity),
            fields: vec![crate::mapping::Field {
                name: "id",
                column: Ident::parse("id").unwrap(),
                column_name: "id",
                insertable: false,
                updatable: false,
                get: Arc::new(|_: &dyn Any| crate::ast::Param::new(1_i64)),
                get_scalar_fn: Arc::new(|_: &dyn Any| Ok(crate::mapping::Scalar::I64(1))),
                set_from_row: Arc::new(|_, _, _| Ok(())),
                set_scalar: Arc::new(|_, _| {}),
            }],
            primary_key: vec!["id"],
            parental_key: vec![],
            children: Vec::new(),
        }
    }

    #[test]
    fn require_on_unregistered_type_is_mapping_not_found() {
        let catalog = MappingCatalog::builder().build();
        let err = catalog
            .require(TypeId::of::<Widget>(), "Widget")
            .unwrap_err();
        assert!(matches!(err, OrmError::MappingNotFound("Widget")));
    }

    #[test]
    fn register_rejects_a_mapping_with_no_primary_key() {
        let mut mapping = widget_mapping();
        mapping.primary_key = Vec::new();
        let err = MappingCatalog::builder().register(mapping).unwrap_err();
        assert!(matches!(err, OrmError::NoPrimaryKey("Widget")));
    }

    #[test]
    fn registered_mapping_is_found_by_type_id() {
        let catalog = MappingCatalog::builder().register(widget_mapping()).unwrap().build();
        assert!(catalog.get(TypeId::of::<Widget>()).is_some());
    }
}
