//! Immutable description of how a Rust type maps onto a table.
//!
//! `EntityMapping` replaces the runtime `getattr`/`setattr` reflection this
//! design is descended from with a monomorphic record of type-erased
//! accessor closures, generated by `#[derive(Mapped)]`. The engine never
//! knows the concrete entity type past the boundary where the caller's
//! generic `get::<E>`/`save::<E>` call downcasts a `Box<dyn Any>` back to
//! `E`; everything in between — field reads/writes, child attach/detach,
//! parental-key stamping — goes through these closures instead.

use std::any::{Any, TypeId};
use std::sync::Arc;

use tokio_postgres::Row;

use crate::ast::Param;
use crate::error::{OrmError, OrmResult};
use crate::ident::Ident;

/// An owned, type-erased entity instance flowing through the engine.
pub type AnyEntity = Box<dyn Any + Send + Sync>;

/// The supported set of primary/parental key scalar types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    Timestamp(chrono::NaiveDateTime),
}

impl Scalar {
    pub fn from_row(row: &Row, column: &str) -> OrmResult<Self> {
        let decode_err = |e: tokio_postgres::Error| OrmError::decode(column, e.to_string());
        if let Ok(v) = row.try_get::<_, i64>(column) {
            return Ok(Scalar::I64(v));
        }
        if let Ok(v) = row.try_get::<_, i32>(column) {
            return Ok(Scalar::I32(v));
        }
        if let Ok(v) = row.try_get::<_, String>(column) {
            return Ok(Scalar::Text(v));
        }
        if let Ok(v) = row.try_get::<_, uuid::Uuid>(column) {
            return Ok(Scalar::Uuid(v));
        }
        if let Ok(v) = row.try_get::<_, bool>(column) {
            return Ok(Scalar::Bool(v));
        }
        row.try_get::<_, chrono::NaiveDateTime>(column)
            .map(Scalar::Timestamp)
            .map_err(decode_err)
    }

    pub fn to_param(&self) -> Param {
        match self {
            Scalar::I32(v) => Param::new(*v),
            Scalar::I64(v) => Param::new(*v),
            Scalar::Text(v) => Param::new(v.clone()),
            Scalar::Uuid(v) => Param::new(*v),
            Scalar::Bool(v) => Param::new(*v),
            Scalar::Timestamp(v) => Param::new(*v),
        }
    }
}

/// An ordered tuple of scalar values identifying one row (primary key,
/// parental key, or both concatenated to form a full identity).
pub type KeyValue = Vec<Scalar>;

/// Converts a concrete key-column field type into its [`Scalar`] form.
/// `#[derive(Mapped)]` requires this for every field named in a
/// `primary_key`/`parental_key` attribute.
pub trait ToScalar {
    fn to_scalar(&self) -> OrmResult<Scalar>;
}

/// Assigns a [`Scalar`] value into a concrete field, the inverse of
/// [`ToScalar`]. Used to stamp a child's parental-key fields with its
/// parent's primary key.
pub trait FromScalar {
    fn assign_from_scalar(&mut self, scalar: &Scalar);
}

macro_rules! scalar_conversions {
    ($ty:ty, $variant:ident) => {
        impl ToScalar for $ty {
            fn to_scalar(&self) -> OrmResult<Scalar> {
                Ok(Scalar::$variant(self.clone()))
            }
        }
        impl FromScalar for $ty {
            fn assign_from_scalar(&mut self, scalar: &Scalar) {
                if let Scalar::$variant(v) = scalar {
                    *self = v.clone();
                }
            }
        }
    };
}

scalar_conversions!(i32, I32);
scalar_conversions!(i64, I64);
scalar_conversions!(String, Text);
scalar_conversions!(uuid::Uuid, Uuid);
scalar_conversions!(bool, Bool);
scalar_conversions!(chrono::NaiveDateTime, Timestamp);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Singular,
    Plural,
}

/// One mapped field: a logical name, its column, and closures that move data
/// between a type-erased entity instance and the wire.
pub struct Field {
    pub name: &'static str,
    pub column: Ident,
    pub column_name: &'static str,
    pub insertable: bool,
    pub updatable: bool,
    /// Read the field's current value for binding into an INSERT/UPDATE parameter.
    pub get: Arc<dyn Fn(&dyn Any) -> Param + Send + Sync>,
    /// Read the field's current value as a [`Scalar`], for use as a key component.
    pub get_scalar_fn: Arc<dyn Fn(&dyn Any) -> OrmResult<Scalar> + Send + Sync>,
    /// Decode a returned row's column into the field, mutating the entity in place.
    pub set_from_row: Arc<dyn Fn(&mut dyn Any, &Row, &str) -> OrmResult<()> + Send + Sync>,
    /// Stamp a value known only as a [`Scalar`] directly (used for parental-key stamping).
    pub set_scalar: Arc<dyn Fn(&mut dyn Any, &Scalar) + Send + Sync>,
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("column_name", &self.column_name)
            .field("insertable", &self.insertable)
            .field("updatable", &self.updatable)
            .finish_non_exhaustive()
    }
}

/// One child relationship: a logical name, the child's mapped type, and
/// closures that detach children from a parent (for recursive processing)
/// and reattach the (possibly mutated) result.
pub struct Child {
    pub name: &'static str,
    pub target_type: TypeId,
    pub target_type_name: &'static str,
    pub arity: Arity,
    pub take: Arc<dyn Fn(&mut dyn Any) -> Vec<AnyEntity> + Send + Sync>,
    pub put: Arc<dyn Fn(&mut dyn Any, Vec<AnyEntity>) + Send + Sync>,
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("name", &self.name)
            .field("target_type", &self.target_type)
            .field("target_type_name", &self.target_type_name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// The full persistence description of one entity type.
pub struct EntityMapping {
    pub entity_type: TypeId,
    pub type_name: &'static str,
    pub schema: Ident,
    pub table: Ident,
    pub factory: Arc<dyn Fn() -> AnyEntity + Send + Sync>,
    pub fields: Vec<Field>,
    pub primary_key: Vec<&'static str>,
    pub parental_key: Vec<&'static str>,
    pub children: Vec<Child>,
}

impl std::fmt::Debug for EntityMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMapping")
            .field("entity_type", &self.entity_type)
            .field("type_name", &self.type_name)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("primary_key", &self.primary_key)
            .field("parental_key", &self.parental_key)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl EntityMapping {
    pub fn field(&self, name: &str) -> OrmResult<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| {
                OrmError::InvariantViolation(format!(
                    "mapping for '{}' has no field '{name}'",
                    self.type_name
                ))
            })
    }

    pub fn primary_key_fields(&self) -> OrmResult<Vec<&Field>> {
        self.primary_key.iter().map(|n| self.field(n)).collect()
    }

    pub fn parental_key_fields(&self) -> OrmResult<Vec<&Field>> {
        self.parental_key.iter().map(|n| self.field(n)).collect()
    }

    /// Fields written on INSERT.
    pub fn insertable_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.insertable).collect()
    }

    /// Fields written on UPDATE (primary-key columns are never updatable).
    pub fn updatable_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.updatable).collect()
    }

    /// primary_key ++ parental_key ++ every other field, in declared order.
    pub fn full_fields(&self) -> Vec<&Field> {
        self.fields.iter().collect()
    }

    pub fn primary_key_of(&self, entity: &dyn Any) -> OrmResult<KeyValue> {
        self.primary_key_fields()?
            .iter()
            .map(|f| f.get_scalar(entity))
            .collect()
    }

    pub fn parental_key_of(&self, entity: &dyn Any) -> OrmResult<KeyValue> {
        self.parental_key_fields()?
            .iter()
            .map(|f| f.get_scalar(entity))
            .collect()
    }

    pub fn hydrate(&self, entity: &mut dyn Any, row: &Row) -> OrmResult<()> {
        for field in &self.fields {
            (field.set_from_row)(entity, row, field.column_name)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> OrmResult<()> {
        if self.primary_key.is_empty() {
            return Err(OrmError::NoPrimaryKey(self.type_name));
        }
        for name in self.primary_key.iter().chain(self.parental_key.iter()) {
            if !self.fields.iter().any(|f| f.name == *name) {
                return Err(OrmError::InvariantViolation(format!(
                    "mapping for '{}' declares key field '{name}' with no matching field",
                    self.type_name
                )));
            }
        }
        for child in &self.children {
            if child.arity == Arity::Singular {
                // nothing further to check statically; cardinality is enforced at runtime
            }
        }
        Ok(())
    }
}

impl Field {
    pub fn get_scalar(&self, entity: &dyn Any) -> OrmResult<Scalar> {
        (self.get_scalar_fn)(entity)
    }
}

/// Implemented by `#[derive(Mapped)]`. Produces the [`EntityMapping`] once,
/// at [`crate::catalog::MappingCatalog`] construction time.
pub trait Mapped: Send + Sync + 'static {
    fn build_mapping() -> EntityMapping;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Widget {
        id: i64,
        account_id: i64,
        name: String,
    }

    fn widget_mapping() -> EntityMapping {
        let id_field = Field {
            name: "id",
            column: Ident::parse("id").unwrap(),
            column_name: "id",
            insertable: false,
            updatable: false,
            get: Arc::new(|e: &dyn Any| Param::new(e.downcast_ref::<Widget>().unwrap().id)),
            get_scalar_fn: Arc::new(|e: &dyn Any| Ok(Scalar::I64(e.downcast_ref::<Widget>().unwrap().id))),
            set_from_row: Arc::new(|e: &mut dyn Any, row: &Row, col: &str| {
                e.downcast_mut::<Widget>().unwrap().id = row.try_get(col).map_err(|err| OrmError::decode(col, err.to_string()))?;
                Ok(())
            }),
            set_scalar: Arc::new(|e: &mut dyn Any, s: &Scalar| {
                if let Scalar::I64(v) = s {
                    e.downcast_mut::<Widget>().unwrap().id = *v;
                }
            }),
        };
        let account_field = Field {
            name: "account_id",
            column: Ident::parse("account_id").unwrap(),
            column_name: "account_id",
            insertable: true,
            updatable: false,
            get: Arc::new(|e: &dyn Any| Param::new(e.downcast_ref::<Widget>().unwrap().account_id)),
            get_scalar_fn: Arc::new(|e: &dyn Any| Ok(Scalar::I64(e.downcast_ref::<Widget>().unwrap().account_id))),
            set_from_row: Arc::new(|e: &mut dyn Any, row: &Row, col: &str| {
                e.downcast_mut::<Widget>().unwrap().account_id =
                    row.try_get(col).map_err(|err| OrmError::decode(col, err.to_string()))?;
                Ok(())
            }),
            set_scalar: Arc::new(|e: &mut dyn Any, s: &Scalar| {
                if let Scalar::I64(v) = s {
                    e.downcast_mut::<Widget>().unwrap().account_id = *v;
                }
            }),
        };
        let name_field = Field {
            name: "name",
            column: Ident::parse("name").unwrap(),
            column_name: "name",
            insertable: true,
            updatable: true,
            get: Arc::new(|e: &dyn Any| Param::new(e.downcast_ref::<Widget>().unwrap().name.clone())),
            get_scalar_fn: Arc::new(|e: &dyn Any| Ok(Scalar::Text(e.downcast_ref::<Widget>().unwrap().name.clone()))),
            set_from_row: Arc::new(|e: &mut dyn Any, row: &Row, col: &str| {
                e.downcast_mut::<Widget>().unwrap().name =
                    row.try_get(col).map_err(|err| OrmError::decode(col, err.to_string()))?;
                Ok(())
            }),
            set_scalar: Arc::new(|e: &mut dyn Any, s: &Scalar| {
                if let Scalar::Text(v) = s {
                    e.downcast_mut::<Widget>().unwrap().name = v.clone();
                }
            }),
        };

        EntityMapping {
            entity_type: TypeId::of::<Widget>(),
            type_name: "Widget",
            schema: Ident::parse("public").unwrap(),
            table: Ident::parse("widgets").unwrap(),
            factory: Arc::new(|| Box::new(Widget::default())),
            fields: vec![id_field, account_field, name_field],
            primary_key: vec!["id"],
            parental_key: vec!["account_id"],
            children: Vec::new(),
        }
    }

    #[test]
    fn scalar_conversions_round_trip() {
        assert_eq!(42i32.to_scalar().unwrap(), Scalar::I32(42));
        assert_eq!("hi".to_string().to_scalar().unwrap(), Scalar::Text("hi".into()));

        let mut n = 0i64;
        n.assign_from_scalar(&Scalar::I64(7));
        assert_eq!(n, 7);

        // a mismatched variant leaves the field untouched
        n.assign_from_scalar(&Scalar::Bool(true));
        assert_eq!(n, 7);
    }

    #[test]
    fn insertable_and_updatable_fields_respect_flags() {
        let mapping = widget_mapping();
        let insertable: Vec<&str> = mapping.insertable_fields().iter().map(|f| f.name).collect();
        assert_eq!(insertable, vec!["account_id", "name"]);

        let updatable: Vec<&str> = mapping.updatable_fields().iter().map(|f| f.name).collect();
        assert_eq!(updatable, vec!["name"]);
    }

    #[test]
    fn primary_and_parental_key_of_read_through_closures() {
        let mapping = widget_mapping();
        let widget = Widget {
            id: 10,
            account_id: 99,
            name: "gizmo".into(),
        };
        assert_eq!(mapping.primary_key_of(&widget).unwrap(), vec![Scalar::I64(10)]);
        assert_eq!(mapping.parental_key_of(&widget).unwrap(), vec![Scalar::I64(99)]);
    }

    #[test]
    fn validate_rejects_missing_primary_key() {
        let mut mapping = widget_mapping();
        mapping.primary_key = Vec::new();
        assert!(matches!(mapping.validate(), Err(OrmError::NoPrimaryKey(_))));
    }

    #[test]
    fn field_lookup_reports_the_missing_name() {
        let mapping = widget_mapping();
        let err = mapping.field("nonexistent").unwrap_err();
        assert!(matches!(err, OrmError::InvariantViolation(_)));
    }
}

