//! Row access utilities.
//!
//! Entities are hydrated positionally through [`crate::mapping::EntityMapping::hydrate`]
//! rather than a derived per-struct decoder — there is no implicit
//! column-name mapping surface here to derive against. This module only
//! re-exports the row type the derive macro's generated code and
//! [`RowExt`] operate on.

pub use tokio_postgres::Row;

/// Extension trait for [`Row`] giving callers of [`crate::Session::fetch_raw`]
/// a typed getter that reports decode failures as `OrmError::Decode` instead
/// of `tokio_postgres::Error`.
pub trait RowExt {
    fn try_get_column<T>(&self, column: &str) -> crate::error::OrmResult<T>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>;
}

impl RowExt for Row {
    fn try_get_column<T>(&self, column: &str) -> crate::error::OrmResult<T>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>,
    {
        self.try_get(column)
            .map_err(|e| crate::error::OrmError::decode(column, e.to_string()))
    }
}
