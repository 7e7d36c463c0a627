//! # pgaggregate
//!
//! A lightweight object-relational aggregate-persistence layer over
//! PostgreSQL: entities declare a tree shape (a root and its owned children)
//! via `#[derive(Mapped)]`, and a [`Session`] loads, saves, and deletes whole
//! aggregates in batches, diffing child sets against what it last saw rather
//! than requiring the caller to issue individual child inserts/deletes.
//!
//! ## Shape
//!
//! - [`mapping`] / `pgaggregate_derive::Mapped` — declare how a Rust type maps onto a table.
//! - [`catalog`] — an explicit, application-owned registry of those mappings.
//! - [`engine`] — the batched select/save/delete traversal over a mapped aggregate tree.
//! - [`builder`] / [`paginate`] — composable filtering, sorting, and keyset-cursor pagination.
//! - [`ast`] / [`ident`] / [`fragment`] — the tagged SQL AST, identifier quoting, and `:name`-placeholder parsing everything above renders through.
//! - [`session`] — ties all of the above together behind one backend connection.

pub mod ast;
pub mod builder;
pub mod catalog;
pub mod client;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod ident;
pub mod identity;
pub mod mapping;
pub mod paginate;
pub mod row;
pub mod session;
pub mod transaction;

pub use ast::{Node, Param, ParamId, ParamMap};
pub use builder::{JoinKind, QueryBuilder};
pub use catalog::MappingCatalog;
pub use client::GenericClient;
pub use error::{OrmError, OrmResult};
pub use ident::Ident;
pub use identity::IdentityMap;
pub use mapping::{EntityMapping, KeyValue, Mapped, Scalar};
pub use paginate::{Cursor, Page, PageRequest};
pub use row::RowExt;
pub use session::{IntoKeyValue, Session};
pub use transaction::{Tx, TransactionScope};

#[cfg(feature = "pool")]
pub mod pool;

#[cfg(feature = "pool")]
pub use client::PoolClient;

#[cfg(feature = "pool")]
pub use pool::{
    create_pool, create_pool_with_config, create_pool_with_manager_config, create_pool_with_tls,
    session_from_pool,
};

#[cfg(feature = "derive")]
pub use pgaggregate_derive::Mapped;
