//! `Session`: the single entry point applications use. Ties the mapping
//! catalog, identity map, aggregate engine, query builder, and paginator
//! together behind one backend connection.
//!
//! Model each session as a sequential state machine driven by one logical
//! task at a time — the identity map carries no internal locking, so
//! concurrent access from two tasks is a caller bug, not a compile error.
//! Suspension only happens at backend calls; nothing here spawns work of its
//! own.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tokio_postgres::Row;

use crate::ast::{Param, Renderer};
use crate::builder::{self, QueryBuilder};
use crate::catalog::MappingCatalog;
use crate::client::GenericClient;
use crate::engine;
use crate::error::{OrmError, OrmResult};
use crate::fragment;
use crate::identity::IdentityMap;
use crate::mapping::{AnyEntity, EntityMapping, KeyValue, Mapped, Scalar, ToScalar};
use crate::paginate::{self, Page, PageRequest};
use crate::transaction::{Tx, TransactionScope};

/// Converts an ergonomic Rust value into the [`KeyValue`] the engine keys
/// rows by: a bare scalar for a single-column primary key, a tuple or an
/// explicit `Vec<Scalar>` for a composite one.
pub trait IntoKeyValue {
    fn into_key_value(self) -> OrmResult<KeyValue>;
}

impl IntoKeyValue for KeyValue {
    fn into_key_value(self) -> OrmResult<KeyValue> {
        Ok(self)
    }
}

impl IntoKeyValue for Scalar {
    fn into_key_value(self) -> OrmResult<KeyValue> {
        Ok(vec![self])
    }
}

macro_rules! scalar_key {
    ($ty:ty) => {
        impl IntoKeyValue for $ty {
            fn into_key_value(self) -> OrmResult<KeyValue> {
                Ok(vec![self.to_scalar()?])
            }
        }
    };
}

scalar_key!(i32);
scalar_key!(i64);
scalar_key!(String);
scalar_key!(uuid::Uuid);
scalar_key!(bool);
scalar_key!(chrono::NaiveDateTime);

impl IntoKeyValue for &str {
    fn into_key_value(self) -> OrmResult<KeyValue> {
        Ok(vec![self.to_string().to_scalar()?])
    }
}

impl<A: ToScalar, B: ToScalar> IntoKeyValue for (A, B) {
    fn into_key_value(self) -> OrmResult<KeyValue> {
        Ok(vec![self.0.to_scalar()?, self.1.to_scalar()?])
    }
}

impl<A: ToScalar, B: ToScalar, C: ToScalar> IntoKeyValue for (A, B, C) {
    fn into_key_value(self) -> OrmResult<KeyValue> {
        Ok(vec![self.0.to_scalar()?, self.1.to_scalar()?, self.2.to_scalar()?])
    }
}

fn downcast<E: Mapped + 'static>(entity: AnyEntity) -> OrmResult<E> {
    entity
        .downcast::<E>()
        .map(|boxed| *boxed)
        .map_err(|_| OrmError::InvariantViolation("downcast to mapped type failed".into()))
}

pub struct Session<C: GenericClient> {
    catalog: Arc<MappingCatalog>,
    identity: IdentityMap,
    client: C,
    scope: TransactionScope,
}

impl<C: GenericClient> Session<C> {
    pub fn new(catalog: Arc<MappingCatalog>, client: C) -> Self {
        Self {
            catalog,
            identity: IdentityMap::new(),
            client,
            scope: TransactionScope::new(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn catalog(&self) -> &MappingCatalog {
        &self.catalog
    }

    fn mapping_of<E: Mapped + 'static>(&self) -> OrmResult<&EntityMapping> {
        self.catalog.require(TypeId::of::<E>(), std::any::type_name::<E>())
    }

    /// Fetches entities by primary key, preserving input order; keys with no
    /// matching row come back as `None`.
    pub async fn batch_get<E, K>(&mut self, keys: Vec<K>) -> OrmResult<Vec<Option<E>>>
    where
        E: Mapped + 'static,
        K: IntoKeyValue,
    {
        let primary_key = self.mapping_of::<E>()?.primary_key.clone();
        let key_values: Vec<KeyValue> = keys
            .into_iter()
            .map(IntoKeyValue::into_key_value)
            .collect::<OrmResult<_>>()?;

        let mut grouped = engine::get_by(
            &self.client,
            &self.catalog,
            &mut self.identity,
            TypeId::of::<E>(),
            std::any::type_name::<E>(),
            primary_key,
            key_values.clone(),
        )
        .await?;

        key_values
            .into_iter()
            .map(|k| match grouped.remove(&k).and_then(|mut v| v.pop()) {
                Some(entity) => downcast::<E>(entity).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    pub async fn get<E, K>(&mut self, key: K) -> OrmResult<Option<E>>
    where
        E: Mapped + 'static,
        K: IntoKeyValue,
    {
        Ok(self.batch_get::<E, K>(vec![key]).await?.into_iter().next().flatten())
    }

    /// Upserts each root and reconciles its descendants, returning the
    /// entities with server-assigned values (generated keys, defaulted
    /// columns) hydrated back in, in input order.
    pub async fn batch_save<E: Mapped + 'static>(&mut self, entities: Vec<E>) -> OrmResult<Vec<E>> {
        let any_entities: Vec<AnyEntity> = entities.into_iter().map(|e| Box::new(e) as AnyEntity).collect();
        let saved = engine::save(
            &self.client,
            &self.catalog,
            &mut self.identity,
            TypeId::of::<E>(),
            std::any::type_name::<E>(),
            any_entities,
        )
        .await?;
        saved.into_iter().map(downcast::<E>).collect()
    }

    pub async fn save<E: Mapped + 'static>(&mut self, entity: E) -> OrmResult<E> {
        Ok(self
            .batch_save(vec![entity])
            .await?
            .into_iter()
            .next()
            .expect("batch_save returns one entity per input"))
    }

    /// Deletes roots and every transitively tracked descendant.
    pub async fn batch_delete<E: Mapped + 'static>(&mut self, entities: &[E]) -> OrmResult<()> {
        let mapping = self.mapping_of::<E>()?;
        let items = entities
            .iter()
            .map(|e| {
                let entity: &dyn Any = e;
                Ok((mapping.parental_key_of(entity)?, mapping.primary_key_of(entity)?))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        engine::delete(
            &self.client,
            &self.catalog,
            &mut self.identity,
            TypeId::of::<E>(),
            std::any::type_name::<E>(),
            items,
        )
        .await
    }

    pub async fn delete<E: Mapped + 'static>(&mut self, entity: &E) -> OrmResult<()> {
        self.batch_delete(std::slice::from_ref(entity)).await
    }

    pub fn query<E: Mapped>(&self, alias: &str) -> OrmResult<QueryBuilder<E>> {
        QueryBuilder::new(alias)
    }

    pub async fn fetch<E: Mapped + 'static>(
        &mut self,
        builder: &QueryBuilder<E>,
        limit: Option<i64>,
        offset: i64,
    ) -> OrmResult<Vec<E>> {
        builder::fetch(builder, &self.client, &self.catalog, &mut self.identity, limit, offset).await
    }

    pub async fn count<E: Mapped + 'static>(&self, builder: &QueryBuilder<E>) -> OrmResult<i64> {
        builder::count(builder, &self.client, &self.catalog).await
    }

    pub async fn paginate<E: Mapped + 'static>(
        &mut self,
        builder: &QueryBuilder<E>,
        request: PageRequest,
    ) -> OrmResult<Page<E>> {
        paginate::paginate(builder, &self.client, &self.catalog, &mut self.identity, request).await
    }

    /// Executes an ad hoc `:name`-placeholder SQL fragment, returning raw
    /// rows with no entity hydration — an escape hatch for statements the
    /// builder/engine don't shape (aggregates, DDL, bulk reporting queries).
    pub async fn fetch_raw(&self, sql: &str, values: &HashMap<String, Param>) -> OrmResult<Vec<Row>> {
        let (node, param_map) = fragment::parse(sql, values)?;
        let mut r = Renderer::new();
        let rendered = r.render(&node)?;
        let bound = r.bind(&param_map)?;
        self.client.query(&rendered, &bound).await
    }

    /// Runs `body` in a transaction scope, nesting via `SAVEPOINT` when
    /// called while already inside one. On `Ok`, commits (or releases the
    /// savepoint) and keeps the identity map as `body` left it. On `Err`,
    /// rolls back (or to the savepoint) and restores the identity map to how
    /// it stood before `body` ran, so a failed nested operation never leaves
    /// the session believing it tracks rows the rollback undid.
    pub async fn tx<T, F, Fut>(&mut self, body: F) -> OrmResult<T>
    where
        F: FnOnce(&mut Tx<'_, C>) -> Fut,
        Fut: std::future::Future<Output = OrmResult<T>>,
    {
        let snapshot = self.identity.snapshot();
        let name = self.scope.begin(&self.client).await?;
        let mut tx = Tx { session: self };
        match body(&mut tx).await {
            Ok(value) => {
                tx.session.scope.commit(&tx.session.client, &name).await?;
                Ok(value)
            }
            Err(error) => {
                tx.session.scope.rollback(&tx.session.client, &name).await?;
                tx.session.identity.restore(snapshot);
                Err(error)
            }
        }
    }
}
