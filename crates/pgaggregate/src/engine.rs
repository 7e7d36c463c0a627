//! The aggregate persistence engine: batched select/save/delete traversal
//! over the tree of a mapped root entity and its declared children.
//!
//! Every public entry point is type-erased (`AnyEntity = Box<dyn Any + Send
//! + Sync>`) so the same recursive functions serve the root call and every
//! nested child level without the engine ever being generic over a concrete
//! entity type; [`crate::session::Session`] is the only place that downcasts
//! back to the caller's concrete type.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use tokio_postgres::Row;

use crate::ast::{Node, ParamIdGen, ParamMap, Renderer};
use crate::catalog::MappingCatalog;
use crate::client::GenericClient;
use crate::error::{OrmError, OrmResult};
use crate::identity::{EntityIdentity, IdentityMap};
use crate::mapping::{AnyEntity, EntityMapping, Field, KeyValue};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn read_key_from_row(mapping: &EntityMapping, names: &[&str], row: &Row) -> OrmResult<KeyValue> {
    names
        .iter()
        .map(|n| {
            let field = mapping.field(n)?;
            crate::mapping::Scalar::from_row(row, field.column_name)
        })
        .collect()
}

fn or_of_and(
    param_gen: &mut ParamIdGen,
    param_map: &mut ParamMap,
    mapping: &EntityMapping,
    columns: &[&str],
    values: &[KeyValue],
) -> OrmResult<Node> {
    let mut ors = Vec::with_capacity(values.len());
    for value in values {
        let mut ands = Vec::with_capacity(columns.len());
        for (col, scalar) in columns.iter().zip(value.iter()) {
            let field = mapping.field(col)?;
            let id = param_gen.next();
            param_map.insert(id, scalar.to_param());
            ands.push(Node::eq(Node::col(&field.column), Node::Param(id)));
        }
        ors.push(Node::All(ands));
    }
    Ok(Node::Any(ors))
}

fn column_list(fields: &[&Field]) -> String {
    fields.iter().map(|f| f.column.to_sql()).collect::<Vec<_>>().join(", ")
}

fn table_sql(mapping: &EntityMapping) -> String {
    format!("{}.{}", mapping.schema.to_sql(), mapping.table.to_sql())
}

async fn select_by(
    client: &impl GenericClient,
    mapping: &EntityMapping,
    columns: &[&str],
    values: &[KeyValue],
) -> OrmResult<Vec<Row>> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut param_gen = ParamIdGen::new();
    let mut param_map = ParamMap::new();
    let predicate = or_of_and(&mut param_gen, &mut param_map, mapping, columns, values)?;
    let mut r = Renderer::new();
    let where_sql = r.render(&predicate)?;
    let fields = mapping.full_fields();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        column_list(&fields),
        table_sql(mapping),
        where_sql
    );
    let bound = r.bind(&param_map)?;
    client.query(&sql, &bound).await
}

async fn delete_by(
    client: &impl GenericClient,
    mapping: &EntityMapping,
    columns: &[&str],
    values: &[KeyValue],
) -> OrmResult<Vec<Row>> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut param_gen = ParamIdGen::new();
    let mut param_map = ParamMap::new();
    let predicate = or_of_and(&mut param_gen, &mut param_map, mapping, columns, values)?;
    let mut r = Renderer::new();
    let where_sql = r.render(&predicate)?;
    let pk_fields = mapping.primary_key_fields()?;
    let sql = format!(
        "DELETE FROM {} WHERE {} RETURNING {}",
        table_sql(mapping),
        where_sql,
        column_list(&pk_fields)
    );
    let bound = r.bind(&param_map)?;
    client.query(&sql, &bound).await
}

/// `UPDATE t SET c = v.c, ... FROM (VALUES (...), (...)) AS v(pk..., cols...)
/// WHERE t.pk = v.pk RETURNING t.*` — one round trip for the whole batch.
async fn update_batch(
    client: &impl GenericClient,
    mapping: &EntityMapping,
    entities: &[&(dyn std::any::Any + Send + Sync)],
) -> OrmResult<Vec<Row>> {
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    let pk_fields = mapping.primary_key_fields()?;
    let set_fields = mapping.updatable_fields();
    if set_fields.is_empty() {
        // Nothing to change; still confirm the rows exist and return current state.
        let keys: Vec<KeyValue> = entities
            .iter()
            .map(|e| mapping.primary_key_of(*e))
            .collect::<OrmResult<_>>()?;
        return select_by(client, mapping, &mapping.primary_key, &keys).await;
    }

    let mut param_gen = ParamIdGen::new();
    let mut param_map = ParamMap::new();
    let mut value_rows = Vec::with_capacity(entities.len());
    let mut r = Renderer::new();

    for entity in entities {
        let mut tuple = Vec::with_capacity(pk_fields.len() + set_fields.len());
        for f in pk_fields.iter().chain(set_fields.iter()) {
            let id = param_gen.next();
            param_map.insert(id, (f.get)(*entity));
            tuple.push(r.render(&Node::Param(id))?);
        }
        value_rows.push(format!("({})", tuple.join(", ")));
    }

    let v_cols: Vec<String> = pk_fields
        .iter()
        .chain(set_fields.iter())
        .map(|f| f.column.to_sql())
        .collect();
    let join_on = pk_fields
        .iter()
        .map(|f| format!("t.{0} = v.{0}", f.column.to_sql()))
        .collect::<Vec<_>>()
        .join(" AND ");
    let set_clause = set_fields
        .iter()
        .map(|f| format!("{0} = v.{0}", f.column.to_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    let returning = column_list(&mapping.full_fields());

    let sql = format!(
        "UPDATE {table} AS t SET {set_clause} FROM (VALUES {values}) AS v({v_cols}) WHERE {join_on} RETURNING {returning}",
        table = table_sql(mapping),
        values = value_rows.join(", "),
        v_cols = v_cols.join(", "),
    );
    let bound = r.bind(&param_map)?;
    client.query(&sql, &bound).await
}

/// `INSERT INTO t (cols) VALUES (...), (...) RETURNING *`.
///
/// PostgreSQL preserves input-row order in `RETURNING` for a literal
/// multi-row `VALUES` insert, so the nth returned row corresponds to the nth
/// input entity.
async fn insert_batch(
    client: &impl GenericClient,
    mapping: &EntityMapping,
    entities: &[&(dyn std::any::Any + Send + Sync)],
) -> OrmResult<Vec<Row>> {
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    let fields = mapping.insertable_fields();
    let mut param_gen = ParamIdGen::new();
    let mut param_map = ParamMap::new();
    let mut r = Renderer::new();
    let mut value_rows = Vec::with_capacity(entities.len());

    for entity in entities {
        let mut tuple = Vec::with_capacity(fields.len());
        for f in &fields {
            let id = param_gen.next();
            param_map.insert(id, (f.get)(*entity));
            tuple.push(r.render(&Node::Param(id))?);
        }
        value_rows.push(format!("({})", tuple.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} RETURNING {}",
        table_sql(mapping),
        column_list(&fields),
        value_rows.join(", "),
        column_list(&mapping.full_fields())
    );
    let bound = r.bind(&param_map)?;
    let rows = client.query(&sql, &bound).await?;
    if rows.len() != entities.len() {
        return Err(OrmError::InvariantViolation(format!(
            "insert into '{}' expected {} returned rows, got {}",
            mapping.type_name,
            entities.len(),
            rows.len()
        )));
    }
    Ok(rows)
}

/// Fetches entities by an arbitrary key column list (primary key for root
/// lookups, parental key for child recursion), grouping the result by the
/// value actually matched so a caller can attribute children back to parents.
pub fn get_by<'a, C: GenericClient>(
    client: &'a C,
    catalog: &'a MappingCatalog,
    identity: &'a mut IdentityMap,
    entity_type: TypeId,
    type_name: &'static str,
    columns: Vec<&'static str>,
    values: Vec<KeyValue>,
) -> BoxFuture<'a, OrmResult<HashMap<KeyValue, Vec<AnyEntity>>>> {
    Box::pin(async move {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let mapping = catalog.require(entity_type, type_name)?;
        let rows = select_by(client, mapping, &columns, &values).await?;

        let mut entities_by_pk: HashMap<KeyValue, AnyEntity> = HashMap::new();
        let mut group_key_by_pk: HashMap<KeyValue, KeyValue> = HashMap::new();
        let mut parental_by_pk: HashMap<KeyValue, KeyValue> = HashMap::new();
        let mut fetched_pks: Vec<KeyValue> = Vec::new();

        for row in &rows {
            let pk = read_key_from_row(mapping, &mapping.primary_key, row)?;
            let parental = read_key_from_row(mapping, &mapping.parental_key, row)?;
            let group_key = read_key_from_row(mapping, &columns, row)?;
            identity.track(entity_type, parental.clone(), pk.clone());

            let mut entity = (mapping.factory)();
            mapping.hydrate(entity.as_mut(), row)?;

            fetched_pks.push(pk.clone());
            parental_by_pk.insert(pk.clone(), parental);
            group_key_by_pk.insert(pk.clone(), group_key);
            entities_by_pk.insert(pk, entity);
        }

        for child in &mapping.children {
            let child_mapping = catalog.require(child.target_type, child.target_type_name)?;
            let mut grouped = get_by(
                client,
                catalog,
                &mut *identity,
                child.target_type,
                child.target_type_name,
                child_mapping.parental_key.clone(),
                fetched_pks.clone(),
            )
            .await?;

            for pk in &fetched_pks {
                let children = grouped.remove(pk).unwrap_or_default();
                if child.arity == crate::mapping::Arity::Singular && children.len() > 1 {
                    return Err(OrmError::InvariantViolation(format!(
                        "singular child '{}' of '{}' resolved to {} rows",
                        child.name,
                        mapping.type_name,
                        children.len()
                    )));
                }
                let child_ids: HashSet<KeyValue> = children
                    .iter()
                    .map(|c| child_mapping.primary_key_of(c.as_ref()))
                    .collect::<OrmResult<_>>()?;
                let parent_identity = EntityIdentity {
                    entity_type,
                    parental_key: parental_by_pk[pk].clone(),
                    primary_key: pk.clone(),
                };
                identity.set_known_children(parent_identity, child_ids);

                if let Some(parent) = entities_by_pk.get_mut(pk) {
                    (child.put)(parent.as_mut(), children);
                }
            }
        }

        let mut result: HashMap<KeyValue, Vec<AnyEntity>> = HashMap::new();
        for pk in fetched_pks {
            if let Some(entity) = entities_by_pk.remove(&pk) {
                let group_key = group_key_by_pk.remove(&pk).unwrap_or_default();
                result.entry(group_key).or_default().push(entity);
            }
        }
        Ok(result)
    })
}

/// Upserts and reconciles a batch of entities of one type, in place.
pub fn save<'a, C: GenericClient>(
    client: &'a C,
    catalog: &'a MappingCatalog,
    identity: &'a mut IdentityMap,
    entity_type: TypeId,
    type_name: &'static str,
    entities: Vec<AnyEntity>,
) -> BoxFuture<'a, OrmResult<Vec<AnyEntity>>> {
    Box::pin(async move {
        if entities.is_empty() {
            return Ok(entities);
        }
        let mapping = catalog.require(entity_type, type_name)?;

        let mut to_update_idx = Vec::new();
        let mut to_insert_idx = Vec::new();
        for (i, e) in entities.iter().enumerate() {
            let pk = mapping.primary_key_of(e.as_ref())?;
            let parental = mapping.parental_key_of(e.as_ref())?;
            if identity.contains(entity_type, &parental, &pk) {
                to_update_idx.push(i);
            } else {
                to_insert_idx.push(i);
            }
        }

        let mut entities = entities;

        if !to_update_idx.is_empty() {
            let refs: Vec<&(dyn std::any::Any + Send + Sync)> = to_update_idx
                .iter()
                .map(|&i| entities[i].as_ref())
                .collect();
            let rows = update_batch(client, mapping, &refs).await?;
            let mut by_pk: HashMap<KeyValue, &Row> = HashMap::new();
            for row in &rows {
                let pk = read_key_from_row(mapping, &mapping.primary_key, row)?;
                by_pk.insert(pk, row);
            }
            for &i in &to_update_idx {
                let pk = mapping.primary_key_of(entities[i].as_ref())?;
                let row = by_pk.get(&pk).ok_or_else(|| {
                    OrmError::InvariantViolation(format!(
                        "update of '{}' did not return a row for an existing primary key",
                        mapping.type_name
                    ))
                })?;
                mapping.hydrate(entities[i].as_mut(), row)?;
            }
        }

        if !to_insert_idx.is_empty() {
            let refs: Vec<&(dyn std::any::Any + Send + Sync)> = to_insert_idx
                .iter()
                .map(|&i| entities[i].as_ref())
                .collect();
            let rows = insert_batch(client, mapping, &refs).await?;
            for (&i, row) in to_insert_idx.iter().zip(rows.iter()) {
                mapping.hydrate(entities[i].as_mut(), row)?;
                let pk = mapping.primary_key_of(entities[i].as_ref())?;
                let parental = mapping.parental_key_of(entities[i].as_ref())?;
                identity.track(entity_type, parental, pk);
            }
        }

        for child in &mapping.children {
            let child_mapping = catalog.require(child.target_type, child.target_type_name)?;
            let mut to_delete: Vec<(KeyValue, KeyValue)> = Vec::new();
            let mut all_children: Vec<AnyEntity> = Vec::new();
            let mut owner_of: Vec<usize> = Vec::new();

            for (i, entity) in entities.iter_mut().enumerate() {
                let parent_pk = mapping.primary_key_of(entity.as_ref())?;
                let parent_parental = mapping.parental_key_of(entity.as_ref())?;
                let parent_identity = EntityIdentity {
                    entity_type,
                    parental_key: parent_parental,
                    primary_key: parent_pk.clone(),
                };

                let mut current = (child.take)(entity.as_mut());
                let parental_fields = child_mapping.parental_key_fields()?;
                for child_entity in current.iter_mut() {
                    for (field, scalar) in parental_fields.iter().zip(parent_pk.iter()) {
                        (field.set_scalar)(child_entity.as_mut(), scalar);
                    }
                }

                let current_tracked: HashSet<KeyValue> = current
                    .iter()
                    .filter_map(|c| {
                        let pk = child_mapping.primary_key_of(c.as_ref()).ok()?;
                        identity
                            .contains(child.target_type, &parent_pk, &pk)
                            .then_some(pk)
                    })
                    .collect();
                let known = identity.known_children(&parent_identity);
                for removed in known.difference(&current_tracked) {
                    to_delete.push((parent_pk.clone(), removed.clone()));
                }

                for child_entity in current {
                    owner_of.push(i);
                    all_children.push(child_entity);
                }
            }

            if !to_delete.is_empty() {
                delete(
                    client,
                    catalog,
                    &mut *identity,
                    child.target_type,
                    child.target_type_name,
                    to_delete,
                )
                .await?;
            }

            let saved_children = save(
                client,
                catalog,
                &mut *identity,
                child.target_type,
                child.target_type_name,
                all_children,
            )
            .await?;

            let mut by_owner: HashMap<usize, Vec<AnyEntity>> = HashMap::new();
            for (owner, child_entity) in owner_of.into_iter().zip(saved_children) {
                by_owner.entry(owner).or_default().push(child_entity);
            }
            for (i, entity) in entities.iter_mut().enumerate() {
                let children = by_owner.remove(&i).unwrap_or_default();
                let ids: HashSet<KeyValue> = children
                    .iter()
                    .map(|c| child_mapping.primary_key_of(c.as_ref()))
                    .collect::<OrmResult<_>>()?;
                let parent_pk = mapping.primary_key_of(entity.as_ref())?;
                let parent_parental = mapping.parental_key_of(entity.as_ref())?;
                identity.set_known_children(
                    EntityIdentity {
                        entity_type,
                        parental_key: parent_parental,
                        primary_key: parent_pk,
                    },
                    ids,
                );
                (child.put)(entity.as_mut(), children);
            }
        }

        Ok(entities)
    })
}

/// Deletes entities by `(parental_key, primary_key)`, leaves of the
/// aggregate tree first.
pub fn delete<'a, C: GenericClient>(
    client: &'a C,
    catalog: &'a MappingCatalog,
    identity: &'a mut IdentityMap,
    entity_type: TypeId,
    type_name: &'static str,
    items: Vec<(KeyValue, KeyValue)>,
) -> BoxFuture<'a, OrmResult<()>> {
    Box::pin(async move {
        if items.is_empty() {
            return Ok(());
        }
        let mapping = catalog.require(entity_type, type_name)?;

        for child in &mapping.children {
            let mut child_items = Vec::new();
            for (parental, primary) in &items {
                let parent_identity = EntityIdentity {
                    entity_type,
                    parental_key: parental.clone(),
                    primary_key: primary.clone(),
                };
                for child_pk in identity.known_children(&parent_identity) {
                    child_items.push((primary.clone(), child_pk));
                }
            }
            delete(
                client,
                catalog,
                &mut *identity,
                child.target_type,
                child.target_type_name,
                child_items,
            )
            .await?;
        }

        let primary_keys: Vec<KeyValue> = items.iter().map(|(_, pk)| pk.clone()).collect();
        delete_by(client, mapping, &mapping.primary_key, &primary_keys).await?;

        for (parental, primary) in &items {
            identity.untrack(entity_type, parental, primary);
        }
        Ok(())
    })
}
