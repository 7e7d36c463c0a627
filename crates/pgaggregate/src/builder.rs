//! Composable query builder over one mapped root type.
//!
//! Accumulates joins, `WHERE`/`HAVING` fragments, and an `ORDER BY` list,
//! then resolves to a set of primary keys and hands them to the aggregate
//! engine — the builder never constructs entities itself, it only narrows
//! down which aggregates to fetch.

use std::collections::HashMap;
use std::marker::PhantomData;

use crate::ast::{Node, Param, ParamId, ParamIdGen, ParamMap, Renderer};
use crate::catalog::MappingCatalog;
use crate::client::GenericClient;
use crate::engine;
use crate::error::{OrmError, OrmResult};
use crate::fragment;
use crate::ident::Ident;
use crate::identity::IdentityMap;
use crate::mapping::{AnyEntity, EntityMapping, KeyValue, Mapped};

pub enum JoinKind {
    Inner,
    Left,
}

enum JoinTarget {
    Mapped(Ident, Ident),
    Raw(String),
}

struct Join {
    kind: JoinKind,
    target: JoinTarget,
    alias: Ident,
    on: Node,
}

/// Accumulates filter/sort state for one query against `E`'s table, sharing
/// one parameter namespace across every fragment parsed through it.
pub struct QueryBuilder<E: Mapped> {
    pub(crate) alias: Ident,
    joins: Vec<Join>,
    wheres: Vec<Node>,
    havings: Vec<Node>,
    pub(crate) order_by: Vec<(Node, bool, bool)>,
    param_gen: ParamIdGen,
    assigned: HashMap<String, ParamId>,
    pub(crate) param_map: ParamMap,
    _entity: PhantomData<E>,
}

impl<E: Mapped> QueryBuilder<E> {
    pub fn new(alias: &str) -> OrmResult<Self> {
        Ok(Self {
            alias: Ident::parse(alias)?,
            joins: Vec::new(),
            wheres: Vec::new(),
            havings: Vec::new(),
            order_by: Vec::new(),
            param_gen: ParamIdGen::new(),
            assigned: HashMap::new(),
            param_map: ParamMap::new(),
            _entity: PhantomData,
        })
    }

    fn parse_fragment(&mut self, sql: &str, values: &HashMap<String, Param>) -> OrmResult<Node> {
        fragment::parse_into(sql, values, &mut self.param_gen, &mut self.assigned, &mut self.param_map)
    }

    pub fn join(
        mut self,
        kind: JoinKind,
        schema: &str,
        table: &str,
        alias: &str,
        on_sql: &str,
        on_values: &HashMap<String, Param>,
    ) -> OrmResult<Self> {
        let on = self.parse_fragment(on_sql, on_values)?;
        self.joins.push(Join {
            kind,
            target: JoinTarget::Mapped(Ident::parse(schema)?, Ident::parse(table)?),
            alias: Ident::parse(alias)?,
            on,
        });
        Ok(self)
    }

    pub fn join_raw(
        mut self,
        kind: JoinKind,
        raw_target: &str,
        alias: &str,
        on_sql: &str,
        on_values: &HashMap<String, Param>,
    ) -> OrmResult<Self> {
        let on = self.parse_fragment(on_sql, on_values)?;
        self.joins.push(Join {
            kind,
            target: JoinTarget::Raw(raw_target.to_string()),
            alias: Ident::parse(alias)?,
            on,
        });
        Ok(self)
    }

    /// ANDs another condition into the `WHERE` clause.
    pub fn where_(mut self, sql: &str, values: &HashMap<String, Param>) -> OrmResult<Self> {
        let node = self.parse_fragment(sql, values)?;
        self.wheres.push(node);
        Ok(self)
    }

    /// ANDs another condition into the `HAVING` clause.
    pub fn having(mut self, sql: &str, values: &HashMap<String, Param>) -> OrmResult<Self> {
        let node = self.parse_fragment(sql, values)?;
        self.havings.push(node);
        Ok(self)
    }

    pub fn order_by(
        mut self,
        sql: &str,
        values: &HashMap<String, Param>,
        ascending: bool,
        nulls_last: bool,
    ) -> OrmResult<Self> {
        let node = self.parse_fragment(sql, values)?;
        self.order_by.push((node, ascending, nulls_last));
        Ok(self)
    }

    fn join_sql(&self, r: &mut Renderer) -> OrmResult<String> {
        let mut out = String::new();
        for j in &self.joins {
            let kw = match j.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let target = match &j.target {
                JoinTarget::Mapped(schema, table) => format!("{}.{}", schema.to_sql(), table.to_sql()),
                JoinTarget::Raw(raw) => raw.clone(),
            };
            out.push_str(&format!(" {kw} {target} AS {} ON {}", j.alias.to_sql(), r.render(&j.on)?));
        }
        Ok(out)
    }

    fn where_sql(&self, r: &mut Renderer) -> OrmResult<String> {
        if self.wheres.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(" WHERE {}", r.render(&Node::All(self.wheres.clone()))?))
    }

    fn having_sql_with(&self, r: &mut Renderer, extra: Option<&Node>) -> OrmResult<String> {
        let mut clauses = self.havings.clone();
        if let Some(extra) = extra {
            clauses.push(extra.clone());
        }
        if clauses.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(" HAVING {}", r.render(&Node::All(clauses))?))
    }

    /// Renders an `ORDER BY` clause from an explicit order list rather than
    /// `self.order_by` — the paginator passes its own, possibly
    /// direction/nulls-reversed, effective order here for backward
    /// (`last`/`before`) paging, while plain `fetch()` passes `self.order_by`
    /// through unchanged.
    fn order_by_sql_for(r: &mut Renderer, order: &[(Node, bool, bool)]) -> OrmResult<String> {
        if order.is_empty() {
            return Ok(String::new());
        }
        let parts = order
            .iter()
            .map(|(node, asc, nulls_last)| {
                let dir = if *asc { "ASC" } else { "DESC" };
                let nulls = if *nulls_last { "NULLS LAST" } else { "NULLS FIRST" };
                Ok(format!("{} {dir} {nulls}", r.render(node)?))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    /// Renders `SELECT <pk...> FROM ... LIMIT :limit OFFSET :offset`,
    /// optionally ANDing `extra_having` into HAVING (the cursor paginator's
    /// keyset predicate) and sorting by `order` instead of the builder's own
    /// `order_by`, returning the SQL text alongside the `Renderer` and
    /// `ParamMap` needed to bind it.
    fn render_select(
        &self,
        mapping: &EntityMapping,
        extra_having: Option<&Node>,
        order: &[(Node, bool, bool)],
        limit: Option<i64>,
        offset: i64,
    ) -> OrmResult<(String, Renderer, ParamMap)> {
        let pk_cols: Vec<Ident> = mapping
            .primary_key_fields()?
            .iter()
            .map(|f| f.column.clone())
            .collect();

        let mut r = Renderer::new();
        let select_list: Vec<String> = pk_cols
            .iter()
            .map(|c| format!("{}.{}", self.alias.to_sql(), c.to_sql()))
            .collect();
        let joins = self.join_sql(&mut r)?;
        let where_sql = self.where_sql(&mut r)?;
        let group_by = format!(" GROUP BY {}", select_list.join(", "));
        let having_sql = self.having_sql_with(&mut r, extra_having)?;
        let order_sql = Self::order_by_sql_for(&mut r, order)?;

        let mut param_map = self.param_map.clone();
        let mut param_gen = ParamIdGen::resume_from(self.param_gen.count());
        let limit_id = param_gen.next();
        let offset_id = param_gen.next();
        param_map.insert(limit_id, Param::new(limit.unwrap_or(i64::MAX)));
        param_map.insert(offset_id, Param::new(offset));
        let limit_placeholder = r.render(&Node::Param(limit_id))?;
        let offset_placeholder = r.render(&Node::Param(offset_id))?;

        let sql = format!(
            "SELECT {} FROM {}.{} AS {}{joins}{where_sql}{group_by}{having_sql}{order_sql} LIMIT {limit_placeholder} OFFSET {offset_placeholder}",
            select_list.join(", "),
            mapping.schema.to_sql(),
            mapping.table.to_sql(),
            self.alias.to_sql(),
        );
        Ok((sql, r, param_map))
    }

    /// Renders `SELECT <exprs> FROM ... WHERE <builder's filters> AND
    /// <extra_where> GROUP BY <pk...> HAVING <builder's filters>` — used by
    /// the cursor paginator to resolve a cursor's sort-key values through the
    /// same FROM/joins/GROUP BY/HAVING the page query itself runs against, so
    /// an order expression naming a join alias or an aggregate resolves the
    /// same way here as it does in the paged `SELECT`.
    pub(crate) fn render_cursor_lookup(
        &self,
        mapping: &EntityMapping,
        select_exprs: &[Node],
        extra_where: Node,
    ) -> OrmResult<(String, Renderer, ParamMap)> {
        let mut r = Renderer::new();
        let select_list: Vec<String> = select_exprs.iter().map(|n| r.render(n)).collect::<OrmResult<_>>()?;
        let joins = self.join_sql(&mut r)?;

        let mut wheres = self.wheres.clone();
        wheres.push(extra_where);
        let where_sql = format!(" WHERE {}", r.render(&Node::All(wheres))?);

        let pk_cols: Vec<Ident> = mapping
            .primary_key_fields()?
            .iter()
            .map(|f| f.column.clone())
            .collect();
        let group_by = format!(
            " GROUP BY {}",
            pk_cols
                .iter()
                .map(|c| format!("{}.{}", self.alias.to_sql(), c.to_sql()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let having_sql = self.having_sql_with(&mut r, None)?;

        let sql = format!(
            "SELECT {} FROM {}.{} AS {}{joins}{where_sql}{group_by}{having_sql}",
            select_list.join(", "),
            mapping.schema.to_sql(),
            mapping.table.to_sql(),
            self.alias.to_sql(),
        );
        Ok((sql, r, self.param_map.clone()))
    }
}

pub(crate) fn render_cursor_lookup<E: Mapped>(
    builder: &QueryBuilder<E>,
    mapping: &EntityMapping,
    select_exprs: &[Node],
    extra_where: Node,
) -> OrmResult<(String, Renderer, ParamMap)> {
    builder.render_cursor_lookup(mapping, select_exprs, extra_where)
}

async fn resolve_entities<E: Mapped + 'static, C: GenericClient>(
    client: &C,
    catalog: &MappingCatalog,
    identity: &mut IdentityMap,
    mapping: &EntityMapping,
    keys: Vec<KeyValue>,
) -> OrmResult<Vec<E>> {
    let grouped = engine::get_by(
        client,
        catalog,
        identity,
        std::any::TypeId::of::<E>(),
        std::any::type_name::<E>(),
        mapping.primary_key.clone(),
        keys.clone(),
    )
    .await?;

    let mut by_key: HashMap<KeyValue, AnyEntity> = HashMap::new();
    for (_, mut entities) in grouped {
        if let Some(entity) = entities.pop() {
            let pk = mapping.primary_key_of(entity.as_ref())?;
            by_key.insert(pk, entity);
        }
    }

    keys.into_iter()
        .filter_map(|k| by_key.remove(&k))
        .map(|e| {
            e.downcast::<E>()
                .map(|boxed| *boxed)
                .map_err(|_| OrmError::InvariantViolation("downcast to mapped type failed".into()))
        })
        .collect()
}

fn resolve_keys(mapping: &EntityMapping, rows: &[tokio_postgres::Row]) -> OrmResult<Vec<KeyValue>> {
    let pk_cols: Vec<Ident> = mapping
        .primary_key_fields()?
        .iter()
        .map(|f| f.column.clone())
        .collect();
    rows.iter()
        .map(|row| {
            pk_cols
                .iter()
                .map(|c| crate::mapping::Scalar::from_row(row, c.bare_name()))
                .collect::<OrmResult<KeyValue>>()
        })
        .collect()
}

/// Executes the built query, resolves the matched primary keys through the
/// aggregate engine, and returns entities in result order.
pub async fn fetch<E: Mapped + 'static, C: GenericClient>(
    builder: &QueryBuilder<E>,
    client: &C,
    catalog: &MappingCatalog,
    identity: &mut IdentityMap,
    limit: Option<i64>,
    offset: i64,
) -> OrmResult<Vec<E>> {
    fetch_ordered(builder, client, catalog, identity, &builder.order_by, limit, offset).await
}

/// Like [`fetch`] but sorts by an explicit `order` list instead of the
/// builder's own `order_by` — used by [`crate::paginate`], which needs the
/// primary-key tiebreak columns (and, for backward paging, the reversed
/// direction) reflected in the underlying SQL sort, not just the cursor
/// predicate.
pub(crate) async fn fetch_ordered<E: Mapped + 'static, C: GenericClient>(
    builder: &QueryBuilder<E>,
    client: &C,
    catalog: &MappingCatalog,
    identity: &mut IdentityMap,
    order: &[(Node, bool, bool)],
    limit: Option<i64>,
    offset: i64,
) -> OrmResult<Vec<E>> {
    let mapping = catalog.require(std::any::TypeId::of::<E>(), std::any::type_name::<E>())?;
    let (sql, r, param_map) = builder.render_select(mapping, None, order, limit, offset)?;
    let bound = r.bind(&param_map)?;
    let rows = client.query(&sql, &bound).await?;
    let keys = resolve_keys(mapping, &rows)?;
    resolve_entities::<E, C>(client, catalog, identity, mapping, keys).await
}

/// `SELECT COUNT(*) FROM (<same query, unlimited>) _`.
pub async fn count<E: Mapped + 'static>(
    builder: &QueryBuilder<E>,
    client: &impl GenericClient,
    catalog: &MappingCatalog,
) -> OrmResult<i64> {
    let mapping = catalog.require(std::any::TypeId::of::<E>(), std::any::type_name::<E>())?;
    let pk_cols: Vec<Ident> = mapping
        .primary_key_fields()?
        .iter()
        .map(|f| f.column.clone())
        .collect();

    let mut r = Renderer::new();
    let select_list: Vec<String> = pk_cols
        .iter()
        .map(|c| format!("{}.{}", builder.alias.to_sql(), c.to_sql()))
        .collect();
    let joins = builder.join_sql(&mut r)?;
    let where_sql = builder.where_sql(&mut r)?;
    let group_by = format!(" GROUP BY {}", select_list.join(", "));
    let having_sql = builder.having_sql_with(&mut r, None)?;

    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT {} FROM {}.{} AS {}{joins}{where_sql}{group_by}{having_sql}) _",
        select_list.join(", "),
        mapping.schema.to_sql(),
        mapping.table.to_sql(),
        builder.alias.to_sql(),
    );
    let bound = r.bind(&builder.param_map)?;
    let row = client.query_one(&sql, &bound).await?;
    row.try_get::<_, i64>(0)
        .map_err(|e| OrmError::decode("count", e.to_string()))
}

/// Used by [`crate::paginate`] to splice a cursor predicate into HAVING,
/// sort by its (possibly direction/nulls-reversed) effective order rather
/// than the builder's own `order_by`, and re-resolve the resulting keys
/// against the engine.
pub(crate) async fn fetch_with_having<E: Mapped + 'static, C: GenericClient>(
    builder: &QueryBuilder<E>,
    client: &C,
    catalog: &MappingCatalog,
    identity: &mut IdentityMap,
    order: &[(Node, bool, bool)],
    extra_having: Node,
    extra_params: ParamMap,
    limit: i64,
) -> OrmResult<Vec<E>> {
    let mapping = catalog.require(std::any::TypeId::of::<E>(), std::any::type_name::<E>())?;
    let (sql, r, mut param_map) = builder.render_select(mapping, Some(&extra_having), order, Some(limit), 0)?;
    param_map.extend(extra_params);
    let bound = r.bind(&param_map)?;
    let rows = client.query(&sql, &bound).await?;
    let keys = resolve_keys(mapping, &rows)?;
    resolve_entities::<E, C>(client, catalog, identity, mapping, keys).await
}

/// Id the paginator's own `ParamIdGen` can safely resume from without
/// colliding with ids this builder's fragments already assigned.
pub(crate) fn next_param_id_start<E: Mapped>(builder: &QueryBuilder<E>) -> u32 {
    builder.param_gen.count()
}

pub(crate) fn effective_order<E: Mapped>(
    builder: &QueryBuilder<E>,
    mapping: &EntityMapping,
) -> OrmResult<Vec<(Node, bool, bool)>> {
    let mut order = builder.order_by.clone();
    for field in mapping.primary_key_fields()? {
        order.push((Node::col(&field.column), true, true));
    }
    Ok(order)
}

pub(crate) fn alias<E: Mapped>(builder: &QueryBuilder<E>) -> &Ident {
    &builder.alias
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_sql_for_is_empty_for_no_entries() {
        let mut r = Renderer::new();
        let sql = order_by_sql_for_free(&mut r, &[]);
        assert_eq!(sql.unwrap(), "");
    }

    #[test]
    fn order_by_sql_for_renders_each_entry() {
        let mut r = Renderer::new();
        let order = vec![
            (Node::col(&Ident::parse("created_at").unwrap()), false, false),
            (Node::col(&Ident::parse("id").unwrap()), true, true),
        ];
        let sql = order_by_sql_for_free(&mut r, &order).unwrap();
        assert_eq!(sql, " ORDER BY \"created_at\" DESC NULLS FIRST, \"id\" ASC NULLS LAST");
    }

    // `order_by_sql_for` is a `QueryBuilder<E>` associated function generic
    // only over `E: Mapped`, with no `Mapped` type handy in this module's own
    // tests — a free-function copy lets these tests exercise the same logic
    // without constructing one.
    fn order_by_sql_for_free(r: &mut Renderer, order: &[(Node, bool, bool)]) -> OrmResult<String> {
        if order.is_empty() {
            return Ok(String::new());
        }
        let parts = order
            .iter()
            .map(|(node, asc, nulls_last)| {
                let dir = if *asc { "ASC" } else { "DESC" };
                let nulls = if *nulls_last { "NULLS LAST" } else { "NULLS FIRST" };
                Ok(format!("{} {dir} {nulls}", r.render(node)?))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }
}
