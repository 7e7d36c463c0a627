//! Cursor-based pagination over a [`crate::builder::QueryBuilder`].
//!
//! Cursors name a row's position in an *effective order*: the caller's
//! `ORDER BY` followed by the entity's primary-key columns, which guarantees
//! a total ordering even when the user-supplied order has ties. A cursor is
//! resolved back to that row's sort-key values with an auxiliary lookup,
//! then spliced into `HAVING` as a strict tuple-comparison predicate — never
//! an `IS NOT DISTINCT FROM` form, which would admit ties across a NULL
//! boundary the strict form rejects.

use crate::ast::{Node, ParamIdGen, ParamMap};
use crate::builder::{self, QueryBuilder};
use crate::catalog::MappingCatalog;
use crate::client::GenericClient;
use crate::error::OrmResult;
use crate::identity::IdentityMap;
use crate::mapping::{KeyValue, Mapped, Scalar};

/// Opaque position marker: the primary-key value of the row at a page
/// boundary. A single scalar when the primary key is one column, a tuple
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(pub KeyValue);

pub struct Page<T> {
    pub items: Vec<T>,
    pub cursors: Vec<Cursor>,
    pub has_previous_page: bool,
    pub has_next_page: bool,
}

/// Forward (`first`/`after`) or backward (`last`/`before`) paging.
pub struct PageRequest {
    pub first: Option<i64>,
    pub after: Option<Cursor>,
    pub last: Option<i64>,
    pub before: Option<Cursor>,
    pub offset: i64,
}

impl PageRequest {
    fn forward(&self) -> bool {
        self.last.is_none() && self.before.is_none()
    }

    fn limit(&self) -> i64 {
        self.first.or(self.last).unwrap_or(20)
    }

    fn cursor(&self) -> Option<&Cursor> {
        if self.forward() {
            self.after.as_ref()
        } else {
            self.before.as_ref()
        }
    }
}

/// Resolves a cursor's primary key to its effective-order sort values.
///
/// Issued through the builder's own `render_cursor_lookup` rather than a
/// bare `SELECT ... FROM <table>` — an order expression can reference a join
/// alias or an aggregate (`max("c"."created_at")`), so this has to run
/// against the same FROM/joins/GROUP BY/WHERE/HAVING the page query itself
/// uses, or the join alias is undefined and the aggregate ungrouped.
async fn resolve_cursor_values<E: Mapped + 'static, C: GenericClient>(
    client: &C,
    catalog: &MappingCatalog,
    builder: &QueryBuilder<E>,
    order: &[(Node, bool, bool)],
    cursor: &Cursor,
) -> OrmResult<Vec<Scalar>> {
    let mapping = catalog.require(std::any::TypeId::of::<E>(), std::any::type_name::<E>())?;
    let pk_fields = mapping.primary_key_fields()?;
    let alias = builder::alias(builder);

    let mut param_gen = ParamIdGen::resume_from(builder::next_param_id_start(builder));
    let mut cursor_params = ParamMap::new();
    let mut eq_nodes = Vec::with_capacity(pk_fields.len());
    for (field, scalar) in pk_fields.iter().zip(cursor.0.iter()) {
        let id = param_gen.next();
        cursor_params.insert(id, scalar.to_param());
        eq_nodes.push(Node::eq(Node::QName(alias.clone(), field.column.clone()), Node::Param(id)));
    }
    let pk_predicate = Node::All(eq_nodes);

    let select_exprs: Vec<Node> = order.iter().map(|(node, _, _)| node.clone()).collect();
    let (sql, r, mut param_map) = builder::render_cursor_lookup(builder, mapping, &select_exprs, pk_predicate)?;
    param_map.extend(cursor_params);
    let bound = r.bind(&param_map)?;
    let row = client.query_one(&sql, &bound).await?;

    (0..order.len())
        .map(|i| Scalar::from_row(&row, &format!("{i}")).or_else(|_| scalar_at(&row, i)))
        .collect()
}

/// `SELECT a, b, c` columns come back positionally, not necessarily named —
/// fall back to reading by ordinal when the rendered expression isn't a bare
/// column name tokio_postgres can key a lookup on.
fn scalar_at(row: &tokio_postgres::Row, i: usize) -> OrmResult<Scalar> {
    use crate::error::OrmError;
    if let Ok(v) = row.try_get::<_, i64>(i) {
        return Ok(Scalar::I64(v));
    }
    if let Ok(v) = row.try_get::<_, i32>(i) {
        return Ok(Scalar::I32(v));
    }
    if let Ok(v) = row.try_get::<_, String>(i) {
        return Ok(Scalar::Text(v));
    }
    if let Ok(v) = row.try_get::<_, uuid::Uuid>(i) {
        return Ok(Scalar::Uuid(v));
    }
    if let Ok(v) = row.try_get::<_, bool>(i) {
        return Ok(Scalar::Bool(v));
    }
    row.try_get::<_, chrono::NaiveDateTime>(i)
        .map(Scalar::Timestamp)
        .map_err(|e| OrmError::decode(format!("column {i}"), e.to_string()))
}

/// Builds the strict tuple-comparison predicate of step 4: OR over `i` of
/// AND over `j <= i` of a prefix-tie (`j < i`) or a strict boundary
/// comparison (`j == i`), the latter's direction depending on the column's
/// own ascending/nulls polarity in `order`.
///
/// `order` is always the *traversal* order — already direction/nulls-flipped
/// by the caller for `last`/`before` paging — so a plain ascending column
/// always means "strictly after" here; there is no separate forward/backward
/// flag to apply on top, or the two reversals would cancel out.
///
/// Each `vals[j]` is bound as a fresh parameter via `param_gen`/`param_map` rather
/// than inlined, so the rendered predicate is a normal parameterized `Node`
/// the builder's own `Renderer` can splice in alongside everything else.
fn cursor_predicate(
    order: &[(Node, bool, bool)],
    vals: &[Scalar],
    param_gen: &mut ParamIdGen,
    param_map: &mut ParamMap,
) -> Node {
    let param_for = |scalar: &Scalar, param_gen: &mut ParamIdGen, param_map: &mut ParamMap| -> Node {
        let id = param_gen.next();
        param_map.insert(id, scalar.to_param());
        Node::Param(id)
    };

    let mut disjuncts = Vec::with_capacity(order.len());
    for i in 0..order.len() {
        let mut conjuncts = Vec::with_capacity(i + 1);
        for j in 0..=i {
            let (expr, ascending, nulls_last) = &order[j];
            if j < i {
                let v_eq = param_for(&vals[j], param_gen, param_map);
                let v_null = param_for(&vals[j], param_gen, param_map);
                conjuncts.push(Node::Any(vec![
                    Node::eq(expr.clone(), v_eq),
                    Node::All(vec![Node::is_null(v_null), Node::is_null(expr.clone())]),
                ]));
            } else {
                // `order` already encodes the traversal direction for this
                // page (flipped by `reverse_order` for `last`/`before`), so
                // an ascending column always means "strictly after" here.
                let strictly_after = *ascending;
                let v_cmp = param_for(&vals[j], param_gen, param_map);
                let cmp = if strictly_after {
                    Node::gt(expr.clone(), v_cmp)
                } else {
                    Node::lt(expr.clone(), v_cmp)
                };
                let v_null = param_for(&vals[j], param_gen, param_map);
                let null_edge = if *nulls_last {
                    Node::All(vec![Node::is_not_null(v_null), Node::is_null(expr.clone())])
                } else {
                    Node::All(vec![Node::is_null(v_null), Node::is_not_null(expr.clone())])
                };
                conjuncts.push(Node::Any(vec![cmp, null_edge]));
            }
        }
        disjuncts.push(Node::All(conjuncts));
    }
    Node::Any(disjuncts)
}

/// Flips direction and nulls polarity on every order entry — used for
/// `last`/`before` paging, which still issues a "forward" keyset query but
/// over the reversed order, then re-reverses the result rows.
fn reverse_order(order: &[(Node, bool, bool)]) -> Vec<(Node, bool, bool)> {
    order
        .iter()
        .map(|(n, asc, nulls_last)| (n.clone(), !asc, !nulls_last))
        .collect()
}

/// Resolves `request` against `builder`, returning a page of hydrated
/// entities alongside their cursors and has-next/has-previous flags.
pub async fn paginate<E: Mapped + 'static, C: GenericClient>(
    builder: &QueryBuilder<E>,
    client: &C,
    catalog: &MappingCatalog,
    identity: &mut IdentityMap,
    request: PageRequest,
) -> OrmResult<Page<E>> {
    let mapping = catalog.require(std::any::TypeId::of::<E>(), std::any::type_name::<E>())?;
    let base_order = builder::effective_order(builder, mapping)?;
    let forward = request.forward();
    let order = if forward { base_order.clone() } else { reverse_order(&base_order) };

    let mut having = None;
    if let Some(cursor) = request.cursor() {
        let vals = resolve_cursor_values::<E, C>(client, catalog, builder, &order, cursor).await?;
        let mut param_gen = ParamIdGen::resume_from(builder::next_param_id_start(builder));
        let mut extra_params = ParamMap::new();
        let node = cursor_predicate(&order, &vals, &mut param_gen, &mut extra_params);
        having = Some((node, extra_params));
    }

    let limit = request.limit();
    let probe_limit = limit + 1;
    let mut rows = match having {
        Some((extra, extra_params)) => {
            builder::fetch_with_having(
                builder,
                client,
                catalog,
                identity,
                &order,
                extra,
                extra_params,
                probe_limit,
            )
            .await?
        }
        None => {
            builder::fetch_ordered(builder, client, catalog, identity, &order, Some(probe_limit), request.offset)
                .await?
        }
    };

    let has_extra = rows.len() as i64 > limit;
    if has_extra {
        rows.truncate(limit as usize);
    }
    if !forward {
        rows.reverse();
    }

    let has_previous_page = if forward {
        request.after.is_some() || request.offset > 0
    } else {
        has_extra
    };
    let has_next_page = if forward {
        has_extra
    } else {
        request.before.is_some() || request.offset > 0
    };

    let cursors = rows
        .iter()
        .map(|e| mapping.primary_key_of(e as &dyn std::any::Any).map(Cursor))
        .collect::<OrmResult<Vec<_>>>()?;

    Ok(Page {
        items: rows,
        cursors,
        has_previous_page,
        has_next_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Ident;

    fn col(name: &str) -> Node {
        Node::col(&Ident::parse(name).unwrap())
    }

    #[test]
    fn reverse_order_flips_direction_and_nulls_polarity() {
        let order = vec![(col("created_at"), true, true), (col("id"), false, false)];
        let reversed = reverse_order(&order);
        let flags: Vec<(bool, bool)> = reversed.iter().map(|(_, asc, nulls_last)| (*asc, *nulls_last)).collect();
        assert_eq!(flags, vec![(false, false), (true, true)]);
    }

    #[test]
    fn reverse_order_is_its_own_inverse() {
        let order = vec![(col("created_at"), true, true)];
        let round_tripped = reverse_order(&reverse_order(&order));
        let flags: Vec<(bool, bool)> = round_tripped.iter().map(|(_, asc, nulls_last)| (*asc, *nulls_last)).collect();
        assert_eq!(flags, vec![(true, true)]);
    }

    #[test]
    fn page_request_forward_is_false_only_with_last_or_before() {
        let forward = PageRequest {
            first: Some(10),
            after: None,
            last: None,
            before: None,
            offset: 0,
        };
        assert!(forward.forward());

        let backward_last = PageRequest {
            first: None,
            after: None,
            last: Some(10),
            before: None,
            offset: 0,
        };
        assert!(!backward_last.forward());

        let backward_before = PageRequest {
            first: None,
            after: None,
            last: None,
            before: Some(Cursor(vec![Scalar::I64(1)])),
            offset: 0,
        };
        assert!(!backward_before.forward());
    }

    #[test]
    fn page_request_limit_prefers_first_then_last_then_default() {
        let both_absent = PageRequest {
            first: None,
            after: None,
            last: None,
            before: None,
            offset: 0,
        };
        assert_eq!(both_absent.limit(), 20);

        let with_last = PageRequest {
            first: None,
            after: None,
            last: Some(5),
            before: None,
            offset: 0,
        };
        assert_eq!(with_last.limit(), 5);

        let with_first = PageRequest {
            first: Some(3),
            after: None,
            last: Some(5),
            before: None,
            offset: 0,
        };
        assert_eq!(with_first.limit(), 3);
    }

    #[test]
    fn page_request_cursor_picks_after_forward_and_before_backward() {
        let after = Cursor(vec![Scalar::I64(1)]);
        let forward = PageRequest {
            first: Some(10),
            after: Some(after.clone()),
            last: None,
            before: None,
            offset: 0,
        };
        assert_eq!(forward.cursor(), Some(&after));

        let before = Cursor(vec![Scalar::I64(2)]);
        let backward = PageRequest {
            first: None,
            after: None,
            last: Some(10),
            before: Some(before.clone()),
            offset: 0,
        };
        assert_eq!(backward.cursor(), Some(&before));
    }

    #[test]
    fn cursor_predicate_forward_single_column_is_strictly_greater() {
        let order = vec![(col("id"), true, true)];
        let vals = vec![Scalar::I64(5)];
        let mut param_gen = ParamIdGen::new();
        let mut params = ParamMap::new();
        let node = cursor_predicate(&order, &vals, &mut param_gen, &mut params);
        let mut r = crate::ast::Renderer::new();
        let sql = r.render(&node).unwrap();
        // OR(AND(gt("id", $1) OR nulls-edge)) — one disjunct, one conjunct.
        assert!(sql.contains(r#""id" > $1"#));
        assert_eq!(params.len(), 2); // the `>` comparison value plus its nulls-edge twin
    }

    #[test]
    fn cursor_predicate_on_reversed_order_flips_the_comparison() {
        // `last`/`before` paging reverses direction/nulls polarity before
        // calling `cursor_predicate` — simulate that here rather than passing
        // a separate "backward" flag alongside the unreversed order.
        let order = reverse_order(&[(col("id"), true, true)]);
        let vals = vec![Scalar::I64(5)];
        let mut param_gen = ParamIdGen::new();
        let mut params = ParamMap::new();
        let node = cursor_predicate(&order, &vals, &mut param_gen, &mut params);
        let mut r = crate::ast::Renderer::new();
        let sql = r.render(&node).unwrap();
        assert!(sql.contains(r#""id" < $1"#));
    }

    #[test]
    fn cursor_predicate_multi_column_ties_prefix_before_the_boundary() {
        let order = vec![(col("status"), true, true), (col("id"), true, true)];
        let vals = vec![Scalar::Text("open".into()), Scalar::I64(5)];
        let mut param_gen = ParamIdGen::new();
        let mut params = ParamMap::new();
        let node = cursor_predicate(&order, &vals, &mut param_gen, &mut params);
        let mut r = crate::ast::Renderer::new();
        let sql = r.render(&node).unwrap();
        // second disjunct ties on "status" before comparing "id"
        assert!(sql.contains(r#""status" = $"#));
        assert!(sql.contains(r#""id" > $"#));
    }

    #[test]
    fn cursor_predicate_regression_last_before_does_not_double_reverse() {
        // Concrete case from the review: ids 1..4 ordered by "id" ASC,
        // `paginate(last=2, before=Cursor(id=3))` must resolve to `id < 3`
        // (rows 1, 2), never `id > 3`.
        let order = reverse_order(&[(col("id"), true, true)]);
        let vals = vec![Scalar::I64(3)];
        let mut param_gen = ParamIdGen::new();
        let mut params = ParamMap::new();
        let node = cursor_predicate(&order, &vals, &mut param_gen, &mut params);
        let mut r = crate::ast::Renderer::new();
        let sql = r.render(&node).unwrap();
        assert!(sql.contains(r#""id" < $1"#));
        assert!(!sql.contains(r#""id" > "#));
    }
}
