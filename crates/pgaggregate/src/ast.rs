//! Tagged SQL AST and renderer.
//!
//! Every statement the engine, query builder, and paginator emit is built from
//! [`Node`] values and rendered through a [`Renderer`], which assigns each
//! distinct [`ParamId`] exactly one positional `$n` slot the first time it is
//! encountered. Rendering the same node twice with the same `ParamId` reuses
//! the slot rather than allocating a new one — this is what gives parameter
//! deduplication across a whole statement, not just within one expression.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_postgres::types::ToSql;

use crate::error::{OrmError, OrmResult};
use crate::ident::Ident;

/// A clone-friendly parameter value, mirroring the Arc-wrapped `ToSql` used
/// throughout the rest of the crate so builders can be cloned cheaply.
#[derive(Clone)]
pub struct Param(pub Arc<dyn ToSql + Send + Sync>);

impl Param {
    pub fn new<T: ToSql + Send + Sync + 'static>(value: T) -> Self {
        Param(Arc::new(value))
    }

    pub fn as_ref(&self) -> &(dyn ToSql + Sync) {
        &*self.0 as &(dyn ToSql + Sync)
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Param").field(&"<dyn ToSql>").finish()
    }
}

/// Opaque token identifying one logical parameter across an AST.
///
/// Any comparable, hashable value could serve this role; a monotonically
/// increasing counter is the simplest one that needs no external state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub u32);

/// Mints fresh, never-repeating `ParamId`s within one building context (one
/// query builder, one fragment parse, one engine statement).
#[derive(Default)]
pub struct ParamIdGen(u32);

impl ParamIdGen {
    pub fn new() -> Self {
        Self(0)
    }

    /// Resumes minting from `start` — used when a second generator (e.g. the
    /// paginator's limit/offset params) must not collide with ids already
    /// handed out by a first one over the same statement.
    pub fn resume_from(start: u32) -> Self {
        Self(start)
    }

    /// Number of ids minted so far.
    pub fn count(&self) -> u32 {
        self.0
    }

    pub fn next(&mut self) -> ParamId {
        self.0 += 1;
        ParamId(self.0)
    }
}

/// The value bound to each `ParamId` referenced by one statement execution.
pub type ParamMap = HashMap<ParamId, Param>;

/// A tagged SQL expression node.
#[derive(Clone, Debug)]
pub enum Node {
    /// A single identifier segment (or a dotted chain already joined, see [`Ident`]).
    Name(Ident),
    /// Two identifiers joined by `.` — schema-qualified table, or table-qualified column.
    QName(Ident, Ident),
    /// Verbatim SQL text: keywords, operators, already-safe literals. Never user data.
    Text(String),
    /// A bound parameter, rendered as `$n`.
    Param(ParamId),
    /// Conjunction: `(a AND b AND ...)`. Empty is a caller error.
    All(Vec<Node>),
    /// Disjunction: `(a OR b OR ...)`. Empty is a caller error.
    Any(Vec<Node>),
    Eq(Box<Node>, Box<Node>),
    Lt(Box<Node>, Box<Node>),
    Gt(Box<Node>, Box<Node>),
    IsNull(Box<Node>),
    IsNotNull(Box<Node>),
    /// Concatenation with no separator — used to splice parsed fragments inline.
    Fragment(Vec<Node>),
}

impl Node {
    pub fn col(ident: &Ident) -> Node {
        Node::Name(ident.clone())
    }

    pub fn eq(l: Node, r: Node) -> Node {
        Node::Eq(Box::new(l), Box::new(r))
    }

    pub fn lt(l: Node, r: Node) -> Node {
        Node::Lt(Box::new(l), Box::new(r))
    }

    pub fn gt(l: Node, r: Node) -> Node {
        Node::Gt(Box::new(l), Box::new(r))
    }

    pub fn is_null(n: Node) -> Node {
        Node::IsNull(Box::new(n))
    }

    pub fn is_not_null(n: Node) -> Node {
        Node::IsNotNull(Box::new(n))
    }
}

/// Stateful renderer for one statement: assigns parameter slots in first-seen order.
#[derive(Default)]
pub struct Renderer {
    param_locations: Vec<ParamId>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct parameters seen so far.
    pub fn param_count(&self) -> usize {
        self.param_locations.len()
    }

    fn slot_for(&mut self, id: ParamId) -> usize {
        if let Some(pos) = self.param_locations.iter().position(|p| *p == id) {
            return pos + 1;
        }
        self.param_locations.push(id);
        self.param_locations.len()
    }

    pub fn render(&mut self, node: &Node) -> OrmResult<String> {
        Ok(match node {
            Node::Name(ident) => ident.to_sql(),
            Node::QName(a, b) => format!("{}.{}", a.to_sql(), b.to_sql()),
            Node::Text(s) => s.clone(),
            Node::Param(id) => format!("${}", self.slot_for(*id)),
            Node::All(xs) => {
                if xs.is_empty() {
                    return Err(OrmError::InvariantViolation(
                        "All() requires at least one expression".into(),
                    ));
                }
                let parts: Vec<String> = xs.iter().map(|x| self.render(x)).collect::<OrmResult<_>>()?;
                format!("({})", parts.join(" AND "))
            }
            Node::Any(xs) => {
                if xs.is_empty() {
                    return Err(OrmError::InvariantViolation(
                        "Any() requires at least one expression".into(),
                    ));
                }
                let parts: Vec<String> = xs.iter().map(|x| self.render(x)).collect::<OrmResult<_>>()?;
                format!("({})", parts.join(" OR "))
            }
            Node::Eq(l, r) => format!("({} = {})", self.render(l)?, self.render(r)?),
            Node::Lt(l, r) => format!("({} < {})", self.render(l)?, self.render(r)?),
            Node::Gt(l, r) => format!("({} > {})", self.render(l)?, self.render(r)?),
            Node::IsNull(n) => format!("({} IS NULL)", self.render(n)?),
            Node::IsNotNull(n) => format!("({} IS NOT NULL)", self.render(n)?),
            Node::Fragment(xs) => {
                let parts: Vec<String> = xs.iter().map(|x| self.render(x)).collect::<OrmResult<_>>()?;
                parts.concat()
            }
        })
    }

    /// Resolve this renderer's parameter slots against a concrete value map,
    /// in slot order, ready to pass to the backend.
    pub fn bind<'a>(&self, map: &'a ParamMap) -> OrmResult<Vec<&'a (dyn ToSql + Sync)>> {
        self.param_locations
            .iter()
            .map(|id| {
                map.get(id)
                    .map(Param::as_ref)
                    .ok_or_else(|| OrmError::InvariantViolation(format!("unbound parameter {id:?}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(s: &str) -> Ident {
        Ident::parse(s).unwrap()
    }

    #[test]
    fn renders_equality_with_single_slot() {
        let mut r = Renderer::new();
        let node = Node::eq(Node::col(&ident("id")), Node::Param(ParamId(1)));
        assert_eq!(r.render(&node).unwrap(), r#"("id" = $1)"#);
    }

    #[test]
    fn dedups_repeated_param_id() {
        let mut r = Renderer::new();
        let node = Node::All(vec![
            Node::eq(Node::col(&ident("a")), Node::Param(ParamId(7))),
            Node::eq(Node::col(&ident("b")), Node::Param(ParamId(7))),
        ]);
        let sql = r.render(&node).unwrap();
        assert_eq!(sql, r#"(("a" = $1) AND ("b" = $1))"#);
        assert_eq!(r.param_count(), 1);
    }

    #[test]
    fn distinct_param_ids_get_distinct_slots() {
        let mut r = Renderer::new();
        let node = Node::All(vec![
            Node::eq(Node::col(&ident("a")), Node::Param(ParamId(1))),
            Node::eq(Node::col(&ident("b")), Node::Param(ParamId(2))),
        ]);
        let sql = r.render(&node).unwrap();
        assert_eq!(sql, r#"(("a" = $1) AND ("b" = $2))"#);
    }

    #[test]
    fn empty_all_is_invariant_violation() {
        let mut r = Renderer::new();
        assert!(r.render(&Node::All(vec![])).is_err());
    }

    #[test]
    fn qname_renders_dot_joined_quoted_parts() {
        let mut r = Renderer::new();
        let node = Node::QName(ident("posts"), ident("title"));
        assert_eq!(r.render(&node).unwrap(), r#""posts"."title""#);
    }

    #[test]
    fn name_doubles_embedded_quote() {
        let mut r = Renderer::new();
        let node = Node::col(&Ident::quoted(r#"x"y"#).unwrap());
        assert_eq!(r.render(&node).unwrap(), r#""x""y""#);
    }

    #[test]
    fn bind_resolves_in_slot_order() {
        let mut r = Renderer::new();
        let a = ParamId(10);
        let b = ParamId(20);
        let node = Node::All(vec![
            Node::eq(Node::col(&ident("x")), Node::Param(b)),
            Node::eq(Node::col(&ident("y")), Node::Param(a)),
        ]);
        r.render(&node).unwrap();
        let mut map = ParamMap::new();
        map.insert(a, Param::new(1i32));
        map.insert(b, Param::new(2i32));
        let bound = r.bind(&map).unwrap();
        assert_eq!(bound.len(), 2);
    }

    #[test]
    fn bind_missing_param_errors() {
        let mut r = Renderer::new();
        r.render(&Node::Param(ParamId(1))).unwrap();
        assert!(r.bind(&ParamMap::new()).is_err());
    }
}
