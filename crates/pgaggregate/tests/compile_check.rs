//! Compile-only tests for the core API surfaces.
//!
//! These exercise types and signatures — building mappings, catalogs, and
//! query builders — without issuing a single statement against a real
//! database.

#![allow(dead_code)]

use std::collections::HashMap;

use pgaggregate::{Ident, JoinKind, Mapped, MappingCatalog, QueryBuilder};

#[derive(Debug, Default, Clone, Mapped)]
#[mapped(table = "compile_posts")]
struct CompilePost {
    #[mapped(primary_key, skip_on_insert)]
    id: i64,
    #[mapped(parental_key)]
    author_id: i64,
    title: String,
    #[mapped(children(target = "CompileComment", arity = "plural"))]
    comments: Vec<CompileComment>,
}

#[derive(Debug, Default, Clone, Mapped)]
#[mapped(table = "compile_comments")]
struct CompileComment {
    #[mapped(primary_key, skip_on_insert)]
    id: i64,
    #[mapped(parental_key)]
    post_id: i64,
    body: String,
}

#[test]
fn mapping_validates_and_reports_key_columns() {
    let mapping = CompilePost::build_mapping();
    mapping.validate().expect("mapping should validate");
    assert_eq!(mapping.primary_key, vec!["id"]);
    assert_eq!(mapping.parental_key, vec!["author_id"]);
    assert_eq!(mapping.children.len(), 1);
    assert_eq!(mapping.children[0].target_type_name, "CompileComment");

    let insertable: Vec<&str> = mapping.insertable_fields().iter().map(|f| f.name).collect();
    assert_eq!(insertable, vec!["author_id", "title"]);
}

#[test]
fn catalog_registers_and_resolves_by_type_id() {
    let catalog = MappingCatalog::builder()
        .register_mapped::<CompilePost>()
        .unwrap()
        .register_mapped::<CompileComment>()
        .unwrap()
        .build();

    let post_mapping = catalog
        .require(std::any::TypeId::of::<CompilePost>(), "CompilePost")
        .expect("CompilePost should be registered");
    assert_eq!(post_mapping.type_name, "CompilePost");

    assert!(catalog.get(std::any::TypeId::of::<String>()).is_none());
}

#[test]
fn query_builder_chains_joins_where_and_order() {
    let _ = || -> pgaggregate::OrmResult<()> {
        let mut values = HashMap::new();
        values.insert("author".to_string(), pgaggregate::Param::new(42_i64));

        let _builder = QueryBuilder::<CompilePost>::new("p")?
            .join(
                JoinKind::Left,
                "public",
                "compile_comments",
                "c",
                "c.post_id = p.id",
                &HashMap::new(),
            )?
            .where_("p.author_id = :author", &values)?
            .order_by("p.id", &HashMap::new(), true, true)?;
        Ok(())
    };
}

#[test]
fn into_key_value_accepts_bare_scalars_and_tuples() {
    use pgaggregate::IntoKeyValue;

    let _ = 7_i64.into_key_value().unwrap();
    let _ = "slug".into_key_value().unwrap();
    let _ = (1_i64, "tenant".to_string()).into_key_value().unwrap();
}

#[test]
fn ident_rejects_sql_injection_attempts() {
    assert!(Ident::parse("author_id").is_ok());
    assert!(Ident::parse("name; DROP TABLE compile_posts").is_err());
    assert!(Ident::parse("").is_err());
}
