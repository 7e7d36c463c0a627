//! Derive macros for pgaggregate.
//!
//! Provides `#[derive(Mapped)]`, which builds an `EntityMapping` from struct
//! and field attributes instead of runtime reflection.

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod mapped;

/// Derive `Mapped` for a struct, generating `build_mapping()`.
///
/// # Example
///
/// ```ignore
/// use pgaggregate::Mapped;
///
/// #[derive(Default, Clone, Mapped)]
/// #[mapped(table = "posts")]
/// struct Post {
///     #[mapped(primary_key)]
///     id: i64,
///     #[mapped(parental_key)]
///     author_id: i64,
///     title: String,
///     #[mapped(children(target = "Comment", arity = "plural"))]
///     comments: Vec<Comment>,
/// }
/// ```
///
/// # Attributes
///
/// Struct-level:
/// - `#[mapped(schema = "...")]` - schema name (defaults to `"public"`)
/// - `#[mapped(table = "...")]` - table name (required)
///
/// Field-level:
/// - `#[mapped(column = "...")]` - override the column name (defaults to the field name)
/// - `#[mapped(primary_key)]` - this field is part of the primary key
/// - `#[mapped(parental_key)]` - this field is part of the parental key
/// - `#[mapped(skip_on_update)]` - never include this field in UPDATE
/// - `#[mapped(skip_on_insert)]` - never include this field in INSERT
/// - `#[mapped(children(target = "Type", arity = "plural|singular"))]` - declare a child relationship
#[proc_macro_derive(Mapped, attributes(mapped))]
pub fn derive_mapped(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    mapped::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
