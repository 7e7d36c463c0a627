//! `#[derive(Mapped)]` implementation.
//!
//! Reads `#[mapped(schema = "...", table = "...")]` off the struct and
//! `#[mapped(column = "...")]` / `#[mapped(primary_key)]` /
//! `#[mapped(parental_key)]` / `#[mapped(skip_on_update)]` /
//! `#[mapped(skip_on_insert)]` / `#[mapped(children(target = "Type", arity =
//! "plural|singular"))]` off each field, and emits a `build_mapping()` that
//! assembles an `EntityMapping` from generated field/child closures.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Result};

struct StructAttrs {
    schema: String,
    table: String,
}

struct FieldAttrs {
    column: Option<String>,
    primary_key: bool,
    parental_key: bool,
    skip_on_update: bool,
    skip_on_insert: bool,
    children: Option<ChildAttrs>,
}

struct ChildAttrs {
    target: syn::Path,
    singular: bool,
}

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;
    let struct_attrs = parse_struct_attrs(&input)?;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input,
                    "Mapped can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "Mapped can only be derived for structs",
            ))
        }
    };

    let mut field_exprs = Vec::new();
    let mut child_exprs = Vec::new();
    let mut primary_key_names = Vec::new();
    let mut parental_key_names = Vec::new();

    for field in fields.iter() {
        let ident = field.ident.as_ref().unwrap();
        let attrs = parse_field_attrs(field)?;

        if let Some(child) = attrs.children {
            child_exprs.push(child_expr(ident, &child));
            continue;
        }

        let field_name = ident.to_string();
        let column_name = attrs.column.unwrap_or_else(|| field_name.clone());
        let insertable = !attrs.skip_on_insert;
        let updatable = !attrs.primary_key && !attrs.skip_on_update;

        if attrs.primary_key {
            primary_key_names.push(field_name.clone());
        }
        if attrs.parental_key {
            parental_key_names.push(field_name.clone());
        }

        field_exprs.push(field_expr(name, ident, &field_name, &column_name, insertable, updatable));
    }

    let schema = &struct_attrs.schema;
    let table = &struct_attrs.table;
    let primary_key = quote! { vec![#(#primary_key_names),*] };
    let parental_key = quote! { vec![#(#parental_key_names),*] };

    let expanded = quote! {
        impl ::pgaggregate::mapping::Mapped for #name {
            fn build_mapping() -> ::pgaggregate::mapping::EntityMapping {
                use ::pgaggregate::mapping::{Arity, Child, EntityMapping, Field};
                use std::any::{Any, TypeId};
                use std::sync::Arc;

                ::pgaggregate::mapping::EntityMapping {
                    entity_type: TypeId::of::<#name>(),
                    type_name: stringify!(#name),
                    schema: ::pgaggregate::ident::Ident::parse(#schema).expect("static schema identifier"),
                    table: ::pgaggregate::ident::Ident::parse(#table).expect("static table identifier"),
                    factory: Arc::new(|| Box::new(#name::default()) as ::pgaggregate::mapping::AnyEntity),
                    fields: vec![#(#field_exprs),*],
                    primary_key: #primary_key,
                    parental_key: #parental_key,
                    children: vec![#(#child_exprs),*],
                }
            }
        }
    };

    Ok(expanded)
}

fn field_expr(
    name: &syn::Ident,
    ident: &syn::Ident,
    field_name: &str,
    column_name: &str,
    insertable: bool,
    updatable: bool,
) -> TokenStream {
    quote! {
        Field {
            name: #field_name,
            column: ::pgaggregate::ident::Ident::parse(#column_name).expect("static column identifier"),
            column_name: #column_name,
            insertable: #insertable,
            updatable: #updatable,
            get: Arc::new(|entity: &dyn Any| {
                let entity = entity.downcast_ref::<#name>().expect("mapping applied to the wrong type");
                ::pgaggregate::ast::Param::new(entity.#ident.clone())
            }),
            get_scalar_fn: Arc::new(|entity: &dyn Any| {
                let entity = entity.downcast_ref::<#name>().expect("mapping applied to the wrong type");
                ::pgaggregate::mapping::ToScalar::to_scalar(&entity.#ident)
            }),
            set_from_row: Arc::new(|entity: &mut dyn Any, row: &::pgaggregate::row::Row, column: &str| {
                let entity = entity.downcast_mut::<#name>().expect("mapping applied to the wrong type");
                entity.#ident = row
                    .try_get(column)
                    .map_err(|e| ::pgaggregate::error::OrmError::decode(column, e.to_string()))?;
                Ok(())
            }),
            set_scalar: Arc::new(|entity: &mut dyn Any, scalar: &::pgaggregate::mapping::Scalar| {
                let entity = entity.downcast_mut::<#name>().expect("mapping applied to the wrong type");
                ::pgaggregate::mapping::FromScalar::assign_from_scalar(&mut entity.#ident, scalar);
            }),
        }
    }
}

fn child_expr(ident: &syn::Ident, child: &ChildAttrs) -> TokenStream {
    let target = &child.target;
    let name = ident.to_string();
    let arity = if child.singular {
        quote! { Arity::Singular }
    } else {
        quote! { Arity::Plural }
    };
    let take_body = if child.singular {
        quote! {
            let parent = entity.downcast_mut::<Self>().expect("mapping applied to the wrong type");
            parent.#ident.take().into_iter().map(|c| Box::new(c) as ::pgaggregate::mapping::AnyEntity).collect()
        }
    } else {
        quote! {
            let parent = entity.downcast_mut::<Self>().expect("mapping applied to the wrong type");
            std::mem::take(&mut parent.#ident)
                .into_iter()
                .map(|c| Box::new(c) as ::pgaggregate::mapping::AnyEntity)
                .collect()
        }
    };
    let put_body = if child.singular {
        quote! {
            let parent = entity.downcast_mut::<Self>().expect("mapping applied to the wrong type");
            parent.#ident = children
                .into_iter()
                .next()
                .map(|c| *c.downcast::<#target>().expect("mapping applied to the wrong type"));
        }
    } else {
        quote! {
            let parent = entity.downcast_mut::<Self>().expect("mapping applied to the wrong type");
            parent.#ident = children
                .into_iter()
                .map(|c| *c.downcast::<#target>().expect("mapping applied to the wrong type"))
                .collect();
        }
    };

    quote! {
        Child {
            name: #name,
            target_type: TypeId::of::<#target>(),
            target_type_name: stringify!(#target),
            arity: #arity,
            take: Arc::new(|entity: &mut dyn Any| { #take_body }),
            put: Arc::new(|entity: &mut dyn Any, children: Vec<::pgaggregate::mapping::AnyEntity>| { #put_body }),
        }
    }
}

fn parse_struct_attrs(input: &DeriveInput) -> Result<StructAttrs> {
    let mut schema = "public".to_string();
    let mut table = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("mapped") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("schema") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                schema = lit.value();
                Ok(())
            } else if meta.path.is_ident("table") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                table = Some(lit.value());
                Ok(())
            } else {
                Err(meta.error("unrecognized mapped(...) struct attribute"))
            }
        })?;
    }

    let table = table.ok_or_else(|| {
        syn::Error::new_spanned(input, "Mapped requires #[mapped(table = \"...\")]")
    })?;

    Ok(StructAttrs { schema, table })
}

fn parse_field_attrs(field: &syn::Field) -> Result<FieldAttrs> {
    let mut attrs = FieldAttrs {
        column: None,
        primary_key: false,
        parental_key: false,
        skip_on_update: false,
        skip_on_insert: false,
        children: None,
    };

    for attr in &field.attrs {
        if !attr.path().is_ident("mapped") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("column") {
                let value = meta.value()?;
                let lit: syn::LitStr = value.parse()?;
                attrs.column = Some(lit.value());
                Ok(())
            } else if meta.path.is_ident("primary_key") {
                attrs.primary_key = true;
                Ok(())
            } else if meta.path.is_ident("parental_key") {
                attrs.parental_key = true;
                Ok(())
            } else if meta.path.is_ident("skip_on_update") {
                attrs.skip_on_update = true;
                Ok(())
            } else if meta.path.is_ident("skip_on_insert") {
                attrs.skip_on_insert = true;
                Ok(())
            } else if meta.path.is_ident("children") {
                let mut target = None;
                let mut singular = false;
                meta.parse_nested_meta(|inner| {
                    if inner.path.is_ident("target") {
                        let value = inner.value()?;
                        let lit: syn::LitStr = value.parse()?;
                        target = Some(lit.value());
                        Ok(())
                    } else if inner.path.is_ident("arity") {
                        let value = inner.value()?;
                        let lit: syn::LitStr = value.parse()?;
                        singular = lit.value() == "singular";
                        Ok(())
                    } else {
                        Err(inner.error("unrecognized children(...) attribute"))
                    }
                })?;
                let target = target.ok_or_else(|| {
                    meta.error("children(...) requires target = \"TypeName\"")
                })?;
                let target_path: syn::Path = syn::parse_str(&target)?;
                attrs.children = Some(ChildAttrs {
                    target: target_path,
                    singular,
                });
                Ok(())
            } else {
                Err(meta.error("unrecognized mapped(...) field attribute"))
            }
        })?;
    }

    Ok(attrs)
}
