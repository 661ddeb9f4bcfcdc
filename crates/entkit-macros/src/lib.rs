//! Procedural macros for entkit.
//!
//! `entkit-macros` is the **compile-time codegen layer**. It turns annotated
//! structs and enums into entities by generating the static
//! `EntityDescriptor` and the `Entity` implementation that reads and writes
//! rows.
//!
//! # Role In The Architecture
//!
//! - **Entity metadata**: `#[derive(Entity)]` emits the descriptor the
//!   metamodel validates, with fields, embedded values, value collections,
//!   relationships and inheritance.
//! - **Row conversion**: the same derive writes `to_row`/`from_row`, relation
//!   views and attach dispatch, so mapping code and metadata never drift.
//! - **Embedded values**: `#[derive(Embeddable)]` implements the value codec
//!   and publishes default columns for embeddings.
//!
//! Applications use these through the `entkit` facade.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Error, Ident};

mod infer;
mod parse;

use parse::{
    ElementsDef, EntityDef, FieldDef, FieldKind, Hierarchy, RelationDef, RelationKind, Shape,
    parse_embeddable, parse_entity,
};

/// Derive macro for the `Entity` trait.
///
/// Generates a static `EntityDescriptor` and an `Entity` implementation:
/// key access, row conversion, relation views and attach dispatch, value
/// collection loading and version assignment.
///
/// # Container attributes
///
/// - `#[entity(name = "...")]` - Entity name (defaults to the type name)
/// - `#[entity(table = "...")]` - Base table (defaults to snake_case type name)
/// - `#[entity(inheritance = "single_table" | "joined")]` - On enums; each
///   variant is a concrete subtype
/// - `#[entity(discriminator = "column")]` - Discriminator column
///
/// Variants accept `#[entity(discriminator = "value", table = "...")]`.
///
/// # Field attributes
///
/// - `id`, `generated` - The key, and whether the store assigns it
/// - `column = "..."`, `sql_type = "..."`, `nullable`, `version`
/// - `skip`, `skip_insert`, `skip_update`
/// - `embedded` - An `Embeddable` value flattened into the owner's columns
/// - `collection(table = "...", owner_column = "...", column = "...")` - A
///   `Vec<T>` of values in an auxiliary table
/// - `many_to_one(...)`, `one_to_one(...)` on `Ref<T>`; `one_to_many(...)`,
///   `many_to_many(...)` on `Collection<T>`. Options: `target`,
///   `join_column`, `join_table`, `owner_column`, `target_column`,
///   `mapped_by`, `cascade = "persist, remove"`, `fetch = "eager"`,
///   `required`, `read_only`
///
/// An unannotated `Ref<T>` is a many-to-one joined on `<field>_id`.
///
/// # Example
///
/// ```ignore
/// use entkit::{Collection, Entity, Ref};
///
/// #[derive(Debug, Entity)]
/// struct Member {
///     #[entity(id, generated, column = "member_id")]
///     id: Option<i64>,
///
///     #[entity(column = "username")]
///     name: Option<String>,
///
///     team: Ref<Team>,
///
///     #[entity(many_to_many(join_table = "member_project", owner_column = "member_id",
///                           target_column = "project_code", cascade = "persist"))]
///     projects: Collection<Project>,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as syn::DeriveInput);

    let entity = match parse_entity(&input) {
        Ok(e) => e,
        Err(e) => return e.to_compile_error().into(),
    };

    match generate_entity_impl(&entity) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

/// Derive macro for the `Embeddable` codec.
///
/// Fields are encoded in declaration order; `#[entity(column = "...")]`
/// renames a default column.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Embeddable)]
/// struct Address {
///     city: String,
///     street: String,
/// }
/// ```
#[proc_macro_derive(Embeddable, attributes(entity))]
pub fn derive_embeddable(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as syn::DeriveInput);
    match parse_embeddable(&input) {
        Ok(fields) => generate_embeddable_impl(&input.ident, &fields).into(),
        Err(e) => e.to_compile_error().into(),
    }
}

// ============================================================================
// Entity
// ============================================================================

fn generate_entity_impl(entity: &EntityDef) -> syn::Result<TokenStream2> {
    match &entity.shape {
        Shape::Struct(fields) => Ok(generate_struct_impl(entity, fields)),
        Shape::Hierarchy(hierarchy) => generate_hierarchy_impl(entity, hierarchy),
    }
}

fn generate_struct_impl(entity: &EntityDef, fields: &[FieldDef]) -> TokenStream2 {
    let ident = &entity.ident;
    let name = &entity.name;
    let table = &entity.table;

    let id = id_field(fields);
    let id_info = generate_id_info(id);
    let columns = column_fields(fields);
    let field_infos = columns.iter().map(|f| generate_field_info(f));

    let embedded: Vec<&FieldDef> = fields
        .iter()
        .filter(|f| matches!(f.kind, FieldKind::Embedded))
        .collect();
    let embedded_infos = embedded.iter().map(|f| {
        let field_name = f.ident.to_string();
        let inner = infer::unwrap_option_type(&f.ty);
        quote! {
            ::entkit_core::EmbeddedInfo {
                name: #field_name,
                fields: <#inner as ::entkit_core::Embeddable>::FIELDS,
            }
        }
    });
    let embedded_count = embedded.len();

    let collections: Vec<(&FieldDef, &ElementsDef)> = fields
        .iter()
        .filter_map(|f| match &f.kind {
            FieldKind::Elements(elements) => Some((f, elements)),
            _ => None,
        })
        .collect();
    let collection_infos = collections
        .iter()
        .map(|(f, elements)| generate_value_collection_info(f, elements));
    let collection_count = collections.len();

    let relations: Vec<(&FieldDef, &RelationDef)> = fields
        .iter()
        .filter_map(|f| match &f.kind {
            FieldKind::Relation(relation) => Some((f, relation)),
            _ => None,
        })
        .collect();
    let relation_infos = relations
        .iter()
        .map(|(f, relation)| generate_relationship_info(f, relation));

    let id_ident = &id.ident;
    let (id_body, set_id_body) = if infer::is_option_type(&id.ty) {
        (
            quote! { ::core::clone::Clone::clone(&self.#id_ident).map(::core::convert::Into::into) },
            quote! { self.#id_ident = Some(::entkit_core::FromValue::from_value(&new_id)?); },
        )
    } else {
        (
            quote! { Some(::core::convert::Into::into(::core::clone::Clone::clone(&self.#id_ident))) },
            quote! { self.#id_ident = ::entkit_core::FromValue::from_value(&new_id)?; },
        )
    };

    let to_row_columns = columns.iter().map(|f| {
        let field = &f.ident;
        let column = &f.column;
        quote! {
            row.push((#column, ::core::convert::Into::<::entkit_core::Value>::into(
                ::core::clone::Clone::clone(&self.#field),
            )));
        }
    });
    let to_row_embedded = embedded.iter().enumerate().map(|(i, f)| {
        let field = &f.ident;
        let value = if infer::is_option_type(&f.ty) {
            quote! { self.#field.as_ref() }
        } else {
            quote! { Some(&self.#field) }
        };
        quote! { row.extend(::entkit_core::codec::encode(&EMBEDDED[#i], #value)); }
    });

    let mut embedded_index = 0usize;
    let from_row_fields = fields.iter().map(|f| {
        let field = &f.ident;
        let field_name = field.to_string();
        let column = &f.column;
        let value = match &f.kind {
            FieldKind::Id { .. } | FieldKind::Column => quote! { row.get_named(#column)? },
            FieldKind::Embedded => {
                let i = embedded_index;
                embedded_index += 1;
                if infer::is_option_type(&f.ty) {
                    quote! { ::entkit_core::codec::decode(&EMBEDDED[#i], row)? }
                } else {
                    quote! {
                        ::entkit_core::codec::decode(&EMBEDDED[#i], row)?.ok_or_else(|| {
                            ::entkit_core::Error::mapping(#name, concat!("embedded value '", #field_name, "' is NULL"))
                        })?
                    }
                }
            }
            FieldKind::Elements(_) | FieldKind::Skip => quote! { ::core::default::Default::default() },
            FieldKind::Relation(relation) if relation.many => {
                quote! { scope.collection_from(row, #field_name)? }
            }
            FieldKind::Relation(_) => quote! { scope.reference_from(row, #field_name)? },
        };
        quote! { #field: #value }
    });

    let relation_methods = generate_relation_methods(name, &relations);
    let collection_methods = generate_collection_methods(name, &collections);
    let version_method = generate_set_version(columns.iter().copied());

    quote! {
        const _: () = {
            static EMBEDDED: [::entkit_core::EmbeddedInfo; #embedded_count] = [#(#embedded_infos),*];
            static VALUE_COLLECTIONS: [::entkit_core::ValueCollectionInfo; #collection_count] =
                [#(#collection_infos),*];
            static DESCRIPTOR: ::entkit_core::EntityDescriptor = ::entkit_core::EntityDescriptor {
                name: #name,
                table: #table,
                id: #id_info,
                fields: &[#(#field_infos),*],
                embedded: &EMBEDDED,
                relationships: &[#(#relation_infos),*],
                value_collections: &VALUE_COLLECTIONS,
                inheritance: None,
                factory: ::entkit_core::entity_factory::<#ident>,
            };

            impl ::entkit_core::Entity for #ident {
                fn descriptor() -> &'static ::entkit_core::EntityDescriptor {
                    &DESCRIPTOR
                }

                fn id(&self) -> Option<::entkit_core::Value> {
                    #id_body
                }

                fn set_id(&mut self, new_id: ::entkit_core::Value) -> ::entkit_core::Result<()> {
                    #set_id_body
                    Ok(())
                }

                #[allow(unused_mut)]
                fn to_row(&self) -> Vec<(&'static str, ::entkit_core::Value)> {
                    let mut row = Vec::new();
                    #(#to_row_columns)*
                    #(#to_row_embedded)*
                    row
                }

                #[allow(unused_variables)]
                fn from_row(
                    row: &::entkit_core::Row,
                    scope: &::entkit_core::HydrateScope,
                ) -> ::entkit_core::Result<Self> {
                    Ok(#ident {
                        #(#from_row_fields),*
                    })
                }

                #relation_methods
                #collection_methods
                #version_method
            }
        };
    }
}

fn generate_relation_methods(name: &str, relations: &[(&FieldDef, &RelationDef)]) -> TokenStream2 {
    if relations.is_empty() {
        return quote! {};
    }
    let views = relations.iter().map(|(f, _)| {
        let field = &f.ident;
        let field_name = field.to_string();
        quote! { self.#field.view(#field_name) }
    });
    let arms = relations.iter().map(|(f, _)| {
        let field = &f.ident;
        let field_name = field.to_string();
        quote! { #field_name => self.#field.attach(value), }
    });
    quote! {
        fn relations(&self) -> Vec<::entkit_core::RelationView> {
            vec![#(#views),*]
        }

        fn attach(
            &mut self,
            relation: &str,
            value: ::entkit_core::RelationValue,
        ) -> ::entkit_core::Result<()> {
            match relation {
                #(#arms)*
                other => Err(::entkit_core::unknown_relation(#name, other)),
            }
        }
    }
}

fn generate_collection_methods(
    name: &str,
    collections: &[(&FieldDef, &ElementsDef)],
) -> TokenStream2 {
    if collections.is_empty() {
        return quote! {};
    }
    let encoded = collections.iter().map(|(f, _)| {
        let field = &f.ident;
        let field_name = field.to_string();
        quote! { (#field_name, ::entkit_core::codec::encode_elements(&self.#field)) }
    });
    let arms = collections.iter().enumerate().map(|(i, (f, _))| {
        let field = &f.ident;
        let field_name = field.to_string();
        quote! {
            #field_name => {
                self.#field = ::entkit_core::codec::decode_elements(&VALUE_COLLECTIONS[#i], rows)?;
                Ok(())
            }
        }
    });
    quote! {
        fn value_collections(&self) -> Vec<(&'static str, Vec<Vec<::entkit_core::Value>>)> {
            vec![#(#encoded),*]
        }

        fn load_value_collection(
            &mut self,
            name: &str,
            rows: &[::entkit_core::Row],
        ) -> ::entkit_core::Result<()> {
            match name {
                #(#arms)*
                other => Err(::entkit_core::Error::mapping(
                    #name,
                    format!("no value collection named '{}'", other),
                )),
            }
        }
    }
}

fn generate_set_version<'a>(mut columns: impl Iterator<Item = &'a FieldDef>) -> TokenStream2 {
    let Some(version) = columns.find(|f| f.version) else {
        return quote! {};
    };
    let field = &version.ident;
    quote! {
        fn set_version(&mut self, new_version: ::entkit_core::Value) -> ::entkit_core::Result<()> {
            self.#field = ::entkit_core::FromValue::from_value(&new_version)?;
            Ok(())
        }
    }
}

// ============================================================================
// Hierarchies
// ============================================================================

fn generate_hierarchy_impl(entity: &EntityDef, hierarchy: &Hierarchy) -> syn::Result<TokenStream2> {
    let ident = &entity.ident;
    let name = &entity.name;
    let table = &entity.table;
    let first = &hierarchy.variants[0];

    // Base fields are those every variant declares, in the first variant's order.
    let base: Vec<&FieldDef> = column_fields(&first.fields)
        .into_iter()
        .filter(|f| {
            hierarchy.variants.iter().all(|v| v.fields.iter().any(|g| g.ident == f.ident))
        })
        .collect();
    let first_id = id_field(&first.fields);
    for variant in &hierarchy.variants[1..] {
        let id = id_field(&variant.fields);
        if id.column != first_id.column || id.ident != first_id.ident {
            return Err(Error::new_spanned(
                &id.ident,
                "every subtype must declare the same id field and column",
            ));
        }
        for field in &base {
            let same = variant.fields.iter().find(|g| g.ident == field.ident);
            if let Some(other) = same.filter(|g| g.column != field.column) {
                return Err(Error::new_spanned(
                    &other.ident,
                    "a field shared by every subtype must map to the same column",
                ));
            }
        }
    }
    let is_base = |f: &FieldDef| base.iter().any(|b| b.ident == f.ident);

    let id_info = generate_id_info(first_id);
    let base_infos = base.iter().map(|f| generate_field_info(f));
    let strategy = match (hierarchy.joined, hierarchy.discriminator.as_deref()) {
        (false, None) => quote! { ::entkit_core::InheritanceStrategy::single_table() },
        (false, Some(column)) => {
            quote! { ::entkit_core::InheritanceStrategy::SingleTable { discriminator: #column } }
        }
        (true, None) => quote! { ::entkit_core::InheritanceStrategy::joined() },
        (true, Some(column)) => {
            quote! { ::entkit_core::InheritanceStrategy::joined_with_discriminator(#column) }
        }
    };
    let subtype_infos = hierarchy.variants.iter().map(|variant| {
        let subtype = variant.ident.to_string();
        let discriminator_value = &variant.discriminator_value;
        let subtable = &variant.table;
        let own = column_fields(&variant.fields)
            .into_iter()
            .filter(|f| !is_base(*f))
            .map(generate_field_info);
        quote! {
            ::entkit_core::SubtypeInfo {
                name: #subtype,
                discriminator_value: #discriminator_value,
                table: #subtable,
                fields: &[#(#own),*],
            }
        }
    });

    let id_ident = &first_id.ident;
    let id_arms = hierarchy.variants.iter().map(|variant| {
        let v = &variant.ident;
        let id = id_field(&variant.fields);
        let body = if infer::is_option_type(&id.ty) {
            quote! { ::core::clone::Clone::clone(#id_ident).map(::core::convert::Into::into) }
        } else {
            quote! { Some(::core::convert::Into::into(::core::clone::Clone::clone(#id_ident))) }
        };
        quote! { #ident::#v { #id_ident, .. } => #body, }
    });
    let set_id_arms = hierarchy.variants.iter().map(|variant| {
        let v = &variant.ident;
        let id = id_field(&variant.fields);
        let body = if infer::is_option_type(&id.ty) {
            quote! { *#id_ident = Some(::entkit_core::FromValue::from_value(&new_id)?) }
        } else {
            quote! { *#id_ident = ::entkit_core::FromValue::from_value(&new_id)? }
        };
        quote! { #ident::#v { #id_ident, .. } => #body, }
    });
    let to_row_arms = hierarchy.variants.iter().map(|variant| {
        let v = &variant.ident;
        let columns = column_fields(&variant.fields);
        let bindings = columns.iter().map(|f| &f.ident);
        let pairs = columns.iter().map(|f| {
            let field = &f.ident;
            let column = &f.column;
            quote! {
                (#column, ::core::convert::Into::<::entkit_core::Value>::into(
                    ::core::clone::Clone::clone(#field),
                ))
            }
        });
        quote! { #ident::#v { #(#bindings,)* .. } => vec![#(#pairs),*], }
    });
    let from_row_arms = hierarchy.variants.iter().map(|variant| {
        let v = &variant.ident;
        let subtype = v.to_string();
        let values = variant.fields.iter().map(|f| {
            let field = &f.ident;
            let column = &f.column;
            match f.kind {
                FieldKind::Skip => quote! { #field: ::core::default::Default::default() },
                _ => quote! { #field: row.get_named(#column)? },
            }
        });
        quote! { Some(#subtype) => Ok(#ident::#v { #(#values),* }), }
    });
    let subtype_arms = hierarchy.variants.iter().map(|variant| {
        let v = &variant.ident;
        let subtype = v.to_string();
        quote! { #ident::#v { .. } => Some(#subtype), }
    });
    let version_method = match base.iter().find(|f| f.version) {
        Some(version) => {
            let field = &version.ident;
            let arms = hierarchy.variants.iter().map(|variant| {
                let v = &variant.ident;
                quote! { #ident::#v { #field, .. } => *#field = ::entkit_core::FromValue::from_value(&new_version)?, }
            });
            quote! {
                fn set_version(&mut self, new_version: ::entkit_core::Value) -> ::entkit_core::Result<()> {
                    match self {
                        #(#arms)*
                    }
                    Ok(())
                }
            }
        }
        None => quote! {},
    };

    Ok(quote! {
        const _: () = {
            static DESCRIPTOR: ::entkit_core::EntityDescriptor = ::entkit_core::EntityDescriptor {
                name: #name,
                table: #table,
                id: #id_info,
                fields: &[#(#base_infos),*],
                embedded: &[],
                relationships: &[],
                value_collections: &[],
                inheritance: Some(::entkit_core::InheritanceInfo {
                    strategy: #strategy,
                    subtypes: &[#(#subtype_infos),*],
                }),
                factory: ::entkit_core::entity_factory::<#ident>,
            };

            impl ::entkit_core::Entity for #ident {
                fn descriptor() -> &'static ::entkit_core::EntityDescriptor {
                    &DESCRIPTOR
                }

                fn id(&self) -> Option<::entkit_core::Value> {
                    match self {
                        #(#id_arms)*
                    }
                }

                fn set_id(&mut self, new_id: ::entkit_core::Value) -> ::entkit_core::Result<()> {
                    match self {
                        #(#set_id_arms)*
                    }
                    Ok(())
                }

                fn to_row(&self) -> Vec<(&'static str, ::entkit_core::Value)> {
                    match self {
                        #(#to_row_arms)*
                    }
                }

                fn from_row(
                    row: &::entkit_core::Row,
                    scope: &::entkit_core::HydrateScope,
                ) -> ::entkit_core::Result<Self> {
                    match scope.subtype() {
                        #(#from_row_arms)*
                        other => Err(::entkit_core::Error::mapping(
                            #name,
                            format!("unexpected subtype {:?}", other),
                        )),
                    }
                }

                fn subtype(&self) -> Option<&'static str> {
                    match self {
                        #(#subtype_arms)*
                    }
                }

                #version_method
            }
        };
    })
}

// ============================================================================
// Metadata tokens
// ============================================================================

fn id_field(fields: &[FieldDef]) -> &FieldDef {
    // parse_entity guarantees exactly one id per struct or variant
    fields
        .iter()
        .find(|f| matches!(f.kind, FieldKind::Id { .. }))
        .unwrap_or(&fields[0])
}

/// Persisted scalar fields other than the key.
fn column_fields(fields: &[FieldDef]) -> Vec<&FieldDef> {
    fields
        .iter()
        .filter(|f| matches!(f.kind, FieldKind::Column))
        .collect()
}

fn sql_type_tokens(field: &FieldDef) -> TokenStream2 {
    field
        .sql_type
        .as_deref()
        .and_then(infer::parse_sql_type_attr)
        .unwrap_or_else(|| infer::infer_sql_type(&field.ty))
}

fn generate_id_info(id: &FieldDef) -> TokenStream2 {
    let field_name = id.ident.to_string();
    let column = &id.column;
    let sql_type = sql_type_tokens(id);
    match id.kind {
        FieldKind::Id { generated: true } => {
            quote! { ::entkit_core::IdInfo::generated(#field_name, #column, #sql_type) }
        }
        _ => quote! { ::entkit_core::IdInfo::assigned(#field_name, #column, #sql_type) },
    }
}

fn generate_field_info(field: &FieldDef) -> TokenStream2 {
    let field_name = field.ident.to_string();
    let column = &field.column;
    let sql_type = sql_type_tokens(field);
    let mut tokens = quote! { ::entkit_core::FieldInfo::new(#field_name, #column, #sql_type) };
    if field.nullable {
        tokens = quote! { #tokens.nullable(true) };
    }
    if field.skip_insert {
        tokens = quote! { #tokens.insertable(false) };
    }
    if field.skip_update {
        tokens = quote! { #tokens.updatable(false) };
    }
    if field.version {
        tokens = quote! { #tokens.version(true) };
    }
    tokens
}

fn generate_value_collection_info(field: &FieldDef, elements: &ElementsDef) -> TokenStream2 {
    let field_name = field.ident.to_string();
    let table = &elements.table;
    let owner_column = &elements.owner_column;
    // Vec<T> is checked during parsing
    let element = infer::generic_argument(&field.ty, "Vec").unwrap_or(&field.ty);
    let fields = match &elements.column {
        Some(column) => {
            let sql_type = infer::infer_sql_type(element);
            quote! { &[::entkit_core::FieldInfo::new(#column, #column, #sql_type)] }
        }
        None => quote! { <#element as ::entkit_core::Embeddable>::FIELDS },
    };
    quote! {
        ::entkit_core::ValueCollectionInfo {
            name: #field_name,
            table: #table,
            owner_column: #owner_column,
            fields: #fields,
        }
    }
}

fn generate_relationship_info(field: &FieldDef, relation: &RelationDef) -> TokenStream2 {
    let field_name = field.ident.to_string();
    let target = &relation.target;
    let mut tokens = match (relation.kind, &relation.join_column, &relation.mapped_by) {
        (RelationKind::ManyToOne, Some(join_column), _) => quote! {
            ::entkit_core::RelationshipInfo::many_to_one(#field_name, #target, #join_column)
        },
        (RelationKind::OneToOne, Some(join_column), _) => quote! {
            ::entkit_core::RelationshipInfo::one_to_one(#field_name, #target, #join_column)
        },
        (RelationKind::OneToMany, _, Some(mapped_by)) => quote! {
            ::entkit_core::RelationshipInfo::one_to_many(#field_name, #target, #mapped_by)
        },
        (kind, _, _) => {
            let kind = match kind {
                RelationKind::ManyToOne => quote! { ManyToOne },
                RelationKind::OneToOne => quote! { OneToOne },
                RelationKind::OneToMany => quote! { OneToMany },
                RelationKind::ManyToMany => quote! { ManyToMany },
            };
            quote! {
                ::entkit_core::RelationshipInfo::new(
                    #field_name,
                    #target,
                    ::entkit_core::RelationshipKind::#kind,
                )
            }
        }
    };
    if relation.kind == RelationKind::OneToOne || relation.kind == RelationKind::ManyToMany {
        if let Some(mapped_by) = &relation.mapped_by {
            tokens = quote! { #tokens.mapped_by(#mapped_by) };
        }
    }
    if let Some(join_table) = &relation.join_table {
        let (table, owner, target_column) = (
            &join_table.table,
            &join_table.owner_column,
            &join_table.target_column,
        );
        tokens = quote! { #tokens.join_table(#table, #owner, #target_column) };
    }
    if let Some(cascade) = cascade_tokens(&relation.cascade) {
        tokens = quote! { #tokens.cascade(#cascade) };
    }
    if relation.eager {
        tokens = quote! { #tokens.fetch(::entkit_core::FetchType::Eager) };
    }
    if relation.required {
        tokens = quote! { #tokens.optional(false) };
    }
    if relation.read_only {
        tokens = quote! { #tokens.read_only() };
    }
    tokens
}

fn cascade_tokens(ops: &[String]) -> Option<TokenStream2> {
    let mut parts = ops.iter().map(|op| {
        let constant = format_ident!("{}", op.to_uppercase());
        quote! { ::entkit_core::Cascade::#constant }
    });
    let first = parts.next()?;
    Some(parts.fold(first, |acc, part| quote! { #acc.union(#part) }))
}

// ============================================================================
// Embeddable
// ============================================================================

fn generate_embeddable_impl(ident: &Ident, fields: &[FieldDef]) -> TokenStream2 {
    let type_name = ident.to_string();
    let field_infos = fields.iter().map(|f| {
        let field_name = f.ident.to_string();
        let column = &f.column;
        let sql_type = sql_type_tokens(f);
        quote! { ::entkit_core::FieldInfo::new(#field_name, #column, #sql_type).nullable(true) }
    });
    let to_values = fields.iter().map(|f| {
        let field = &f.ident;
        quote! { ::core::convert::Into::into(::core::clone::Clone::clone(&self.#field)) }
    });
    let bindings: Vec<Ident> = fields
        .iter()
        .map(|f| format_ident!("{}_value", f.ident))
        .collect();
    let assignments = fields.iter().zip(&bindings).map(|(f, binding)| {
        let field = &f.ident;
        quote! { #field: ::entkit_core::FromValue::from_value(#binding)? }
    });
    let count = fields.len();

    quote! {
        impl ::entkit_core::Embeddable for #ident {
            const FIELDS: &'static [::entkit_core::FieldInfo] = &[#(#field_infos),*];

            fn to_values(&self) -> Vec<::entkit_core::Value> {
                vec![#(#to_values),*]
            }

            fn from_values(values: &[::entkit_core::Value]) -> ::entkit_core::Result<Self> {
                match values {
                    [#(#bindings),*] => Ok(#ident {
                        #(#assignments),*
                    }),
                    _ => Err(::entkit_core::Error::mapping(
                        #type_name,
                        format!("expected {} values, found {}", #count, values.len()),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::{DeriveInput, parse_quote};

    fn expand(input: DeriveInput) -> String {
        let entity = parse_entity(&input).unwrap();
        generate_entity_impl(&entity).unwrap().to_string()
    }

    #[test]
    fn test_struct_descriptor_tokens() {
        let tokens = expand(parse_quote! {
            #[entity(table = "team")]
            struct Team {
                #[entity(id, generated, column = "team_id")]
                id: Option<i64>,
                name: String,
                #[entity(version)]
                version: i64,
                #[entity(one_to_many(mapped_by = "team", cascade = "all"))]
                members: Collection<Member>,
            }
        });
        assert!(tokens.contains("IdInfo :: generated (\"id\" , \"team_id\""));
        assert!(tokens.contains("FieldInfo :: new (\"version\" , \"version\" , :: entkit_core :: SqlType :: BigInt) . version (true)"));
        assert!(tokens.contains("one_to_many (\"members\" , \"Member\" , \"team\") . cascade (:: entkit_core :: Cascade :: ALL)"));
        assert!(tokens.contains("fn set_version"));
        assert!(tokens.contains("scope . collection_from (row , \"members\")"));
        assert!(!tokens.contains("fn load_value_collection"));
    }

    #[test]
    fn test_owning_relations_and_collections() {
        let tokens = expand(parse_quote! {
            struct Member {
                #[entity(id, generated)]
                id: Option<i64>,
                #[entity(embedded)]
                address: Option<Address>,
                #[entity(many_to_one(cascade = "persist, remove", fetch = "eager", required))]
                team: Ref<Team>,
                #[entity(many_to_many(join_table = "member_tag", owner_column = "member_id", target_column = "tag_id"))]
                tags: Collection<Tag>,
                #[entity(collection(table = "member_nickname", owner_column = "member_id", column = "nickname"))]
                nicknames: Vec<String>,
            }
        });
        assert!(tokens.contains("many_to_one (\"team\" , \"Team\" , \"team_id\")"));
        assert!(tokens.contains("Cascade :: PERSIST . union (:: entkit_core :: Cascade :: REMOVE)"));
        assert!(tokens.contains("fetch (:: entkit_core :: FetchType :: Eager) . optional (false)"));
        assert!(tokens.contains("join_table (\"member_tag\" , \"member_id\" , \"tag_id\")"));
        assert!(tokens.contains("< Address as :: entkit_core :: Embeddable > :: FIELDS"));
        assert!(tokens.contains("FieldInfo :: new (\"nickname\" , \"nickname\" , :: entkit_core :: SqlType :: Text)"));
        assert!(tokens.contains("fn load_value_collection"));
    }

    #[test]
    fn test_hierarchy_tokens() {
        let tokens = expand(parse_quote! {
            #[entity(inheritance = "joined", discriminator = "kind")]
            enum Payment {
                #[entity(discriminator = "card", table = "card_payment")]
                Card {
                    #[entity(id, generated, column = "payment_id")]
                    id: Option<i64>,
                    amount: i64,
                    #[entity(column = "card_number")]
                    number: String,
                },
                #[entity(discriminator = "transfer", table = "transfer_payment")]
                Transfer {
                    #[entity(id, generated, column = "payment_id")]
                    id: Option<i64>,
                    amount: i64,
                    iban: String,
                },
            }
        });
        assert!(tokens.contains("joined_with_discriminator (\"kind\")"));
        assert!(tokens.contains("fields : & [:: entkit_core :: FieldInfo :: new (\"amount\" , \"amount\""));
        assert!(tokens.contains("table : \"card_payment\""));
        assert!(tokens.contains("Some (\"Transfer\") => Ok (Payment :: Transfer"));
    }

    #[test]
    fn test_hierarchy_rejects_mismatched_keys() {
        let input: DeriveInput = parse_quote! {
            enum Vehicle {
                Car {
                    #[entity(id, column = "vehicle_id")]
                    id: i64,
                },
                Truck {
                    #[entity(id, column = "truck_id")]
                    id: i64,
                },
            }
        };
        let entity = parse_entity(&input).unwrap();
        assert!(generate_entity_impl(&entity).is_err());
    }

    #[test]
    fn test_embeddable_tokens() {
        let input: DeriveInput = parse_quote! {
            struct Address {
                city: String,
                #[entity(column = "street_line")]
                street: String,
            }
        };
        let fields = parse_embeddable(&input).unwrap();
        let tokens = generate_embeddable_impl(&input.ident, &fields).to_string();
        assert!(tokens.contains("FieldInfo :: new (\"street\" , \"street_line\""));
        assert!(tokens.contains("[city_value , street_value]"));
    }
}
