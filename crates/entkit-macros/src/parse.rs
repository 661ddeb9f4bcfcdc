//! Parsing of `#[entity(...)]` attributes.
//!
//! The derive input is turned into an [`EntityDef`]: a plain entity with its
//! fields, or an inheritance hierarchy whose enum variants are the concrete
//! subtypes. Defaults are resolved here so code generation never has to
//! guess.

use crate::infer::{generic_argument, is_option_type, type_name};
use syn::meta::ParseNestedMeta;
use syn::{Attribute, Data, DeriveInput, Error, Field, Fields, Ident, LitBool, LitStr, Result, Type};

/// A parsed `#[derive(Entity)]` input.
#[derive(Debug)]
pub struct EntityDef {
    pub ident: Ident,
    /// Entity name used by the metamodel and relationship targets
    pub name: String,
    pub table: String,
    pub shape: Shape,
}

#[derive(Debug)]
pub enum Shape {
    Struct(Vec<FieldDef>),
    Hierarchy(Hierarchy),
}

/// An enum entity: every variant is a concrete subtype.
#[derive(Debug)]
pub struct Hierarchy {
    pub joined: bool,
    pub discriminator: Option<String>,
    pub variants: Vec<VariantDef>,
}

#[derive(Debug)]
pub struct VariantDef {
    pub ident: Ident,
    pub discriminator_value: String,
    /// Subtype table; the root table for single-table hierarchies
    pub table: String,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug)]
pub struct FieldDef {
    pub ident: Ident,
    pub ty: Type,
    pub column: String,
    pub sql_type: Option<String>,
    pub nullable: bool,
    pub version: bool,
    pub skip_insert: bool,
    pub skip_update: bool,
    pub kind: FieldKind,
}

#[derive(Debug)]
pub enum FieldKind {
    Id { generated: bool },
    Column,
    Embedded,
    /// Collection of value types in an auxiliary table
    Elements(ElementsDef),
    Relation(RelationDef),
    /// Not persisted; rebuilt with `Default`
    Skip,
}

#[derive(Debug, Default)]
pub struct ElementsDef {
    pub table: String,
    pub owner_column: String,
    /// Element column for scalar elements; struct elements use their own
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug)]
pub struct RelationDef {
    pub kind: RelationKind,
    pub target: String,
    pub join_column: Option<String>,
    pub join_table: Option<JoinTableDef>,
    pub mapped_by: Option<String>,
    /// Lowercase cascade operations (`persist`, `remove`, `refresh`, `all`)
    pub cascade: Vec<String>,
    pub eager: bool,
    pub required: bool,
    pub read_only: bool,
    /// The field is a `Collection<T>` rather than a `Ref<T>`
    pub many: bool,
}

#[derive(Debug)]
pub struct JoinTableDef {
    pub table: String,
    pub owner_column: String,
    pub target_column: String,
}

// ============================================================================
// Entry points
// ============================================================================

pub fn parse_entity(input: &DeriveInput) -> Result<EntityDef> {
    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Entity cannot be derived for generic types",
        ));
    }
    let attrs = parse_container_attrs(&input.attrs)?;
    let ident = input.ident.clone();
    let name = attrs.name.clone().unwrap_or_else(|| ident.to_string());
    let table = attrs
        .table
        .clone()
        .unwrap_or_else(|| to_snake_case(&ident.to_string()));

    let shape = match &input.data {
        Data::Struct(data) => {
            if attrs.inheritance.is_some() || attrs.discriminator.is_some() {
                return Err(Error::new_spanned(
                    &input.ident,
                    "`inheritance` and `discriminator` apply to enum hierarchies",
                ));
            }
            let fields = parse_fields(&data.fields, &input.ident)?;
            check_single_id(&fields, &input.ident)?;
            Shape::Struct(fields)
        }
        Data::Enum(data) => {
            let joined = match attrs.inheritance.as_deref() {
                None | Some("single_table") => false,
                Some("joined") => true,
                Some(other) => {
                    return Err(Error::new_spanned(
                        &input.ident,
                        format!("unknown inheritance strategy `{other}`; use single_table or joined"),
                    ));
                }
            };
            let mut variants = Vec::with_capacity(data.variants.len());
            for variant in &data.variants {
                let variant_attrs = parse_variant_attrs(&variant.attrs)?;
                let fields = parse_fields(&variant.fields, &variant.ident)?;
                check_single_id(&fields, &variant.ident)?;
                if let Some(field) = fields
                    .iter()
                    .find(|f| !matches!(f.kind, FieldKind::Id { .. } | FieldKind::Column | FieldKind::Skip))
                {
                    return Err(Error::new_spanned(
                        &field.ident,
                        "hierarchy variants support only id, column and skipped fields",
                    ));
                }
                let subtable = match (joined, variant_attrs.table) {
                    (true, Some(table)) => table,
                    (true, None) => to_snake_case(&variant.ident.to_string()),
                    (false, Some(_)) => {
                        return Err(Error::new_spanned(
                            &variant.ident,
                            "single-table subtypes share the root table",
                        ));
                    }
                    (false, None) => table.clone(),
                };
                variants.push(VariantDef {
                    ident: variant.ident.clone(),
                    discriminator_value: variant_attrs
                        .discriminator
                        .unwrap_or_else(|| variant.ident.to_string()),
                    table: subtable,
                    fields,
                });
            }
            if variants.is_empty() {
                return Err(Error::new_spanned(
                    &input.ident,
                    "an entity hierarchy needs at least one variant",
                ));
            }
            Shape::Hierarchy(Hierarchy {
                joined,
                discriminator: attrs.discriminator,
                variants,
            })
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Entity can only be derived for structs and enums",
            ));
        }
    };

    Ok(EntityDef {
        ident,
        name,
        table,
        shape,
    })
}

/// Fields of a `#[derive(Embeddable)]` struct, in codec order.
pub fn parse_embeddable(input: &DeriveInput) -> Result<Vec<FieldDef>> {
    let Data::Struct(data) = &input.data else {
        return Err(Error::new_spanned(
            input,
            "Embeddable can only be derived for structs",
        ));
    };
    let fields = parse_fields(&data.fields, &input.ident)?;
    if let Some(field) = fields.iter().find(|f| !matches!(f.kind, FieldKind::Column)) {
        return Err(Error::new_spanned(
            &field.ident,
            "embeddable values hold only plain column fields",
        ));
    }
    Ok(fields)
}

fn check_single_id(fields: &[FieldDef], owner: &Ident) -> Result<()> {
    let ids: Vec<&FieldDef> = fields
        .iter()
        .filter(|f| matches!(f.kind, FieldKind::Id { .. }))
        .collect();
    match ids.as_slice() {
        [_] => Ok(()),
        [] => Err(Error::new_spanned(
            owner,
            "an entity needs one field marked #[entity(id)]",
        )),
        [_, second, ..] => Err(Error::new_spanned(
            &second.ident,
            "composite keys are not supported; mark a single id field",
        )),
    }
}

// ============================================================================
// Container and variant attributes
// ============================================================================

#[derive(Default)]
struct ContainerAttrs {
    name: Option<String>,
    table: Option<String>,
    inheritance: Option<String>,
    discriminator: Option<String>,
}

fn parse_container_attrs(attrs: &[Attribute]) -> Result<ContainerAttrs> {
    let mut result = ContainerAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                result.name = Some(string_value(&meta)?);
            } else if meta.path.is_ident("table") {
                result.table = Some(string_value(&meta)?);
            } else if meta.path.is_ident("inheritance") {
                result.inheritance = Some(string_value(&meta)?);
            } else if meta.path.is_ident("discriminator") {
                result.discriminator = Some(string_value(&meta)?);
            } else {
                return Err(meta.error(
                    "unknown entity attribute; expected name, table, inheritance or discriminator",
                ));
            }
            Ok(())
        })?;
    }
    Ok(result)
}

#[derive(Default)]
struct VariantAttrs {
    discriminator: Option<String>,
    table: Option<String>,
}

fn parse_variant_attrs(attrs: &[Attribute]) -> Result<VariantAttrs> {
    let mut result = VariantAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("discriminator") {
                result.discriminator = Some(string_value(&meta)?);
            } else if meta.path.is_ident("table") {
                result.table = Some(string_value(&meta)?);
            } else {
                return Err(meta.error("unknown variant attribute; expected discriminator or table"));
            }
            Ok(())
        })?;
    }
    Ok(result)
}

// ============================================================================
// Field attributes
// ============================================================================

#[derive(Default)]
struct FieldAttrs {
    id: bool,
    generated: bool,
    column: Option<String>,
    sql_type: Option<String>,
    nullable: Option<bool>,
    version: bool,
    skip: bool,
    skip_insert: bool,
    skip_update: bool,
    embedded: bool,
    elements: Option<ElementsDef>,
    relation: Option<(RelationKind, RelationAttrs)>,
}

#[derive(Default)]
struct RelationAttrs {
    target: Option<String>,
    join_column: Option<String>,
    join_table: Option<String>,
    owner_column: Option<String>,
    target_column: Option<String>,
    mapped_by: Option<String>,
    cascade: Vec<String>,
    eager: bool,
    required: bool,
    read_only: bool,
}

fn parse_fields(fields: &Fields, owner: &Ident) -> Result<Vec<FieldDef>> {
    match fields {
        Fields::Named(named) => named.named.iter().map(parse_field).collect(),
        _ => Err(Error::new_spanned(
            owner,
            "entity types need named fields",
        )),
    }
}

fn parse_field(field: &Field) -> Result<FieldDef> {
    let ident = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected a named field"))?;
    let ty = field.ty.clone();
    let attrs = parse_field_attrs(&field.attrs)?;
    let column = attrs.column.clone().unwrap_or_else(|| ident.to_string());
    let nullable = attrs.nullable.unwrap_or_else(|| is_option_type(&ty));

    let flags = [
        (attrs.id, "id"),
        (attrs.skip, "skip"),
        (attrs.embedded, "embedded"),
        (attrs.elements.is_some(), "collection"),
        (attrs.relation.is_some(), "a relationship"),
    ];
    let chosen: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
    if chosen.len() > 1 {
        return Err(Error::new_spanned(
            &ident,
            format!("a field cannot be both {} and {}", chosen[0], chosen[1]),
        ));
    }
    if attrs.generated && !attrs.id {
        return Err(Error::new_spanned(&ident, "`generated` applies to the id field"));
    }

    let reference = generic_argument(&ty, "Ref");
    let collection = generic_argument(&ty, "Collection");
    let kind = if attrs.skip {
        FieldKind::Skip
    } else if attrs.id {
        FieldKind::Id {
            generated: attrs.generated,
        }
    } else if attrs.embedded {
        FieldKind::Embedded
    } else if let Some(elements) = attrs.elements {
        if generic_argument(&ty, "Vec").is_none() {
            return Err(Error::new_spanned(&ty, "a value collection must be a Vec<T>"));
        }
        FieldKind::Elements(elements)
    } else if let Some(target) = reference.or(collection) {
        FieldKind::Relation(relation_def(
            &ident,
            target,
            collection.is_some(),
            attrs.relation,
        )?)
    } else if attrs.relation.is_some() {
        return Err(Error::new_spanned(
            &ty,
            "relationship attributes apply to Ref<T> and Collection<T> fields",
        ));
    } else {
        FieldKind::Column
    };

    Ok(FieldDef {
        ident,
        ty,
        column,
        sql_type: attrs.sql_type,
        nullable,
        version: attrs.version,
        skip_insert: attrs.skip_insert,
        skip_update: attrs.skip_update,
        kind,
    })
}

fn parse_field_attrs(attrs: &[Attribute]) -> Result<FieldAttrs> {
    let mut result = FieldAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            let path = &meta.path;
            if path.is_ident("id") {
                result.id = true;
            } else if path.is_ident("generated") {
                result.generated = true;
            } else if path.is_ident("column") {
                result.column = Some(string_value(&meta)?);
            } else if path.is_ident("sql_type") {
                let lit: LitStr = meta.value()?.parse()?;
                if crate::infer::parse_sql_type_attr(&lit.value()).is_none() {
                    return Err(Error::new_spanned(&lit, "unknown sql_type"));
                }
                result.sql_type = Some(lit.value());
            } else if path.is_ident("nullable") {
                result.nullable = Some(flag_value(&meta)?);
            } else if path.is_ident("version") {
                result.version = true;
            } else if path.is_ident("skip") {
                result.skip = true;
            } else if path.is_ident("skip_insert") {
                result.skip_insert = true;
            } else if path.is_ident("skip_update") {
                result.skip_update = true;
            } else if path.is_ident("embedded") {
                result.embedded = true;
            } else if path.is_ident("collection") {
                result.elements = Some(parse_elements(&meta)?);
            } else if let Some(kind) = relation_kind(path) {
                if result.relation.is_some() {
                    return Err(meta.error("a field declares one relationship"));
                }
                result.relation = Some((kind, parse_relation(&meta)?));
            } else {
                return Err(meta.error(
                    "unknown entity attribute; expected id, generated, column, sql_type, \
                     nullable, version, skip, skip_insert, skip_update, embedded, collection, \
                     many_to_one, one_to_one, one_to_many or many_to_many",
                ));
            }
            Ok(())
        })?;
    }
    Ok(result)
}

fn relation_kind(path: &syn::Path) -> Option<RelationKind> {
    if path.is_ident("many_to_one") {
        Some(RelationKind::ManyToOne)
    } else if path.is_ident("one_to_one") {
        Some(RelationKind::OneToOne)
    } else if path.is_ident("one_to_many") {
        Some(RelationKind::OneToMany)
    } else if path.is_ident("many_to_many") {
        Some(RelationKind::ManyToMany)
    } else {
        None
    }
}

fn parse_elements(meta: &ParseNestedMeta<'_>) -> Result<ElementsDef> {
    let mut table = None;
    let mut owner_column = None;
    let mut column = None;
    meta.parse_nested_meta(|inner| {
        if inner.path.is_ident("table") {
            table = Some(string_value(&inner)?);
        } else if inner.path.is_ident("owner_column") {
            owner_column = Some(string_value(&inner)?);
        } else if inner.path.is_ident("column") {
            column = Some(string_value(&inner)?);
        } else {
            return Err(inner.error("expected table, owner_column or column"));
        }
        Ok(())
    })?;
    match (table, owner_column) {
        (Some(table), Some(owner_column)) => Ok(ElementsDef {
            table,
            owner_column,
            column,
        }),
        _ => Err(meta.error("collection(...) needs table and owner_column")),
    }
}

fn parse_relation(meta: &ParseNestedMeta<'_>) -> Result<RelationAttrs> {
    let mut result = RelationAttrs::default();
    if !meta.input.peek(syn::token::Paren) {
        return Ok(result);
    }
    meta.parse_nested_meta(|inner| {
        let path = &inner.path;
        if path.is_ident("target") {
            result.target = Some(string_value(&inner)?);
        } else if path.is_ident("join_column") {
            result.join_column = Some(string_value(&inner)?);
        } else if path.is_ident("join_table") {
            result.join_table = Some(string_value(&inner)?);
        } else if path.is_ident("owner_column") {
            result.owner_column = Some(string_value(&inner)?);
        } else if path.is_ident("target_column") {
            result.target_column = Some(string_value(&inner)?);
        } else if path.is_ident("mapped_by") {
            result.mapped_by = Some(string_value(&inner)?);
        } else if path.is_ident("cascade") {
            let lit: LitStr = inner.value()?.parse()?;
            for op in lit.value().split(',').map(|op| op.trim().to_lowercase()) {
                if !matches!(op.as_str(), "all" | "persist" | "remove" | "refresh") {
                    return Err(Error::new_spanned(
                        &lit,
                        format!("unknown cascade `{op}`; expected all, persist, remove or refresh"),
                    ));
                }
                result.cascade.push(op);
            }
        } else if path.is_ident("fetch") {
            let lit: LitStr = inner.value()?.parse()?;
            result.eager = match lit.value().as_str() {
                "eager" => true,
                "lazy" => false,
                _ => return Err(Error::new_spanned(&lit, "fetch is eager or lazy")),
            };
        } else if path.is_ident("required") {
            result.required = true;
        } else if path.is_ident("read_only") {
            result.read_only = true;
        } else {
            return Err(inner.error(
                "unknown relationship attribute; expected target, join_column, join_table, \
                 owner_column, target_column, mapped_by, cascade, fetch, required or read_only",
            ));
        }
        Ok(())
    })?;
    Ok(result)
}

fn relation_def(
    field: &Ident,
    target_ty: &Type,
    many: bool,
    declared: Option<(RelationKind, RelationAttrs)>,
) -> Result<RelationDef> {
    let (kind, attrs) = match declared {
        Some(declared) => declared,
        None if !many => (RelationKind::ManyToOne, RelationAttrs::default()),
        None => {
            return Err(Error::new_spanned(
                field,
                "a Collection field needs one_to_many(mapped_by = ...) or many_to_many(...)",
            ));
        }
    };
    let singular = matches!(kind, RelationKind::ManyToOne | RelationKind::OneToOne);
    if singular == many {
        return Err(Error::new_spanned(
            field,
            if many {
                "to-one relationships are declared on Ref<T> fields"
            } else {
                "to-many relationships are declared on Collection<T> fields"
            },
        ));
    }
    let target = match attrs.target {
        Some(target) => target,
        None => type_name(target_ty).ok_or_else(|| {
            Error::new_spanned(target_ty, "cannot name the target entity; set target = \"...\"")
        })?,
    };
    let default_join_column = || format!("{field}_id");

    let (join_column, join_table) = match kind {
        RelationKind::ManyToOne => (
            Some(attrs.join_column.unwrap_or_else(default_join_column)),
            None,
        ),
        RelationKind::OneToOne if attrs.mapped_by.is_none() => (
            Some(attrs.join_column.unwrap_or_else(default_join_column)),
            None,
        ),
        RelationKind::OneToMany if attrs.mapped_by.is_none() => {
            return Err(Error::new_spanned(
                field,
                "one_to_many needs mapped_by = \"<owning field on the target>\"",
            ));
        }
        RelationKind::ManyToMany if attrs.mapped_by.is_none() => {
            match (attrs.join_table, attrs.owner_column, attrs.target_column) {
                (Some(table), Some(owner_column), Some(target_column)) => (
                    None,
                    Some(JoinTableDef {
                        table,
                        owner_column,
                        target_column,
                    }),
                ),
                _ => {
                    return Err(Error::new_spanned(
                        field,
                        "many_to_many needs mapped_by, or join_table with owner_column and target_column",
                    ));
                }
            }
        }
        _ => (None, None),
    };

    Ok(RelationDef {
        kind,
        target,
        join_column,
        join_table,
        mapped_by: attrs.mapped_by,
        cascade: attrs.cascade,
        eager: attrs.eager,
        required: attrs.required,
        read_only: attrs.read_only,
        many,
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn string_value(meta: &ParseNestedMeta<'_>) -> Result<String> {
    let lit: LitStr = meta.value()?.parse()?;
    Ok(lit.value())
}

/// `flag` or `flag = true|false`.
fn flag_value(meta: &ParseNestedMeta<'_>) -> Result<bool> {
    if meta.input.peek(syn::Token![=]) {
        let lit: LitBool = meta.value()?.parse()?;
        Ok(lit.value)
    } else {
        Ok(true)
    }
}

/// Convert PascalCase to snake_case (`TeamMember` -> `team_member`).
pub fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    let chars: Vec<char> = s.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                let prev = chars[i - 1];
                let next = chars.get(i + 1).copied();
                if prev.is_lowercase() || (prev.is_uppercase() && next.is_some_and(char::is_lowercase))
                {
                    result.push('_');
                }
            }
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("Team"), "team");
        assert_eq!(to_snake_case("CardPayment"), "card_payment");
        assert_eq!(to_snake_case("HTTPServer"), "http_server");
    }

    #[test]
    fn test_struct_defaults() {
        let input: DeriveInput = parse_quote! {
            struct Member {
                #[entity(id, generated, column = "member_id")]
                id: Option<i64>,
                #[entity(column = "username")]
                name: Option<String>,
                age: i32,
                team: Ref<Team>,
                #[entity(one_to_many(mapped_by = "owner", cascade = "persist, remove"))]
                lockers: Collection<Locker>,
            }
        };
        let def = parse_entity(&input).unwrap();
        assert_eq!(def.name, "Member");
        assert_eq!(def.table, "member");
        let Shape::Struct(fields) = def.shape else {
            panic!("expected a struct entity");
        };
        assert!(matches!(fields[0].kind, FieldKind::Id { generated: true }));
        assert_eq!(fields[1].column, "username");
        assert!(fields[1].nullable);
        assert!(!fields[2].nullable);
        match &fields[3].kind {
            FieldKind::Relation(relation) => {
                assert_eq!(relation.kind, RelationKind::ManyToOne);
                assert_eq!(relation.target, "Team");
                assert_eq!(relation.join_column.as_deref(), Some("team_id"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &fields[4].kind {
            FieldKind::Relation(relation) => {
                assert!(relation.many);
                assert_eq!(relation.mapped_by.as_deref(), Some("owner"));
                assert_eq!(relation.cascade, vec!["persist", "remove"]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_declarations_are_rejected() {
        let no_id: DeriveInput = parse_quote! {
            struct Tag { name: String }
        };
        assert!(parse_entity(&no_id).is_err());

        let inverse_without_owner: DeriveInput = parse_quote! {
            struct Team {
                #[entity(id)]
                id: i64,
                members: Collection<Member>,
            }
        };
        assert!(parse_entity(&inverse_without_owner).is_err());

        let to_many_on_ref: DeriveInput = parse_quote! {
            struct Member {
                #[entity(id)]
                id: i64,
                #[entity(one_to_many(mapped_by = "member"))]
                team: Ref<Team>,
            }
        };
        assert!(parse_entity(&to_many_on_ref).is_err());

        let bad_cascade: DeriveInput = parse_quote! {
            struct Member {
                #[entity(id)]
                id: i64,
                #[entity(many_to_one(cascade = "merge"))]
                team: Ref<Team>,
            }
        };
        assert!(parse_entity(&bad_cascade).is_err());
    }

    #[test]
    fn test_hierarchy_tables() {
        let input: DeriveInput = parse_quote! {
            #[entity(table = "account", inheritance = "joined", discriminator = "kind")]
            enum Account {
                #[entity(discriminator = "C")]
                Checking {
                    #[entity(id, generated, column = "account_id")]
                    id: Option<i64>,
                    owner: String,
                    overdraft: i64,
                },
                #[entity(table = "savings_account")]
                Savings {
                    #[entity(id, generated, column = "account_id")]
                    id: Option<i64>,
                    owner: String,
                    rate: f64,
                },
            }
        };
        let def = parse_entity(&input).unwrap();
        let Shape::Hierarchy(hierarchy) = def.shape else {
            panic!("expected a hierarchy");
        };
        assert!(hierarchy.joined);
        assert_eq!(hierarchy.discriminator.as_deref(), Some("kind"));
        assert_eq!(hierarchy.variants[0].table, "checking");
        assert_eq!(hierarchy.variants[0].discriminator_value, "C");
        assert_eq!(hierarchy.variants[1].table, "savings_account");
        assert_eq!(hierarchy.variants[1].discriminator_value, "Savings");
    }
}
