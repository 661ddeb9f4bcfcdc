//! SQL type inference and type-shape helpers.

use proc_macro2::TokenStream;
use quote::{ToTokens, quote};
use syn::{GenericArgument, PathArguments, Type};

/// Infer the column type of a Rust field type, looking through `Option`.
///
/// Unknown types fall back to TEXT; use `sql_type = "..."` to override.
pub fn infer_sql_type(ty: &Type) -> TokenStream {
    let inner = unwrap_option_type(ty);
    match type_to_string(inner).as_str() {
        "bool" => quote! { ::entkit_core::SqlType::Boolean },
        "i8" | "i16" | "i32" | "u8" | "u16" => quote! { ::entkit_core::SqlType::Integer },
        "i64" | "u32" | "u64" | "isize" | "usize" => quote! { ::entkit_core::SqlType::BigInt },
        "f32" | "f64" => quote! { ::entkit_core::SqlType::Double },
        "Vec<u8>" => quote! { ::entkit_core::SqlType::Blob },
        "[u8;16]" => quote! { ::entkit_core::SqlType::Uuid },
        "serde_json::Value" => quote! { ::entkit_core::SqlType::Json },
        _ => quote! { ::entkit_core::SqlType::Text },
    }
}

/// Parse an explicit `sql_type = "..."` name.
pub fn parse_sql_type_attr(name: &str) -> Option<TokenStream> {
    let ty = match name.trim().to_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => quote! { ::entkit_core::SqlType::Boolean },
        "INTEGER" | "INT" => quote! { ::entkit_core::SqlType::Integer },
        "BIGINT" => quote! { ::entkit_core::SqlType::BigInt },
        "DOUBLE" | "FLOAT" | "REAL" => quote! { ::entkit_core::SqlType::Double },
        "TEXT" | "VARCHAR" => quote! { ::entkit_core::SqlType::Text },
        "BLOB" | "BYTEA" => quote! { ::entkit_core::SqlType::Blob },
        "DATE" => quote! { ::entkit_core::SqlType::Date },
        "TIMESTAMP" => quote! { ::entkit_core::SqlType::Timestamp },
        "UUID" => quote! { ::entkit_core::SqlType::Uuid },
        "JSON" => quote! { ::entkit_core::SqlType::Json },
        _ => return None,
    };
    Some(ty)
}

pub fn is_option_type(ty: &Type) -> bool {
    generic_argument(ty, "Option").is_some()
}

/// Unwrap `Option<T>` to `T`, or return the type unchanged.
pub fn unwrap_option_type(ty: &Type) -> &Type {
    generic_argument(ty, "Option").unwrap_or(ty)
}

/// The type argument of `wrapper<T>` when `ty` is that wrapper.
pub fn generic_argument<'t>(ty: &'t Type, wrapper: &str) -> Option<&'t Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}

/// Last path segment of a type (`crate::model::Team` is `Team`).
pub fn type_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(type_path) => type_path.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    }
}

fn type_to_string(ty: &Type) -> String {
    ty.to_token_stream().to_string().replace(' ', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_infer_primitives() {
        let ty: Type = parse_quote!(i32);
        assert!(infer_sql_type(&ty).to_string().contains("Integer"));
        let ty: Type = parse_quote!(i64);
        assert!(infer_sql_type(&ty).to_string().contains("BigInt"));
        let ty: Type = parse_quote!(Option<f64>);
        assert!(infer_sql_type(&ty).to_string().contains("Double"));
        let ty: Type = parse_quote!(String);
        assert!(infer_sql_type(&ty).to_string().contains("Text"));
    }

    #[test]
    fn test_explicit_sql_type() {
        assert!(parse_sql_type_attr("bigint").is_some());
        assert!(parse_sql_type_attr("timestamp").unwrap().to_string().contains("Timestamp"));
        assert!(parse_sql_type_attr("VARCHAR(20)").is_none());
    }

    #[test]
    fn test_wrapper_arguments() {
        let ty: Type = parse_quote!(entkit::Ref<Team>);
        let inner = generic_argument(&ty, "Ref").unwrap();
        assert_eq!(type_name(inner).as_deref(), Some("Team"));
        let ty: Type = parse_quote!(Collection<Member>);
        assert!(generic_argument(&ty, "Ref").is_none());
        assert!(is_option_type(&parse_quote!(Option<String>)));
        assert!(!is_option_type(&parse_quote!(String)));
    }
}
