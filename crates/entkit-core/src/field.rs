//! Field, key, embedded and value-collection metadata.

use crate::types::SqlType;

/// How an entity's primary key is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGeneration {
    /// The application sets the key before persisting.
    Assigned,
    /// The executor hands out a key right before the insert.
    #[default]
    Generated,
}

/// Primary key metadata.
#[derive(Debug, Clone, Copy)]
pub struct IdInfo {
    /// Rust field name (also the query path)
    pub field: &'static str,
    /// Database column name
    pub column: &'static str,
    pub sql_type: SqlType,
    pub generation: KeyGeneration,
}

impl IdInfo {
    /// A generated key.
    pub const fn generated(field: &'static str, column: &'static str, sql_type: SqlType) -> Self {
        Self {
            field,
            column,
            sql_type,
            generation: KeyGeneration::Generated,
        }
    }

    /// An application-assigned key.
    pub const fn assigned(field: &'static str, column: &'static str, sql_type: SqlType) -> Self {
        Self {
            field,
            column,
            sql_type,
            generation: KeyGeneration::Assigned,
        }
    }

    pub const fn is_generated(&self) -> bool {
        matches!(self.generation, KeyGeneration::Generated)
    }
}

/// Metadata about a persistent field/column.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Rust field name (also the query path)
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// Written by inserts
    pub insertable: bool,
    /// Written by updates
    pub updatable: bool,
    /// Optimistic-lock version counter
    pub version: bool,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column,
            sql_type,
            nullable: false,
            insertable: true,
            updatable: true,
            version: false,
        }
    }

    /// Set whether this field is nullable.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set whether inserts write this column.
    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    /// Set whether updates write this column.
    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Mark this field as the optimistic-lock version.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }
}

/// An embedded value inlined into the owner's columns.
///
/// `fields` name the embedded type's fields in the order its codec produces
/// values, with the column names used for this particular embedding (two
/// embeddings of the same type use different columns).
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedInfo {
    pub name: &'static str,
    pub fields: &'static [FieldInfo],
}

/// A collection of value types stored in an auxiliary table keyed by owner id.
#[derive(Debug, Clone, Copy)]
pub struct ValueCollectionInfo {
    pub name: &'static str,
    pub table: &'static str,
    /// Column holding the owner's key
    pub owner_column: &'static str,
    /// Element columns, in codec order
    pub fields: &'static [FieldInfo],
}

impl ValueCollectionInfo {
    /// Element column names in codec order.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_builder_chain() {
        let field = FieldInfo::new("version", "version", SqlType::BigInt)
            .nullable(true)
            .updatable(false)
            .version(true);
        assert!(field.nullable);
        assert!(field.insertable);
        assert!(!field.updatable);
        assert!(field.version);
    }

    #[test]
    fn test_id_generation_default() {
        assert_eq!(KeyGeneration::default(), KeyGeneration::Generated);
        assert!(IdInfo::generated("id", "id", SqlType::BigInt).is_generated());
        assert!(!IdInfo::assigned("code", "code", SqlType::Text).is_generated());
    }
}
