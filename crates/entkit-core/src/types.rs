//! Logical column types.

/// Column types understood by the metadata layer.
///
/// These are logical types used for query validation; the physical DDL type
/// is the driver's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
}

/// Families of mutually comparable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Boolean,
    Numeric,
    Text,
    Binary,
    Temporal,
    Uuid,
    Json,
}

impl SqlType {
    /// Get the type name for messages.
    pub const fn name(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
        }
    }

    /// The comparison family this type belongs to.
    pub const fn family(&self) -> TypeFamily {
        match self {
            SqlType::Boolean => TypeFamily::Boolean,
            SqlType::Integer | SqlType::BigInt | SqlType::Double => TypeFamily::Numeric,
            SqlType::Text => TypeFamily::Text,
            SqlType::Blob => TypeFamily::Binary,
            SqlType::Date | SqlType::Timestamp => TypeFamily::Temporal,
            SqlType::Uuid => TypeFamily::Uuid,
            SqlType::Json => TypeFamily::Json,
        }
    }

    /// Whether values of the two types can be compared or joined.
    pub fn is_compatible_with(&self, other: &SqlType) -> bool {
        self.family() == other.family()
    }

    /// Whether the type supports SUM/AVG.
    pub const fn is_numeric(&self) -> bool {
        matches!(self.family(), TypeFamily::Numeric)
    }
}
