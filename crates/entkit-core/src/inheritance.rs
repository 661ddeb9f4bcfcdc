//! Inheritance metadata.
//!
//! A hierarchy is one Rust entity type whose concrete subtype is a closed
//! enum variant. The strategy is chosen once, on the root descriptor.

use crate::field::FieldInfo;

/// Default discriminator column name.
pub const DEFAULT_DISCRIMINATOR: &str = "DTYPE";

/// Physical layout of a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritanceStrategy {
    /// One table with every subtype's columns plus a discriminator.
    SingleTable { discriminator: &'static str },
    /// Base table plus one table per subtype sharing the key.
    Joined { discriminator: Option<&'static str> },
}

impl InheritanceStrategy {
    /// Single table with the default `DTYPE` discriminator.
    pub const fn single_table() -> Self {
        InheritanceStrategy::SingleTable {
            discriminator: DEFAULT_DISCRIMINATOR,
        }
    }

    /// Joined tables without a discriminator column.
    pub const fn joined() -> Self {
        InheritanceStrategy::Joined {
            discriminator: None,
        }
    }

    /// Joined tables with a discriminator column on the base table.
    pub const fn joined_with_discriminator(column: &'static str) -> Self {
        InheritanceStrategy::Joined {
            discriminator: Some(column),
        }
    }

    /// The discriminator column, if the strategy writes one.
    pub const fn discriminator(&self) -> Option<&'static str> {
        match self {
            InheritanceStrategy::SingleTable { discriminator } => Some(*discriminator),
            InheritanceStrategy::Joined { discriminator } => *discriminator,
        }
    }
}

/// One concrete subtype of a hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct SubtypeInfo {
    /// Subtype name, as returned by `Entity::subtype`
    pub name: &'static str,
    /// Value stored in the discriminator column
    pub discriminator_value: &'static str,
    /// Subtype table (joined strategy only)
    pub table: &'static str,
    /// Fields declared by this subtype
    pub fields: &'static [FieldInfo],
}

/// Hierarchy metadata on the root descriptor.
#[derive(Debug, Clone, Copy)]
pub struct InheritanceInfo {
    pub strategy: InheritanceStrategy,
    pub subtypes: &'static [SubtypeInfo],
}

impl InheritanceInfo {
    /// Look up a subtype by name.
    pub fn subtype(&self, name: &str) -> Option<&'static SubtypeInfo> {
        self.subtypes.iter().find(|s| s.name == name)
    }

    /// Look up a subtype by discriminator value.
    pub fn subtype_by_discriminator(&self, value: &str) -> Option<&'static SubtypeInfo> {
        self.subtypes.iter().find(|s| s.discriminator_value == value)
    }

    /// Whether the strategy is joined.
    pub const fn is_joined(&self) -> bool {
        matches!(self.strategy, InheritanceStrategy::Joined { .. })
    }
}
