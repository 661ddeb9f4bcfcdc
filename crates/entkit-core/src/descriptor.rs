//! Static entity metadata.
//!
//! Every entity kind exposes one `&'static EntityDescriptor`. Descriptors are
//! plain data; cross-entity checks happen once when they are registered in a
//! [`Metamodel`](crate::Metamodel).

use crate::entity::EntityFactory;
use crate::field::{EmbeddedInfo, FieldInfo, IdInfo, ValueCollectionInfo};
use crate::inheritance::{InheritanceInfo, InheritanceStrategy, SubtypeInfo};
use crate::relationship::RelationshipInfo;
use crate::types::SqlType;

/// Metadata describing one entity kind and its physical layout.
#[derive(Debug)]
pub struct EntityDescriptor {
    /// Entity name, unique within a metamodel
    pub name: &'static str,
    /// Base table
    pub table: &'static str,
    pub id: IdInfo,
    pub fields: &'static [FieldInfo],
    pub embedded: &'static [EmbeddedInfo],
    pub relationships: &'static [RelationshipInfo],
    pub value_collections: &'static [ValueCollectionInfo],
    /// Present on the root of an inheritance hierarchy
    pub inheritance: Option<InheritanceInfo>,
    /// Builds an erased instance from a row
    pub factory: EntityFactory,
}

/// Where a resolved path lives physically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSlot {
    /// The entity's base table
    Base,
    /// A joined-inheritance subtype table
    Subtype(&'static str),
}

/// A query path resolved against a descriptor.
#[derive(Debug, Clone, Copy)]
pub enum PathTarget {
    /// A stored column
    Column {
        column: &'static str,
        sql_type: SqlType,
        nullable: bool,
        slot: TableSlot,
    },
    /// The FK column of an owning to-one relationship
    ForeignKey {
        relation: &'static RelationshipInfo,
        column: &'static str,
    },
}

impl EntityDescriptor {
    /// Look up an ordinary (base) field by name.
    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relationship by field name.
    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Look up an embedded value by field name.
    pub fn embedded_field(&self, name: &str) -> Option<&'static EmbeddedInfo> {
        self.embedded.iter().find(|e| e.name == name)
    }

    /// Look up a value collection by field name.
    pub fn value_collection(&self, name: &str) -> Option<&'static ValueCollectionInfo> {
        self.value_collections.iter().find(|c| c.name == name)
    }

    /// The optimistic-lock version field, if declared.
    pub fn version_field(&self) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.version)
    }

    /// Look up a subtype by name.
    pub fn subtype(&self, name: &str) -> Option<&'static SubtypeInfo> {
        self.inheritance.as_ref().and_then(|i| i.subtype(name))
    }

    /// The discriminator column, if the hierarchy writes one.
    pub fn discriminator(&self) -> Option<&'static str> {
        self.inheritance
            .as_ref()
            .and_then(|i| i.strategy.discriminator())
    }

    /// Whether subtype rows live in their own tables.
    pub fn is_joined(&self) -> bool {
        self.inheritance.as_ref().is_some_and(InheritanceInfo::is_joined)
    }

    /// Owning to-one relationships (the ones carrying a FK column).
    pub fn foreign_keys(&self) -> impl Iterator<Item = &'static RelationshipInfo> + '_ {
        self.relationships
            .iter()
            .filter(|r| r.kind.is_singular() && r.join_column.is_some())
    }

    /// Owning many-to-many relationships (the ones carrying a join table).
    pub fn link_tables(&self) -> impl Iterator<Item = &'static RelationshipInfo> + '_ {
        self.relationships.iter().filter(|r| r.join_table.is_some())
    }

    /// The table a subtype's own columns are written to.
    pub fn subtype_table(&self, subtype: &SubtypeInfo) -> &'static str {
        match self.inheritance.map(|i| i.strategy) {
            Some(InheritanceStrategy::Joined { .. }) => subtype.table,
            _ => self.table,
        }
    }

    /// Resolve a query path: the id, a plain field, `embedded.field`, an
    /// owning to-one relationship name, or a subtype field.
    pub fn resolve_path(&self, path: &str) -> Option<PathTarget> {
        if path == self.id.field {
            return Some(PathTarget::Column {
                column: self.id.column,
                sql_type: self.id.sql_type,
                nullable: false,
                slot: TableSlot::Base,
            });
        }
        if let Some((owner, inner)) = path.split_once('.') {
            let embedded = self.embedded_field(owner)?;
            let field = embedded.fields.iter().find(|f| f.name == inner)?;
            return Some(base_column(field));
        }
        if let Some(field) = self.field(path) {
            return Some(base_column(field));
        }
        if let Some(relation) = self.relationship(path) {
            return match (relation.kind.is_singular(), relation.join_column) {
                (true, Some(column)) => Some(PathTarget::ForeignKey { relation, column }),
                _ => None,
            };
        }
        let inheritance = self.inheritance.as_ref()?;
        for subtype in inheritance.subtypes {
            if let Some(field) = subtype.fields.iter().find(|f| f.name == path) {
                let slot = if inheritance.is_joined() {
                    TableSlot::Subtype(subtype.table)
                } else {
                    TableSlot::Base
                };
                return Some(PathTarget::Column {
                    column: field.column,
                    sql_type: field.sql_type,
                    // A subtype column is NULL on rows of other subtypes.
                    nullable: true,
                    slot,
                });
            }
        }
        None
    }

    /// Every column stored in the base table, in a stable order.
    pub fn base_columns(&self) -> Vec<&'static str> {
        let mut columns = vec![self.id.column];
        if let Some(discriminator) = self.discriminator() {
            columns.push(discriminator);
        }
        columns.extend(self.fields.iter().map(|f| f.column));
        for embedded in self.embedded {
            columns.extend(embedded.fields.iter().map(|f| f.column));
        }
        columns.extend(self.foreign_keys().filter_map(|r| r.join_column));
        if let Some(inheritance) = &self.inheritance {
            if !inheritance.is_joined() {
                for subtype in inheritance.subtypes {
                    columns.extend(subtype.fields.iter().map(|f| f.column));
                }
            }
        }
        columns
    }
}

fn base_column(field: &'static FieldInfo) -> PathTarget {
    PathTarget::Column {
        column: field.column,
        sql_type: field.sql_type,
        nullable: field.nullable,
        slot: TableSlot::Base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityObject;
    use crate::error::Error;
    use crate::reference::HydrateScope;
    use crate::row::Row;
    use std::sync::Arc;

    fn no_factory(_: &Row, _: &HydrateScope) -> crate::Result<Arc<dyn EntityObject>> {
        Err(Error::Custom("not constructible".into()))
    }

    static ITEM_SUBTYPES: &[SubtypeInfo] = &[SubtypeInfo {
        name: "Book",
        discriminator_value: "B",
        table: "book",
        fields: &[FieldInfo::new("isbn", "isbn", SqlType::Text).nullable(true)],
    }];

    static MEMBER: EntityDescriptor = EntityDescriptor {
        name: "Member",
        table: "member",
        id: IdInfo::generated("id", "member_id", SqlType::BigInt),
        fields: &[
            FieldInfo::new("name", "username", SqlType::Text).nullable(true),
            FieldInfo::new("age", "age", SqlType::Integer),
        ],
        embedded: &[EmbeddedInfo {
            name: "home",
            fields: &[
                FieldInfo::new("city", "home_city", SqlType::Text).nullable(true),
                FieldInfo::new("street", "home_street", SqlType::Text).nullable(true),
            ],
        }],
        relationships: &[
            RelationshipInfo::many_to_one("team", "Team", "team_id"),
            RelationshipInfo::one_to_many("orders", "Order", "member"),
        ],
        value_collections: &[],
        inheritance: None,
        factory: no_factory,
    };

    static ITEM: EntityDescriptor = EntityDescriptor {
        name: "Item",
        table: "item",
        id: IdInfo::generated("id", "id", SqlType::BigInt),
        fields: &[FieldInfo::new("price", "price", SqlType::Integer)],
        embedded: &[],
        relationships: &[],
        value_collections: &[],
        inheritance: Some(InheritanceInfo {
            strategy: InheritanceStrategy::single_table(),
            subtypes: ITEM_SUBTYPES,
        }),
        factory: no_factory,
    };

    #[test]
    fn test_resolve_path_variants() {
        match MEMBER.resolve_path("name") {
            Some(PathTarget::Column { column, .. }) => assert_eq!(column, "username"),
            other => panic!("unexpected: {other:?}"),
        }
        match MEMBER.resolve_path("id") {
            Some(PathTarget::Column { column, .. }) => assert_eq!(column, "member_id"),
            other => panic!("unexpected: {other:?}"),
        }
        match MEMBER.resolve_path("home.city") {
            Some(PathTarget::Column { column, .. }) => assert_eq!(column, "home_city"),
            other => panic!("unexpected: {other:?}"),
        }
        match MEMBER.resolve_path("team") {
            Some(PathTarget::ForeignKey { column, .. }) => assert_eq!(column, "team_id"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(MEMBER.resolve_path("orders").is_none());
        assert!(MEMBER.resolve_path("home.zip").is_none());
        assert!(MEMBER.resolve_path("nope").is_none());
    }

    #[test]
    fn test_single_table_columns_include_discriminator_and_subtypes() {
        assert_eq!(ITEM.base_columns(), vec!["id", "DTYPE", "price", "isbn"]);
        match ITEM.resolve_path("isbn") {
            Some(PathTarget::Column { slot, nullable, .. }) => {
                assert_eq!(slot, TableSlot::Base);
                assert!(nullable);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_member_columns_include_embedded_and_fk() {
        assert_eq!(
            MEMBER.base_columns(),
            vec![
                "member_id",
                "username",
                "age",
                "home_city",
                "home_street",
                "team_id"
            ]
        );
        assert_eq!(MEMBER.foreign_keys().count(), 1);
    }
}
