//! Read-side physical layout of an aliased entity.
//!
//! Selecting an entity means selecting every column needed to hydrate it.
//! For a joined inheritance hierarchy that includes a LEFT JOIN per subtype
//! table plus a presence column telling which subtype row exists.

use crate::expr::Expr;
use crate::plan::{JoinKind, PlanColumn, PlanJoin, TableRef};
use entkit_core::{EntityDescriptor, Error, Result, Row, SubtypeInfo, TableSlot, Value};

/// Which part of the entity a column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Base,
    /// Key column of a joined subtype table, non-NULL when the row exists
    Presence(usize),
    Subtype(usize),
}

#[derive(Debug, Clone)]
struct LayoutColumn {
    expr: Expr,
    name: String,
    group: Group,
}

/// Columns and joins that make up one aliased entity in a select.
#[derive(Debug, Clone)]
pub struct EntityLayout {
    descriptor: &'static EntityDescriptor,
    alias: String,
    joins: Vec<PlanJoin>,
    columns: Vec<LayoutColumn>,
}

/// Alias of a joined subtype table under its root alias.
pub fn subtype_alias(alias: &str, subtype: &SubtypeInfo) -> String {
    format!("{}__{}", alias, subtype.name)
}

impl EntityLayout {
    pub fn new(descriptor: &'static EntityDescriptor, alias: &str) -> Self {
        let mut columns: Vec<LayoutColumn> = descriptor
            .base_columns()
            .into_iter()
            .map(|column| LayoutColumn {
                expr: Expr::qualified(alias, column),
                name: column.to_string(),
                group: Group::Base,
            })
            .collect();
        let mut joins = Vec::new();

        if let Some(inheritance) = descriptor.inheritance.filter(|i| i.is_joined()) {
            let key = descriptor.id.column;
            for (index, subtype) in inheritance.subtypes.iter().enumerate() {
                let sub_alias = subtype_alias(alias, subtype);
                joins.push(PlanJoin {
                    kind: JoinKind::Left,
                    table: TableRef::new(subtype.table, sub_alias.clone()),
                    on: Expr::qualified(sub_alias.clone(), key)
                        .eq(Expr::qualified(alias, key)),
                });
                columns.push(LayoutColumn {
                    expr: Expr::qualified(sub_alias.clone(), key),
                    name: format!("#{}", subtype.name),
                    group: Group::Presence(index),
                });
                for field in subtype.fields {
                    columns.push(LayoutColumn {
                        expr: Expr::qualified(sub_alias.clone(), field.column),
                        name: field.column.to_string(),
                        group: Group::Subtype(index),
                    });
                }
            }
        }

        Self {
            descriptor,
            alias: alias.to_string(),
            joins,
            columns,
        }
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.descriptor
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The entity's own table.
    pub fn table(&self) -> TableRef {
        TableRef::new(self.descriptor.table, self.alias.clone())
    }

    /// Joins to subtype tables (empty unless joined inheritance).
    pub fn joins(&self) -> &[PlanJoin] {
        &self.joins
    }

    /// Number of projected columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Projection columns, labelled `alias.column`.
    pub fn plan_columns(&self) -> Vec<PlanColumn> {
        self.columns
            .iter()
            .map(|c| PlanColumn {
                expr: c.expr.clone(),
                label: format!("{}.{}", self.alias, c.name),
            })
            .collect()
    }

    /// Qualify a column living in `slot`.
    pub fn qualify(&self, slot: TableSlot, column: &str) -> Expr {
        match slot {
            TableSlot::Base => Expr::qualified(self.alias.clone(), column),
            TableSlot::Subtype(table) => {
                let sub_alias = self
                    .descriptor
                    .inheritance
                    .and_then(|i| i.subtypes.iter().find(|s| s.table == table))
                    .map_or_else(|| self.alias.clone(), |s| subtype_alias(&self.alias, s));
                Expr::qualified(sub_alias, column)
            }
        }
    }

    /// The key column of this alias.
    pub fn key(&self) -> Expr {
        Expr::qualified(self.alias.clone(), self.descriptor.id.column)
    }

    /// Predicate restricting rows to one subtype.
    pub fn subtype_filter(&self, name: &str) -> Result<Expr> {
        let inheritance = self.descriptor.inheritance.ok_or_else(|| {
            Error::mapping(self.descriptor.name, "entity has no inheritance hierarchy")
        })?;
        let subtype = inheritance.subtype(name).ok_or_else(|| {
            Error::mapping(self.descriptor.name, format!("unknown subtype '{}'", name))
        })?;
        Ok(match inheritance.strategy.discriminator() {
            Some(column) => Expr::qualified(self.alias.clone(), column)
                .eq(subtype.discriminator_value),
            None => Expr::qualified(subtype_alias(&self.alias, subtype), self.descriptor.id.column)
                .is_not_null(),
        })
    }

    /// Extract this entity's columns from a result row, starting at column
    /// `start`.
    ///
    /// Returns `None` when the key is NULL (an unmatched left join). The
    /// returned row holds the base columns and the resolved subtype's own
    /// columns under their physical names.
    pub fn read(&self, row: &Row, start: usize) -> Result<Option<EntityRow>> {
        let value_at = |i: usize| row.get(start + i).cloned().unwrap_or(Value::Null);

        let key = self
            .columns
            .iter()
            .position(|c| c.group == Group::Base && c.name == self.descriptor.id.column)
            .map_or(Value::Null, value_at);
        if key.is_null() {
            return Ok(None);
        }

        let subtype = self.resolve_subtype(|name| {
            self.columns
                .iter()
                .position(|c| c.name == name)
                .map_or(Value::Null, value_at)
        })?;
        let subtype_index = subtype.and_then(|name| {
            self.descriptor
                .inheritance
                .and_then(|i| i.subtypes.iter().position(|s| s.name == name))
        });

        let mut names = Vec::with_capacity(self.columns.len());
        let mut values = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let keep = match column.group {
                Group::Base => true,
                Group::Subtype(index) => Some(index) == subtype_index,
                Group::Presence(_) => false,
            };
            if keep {
                names.push(column.name.clone());
                values.push(value_at(i));
            }
        }
        Ok(Some(EntityRow {
            key,
            subtype,
            row: Row::new(names, values),
        }))
    }

    /// Resolve the concrete subtype from the discriminator, or from which
    /// subtype row is present.
    fn resolve_subtype(&self, lookup: impl Fn(&str) -> Value) -> Result<Option<&'static str>> {
        let Some(inheritance) = self.descriptor.inheritance else {
            return Ok(None);
        };
        if let Some(column) = inheritance.strategy.discriminator() {
            return match lookup(column) {
                Value::Null => Ok(None),
                Value::Text(value) => inheritance
                    .subtype_by_discriminator(&value)
                    .map(|s| Some(s.name))
                    .ok_or_else(|| {
                        Error::mapping(
                            self.descriptor.name,
                            format!("unknown discriminator value '{}'", value),
                        )
                    }),
                other => Err(Error::mapping(
                    self.descriptor.name,
                    format!("discriminator must be text, found {}", other.type_name()),
                )),
            };
        }
        Ok(inheritance
            .subtypes
            .iter()
            .find(|s| !lookup(&format!("#{}", s.name)).is_null())
            .map(|s| s.name))
    }
}

/// One entity's slice of a result row.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub key: Value,
    pub subtype: Option<&'static str>,
    pub row: Row,
}
