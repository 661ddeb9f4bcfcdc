//! Write-side table mapping, including inheritance hierarchies.
//!
//! An instance is written as one image per table. Plain entities and
//! single-table hierarchies have just the base table; a single-table image
//! carries every subtype's columns, NULL for the subtypes the instance is
//! not. A joined hierarchy writes the base columns to the root table and the
//! subtype's own columns to the subtype table, both keyed by the id column.
//! Images list the base table first, which is the insert order; deletes run
//! in reverse.

use entkit_core::{
    EntityDescriptor, EntityObject, Error, RelationState, RelationView, Result, SubtypeInfo, Value,
};
use serde::Serialize;
use std::collections::HashMap;

/// The columns of one table as an instance would write them, without the
/// key column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableImage {
    pub table: &'static str,
    pub columns: Vec<(&'static str, Value)>,
}

impl TableImage {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            columns: Vec::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, column: &'static str, value: Value) {
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }
}

/// Write permissions of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnAccess {
    pub insertable: bool,
    pub updatable: bool,
}

/// How `column` of `descriptor` may be written.
pub fn column_access(descriptor: &EntityDescriptor, column: &str) -> ColumnAccess {
    let declared = descriptor
        .fields
        .iter()
        .chain(descriptor.embedded.iter().flat_map(|e| e.fields.iter()))
        .chain(
            descriptor
                .inheritance
                .iter()
                .flat_map(|i| i.subtypes.iter())
                .flat_map(|s| s.fields.iter()),
        )
        .find(|f| f.column == column);
    if let Some(field) = declared {
        return ColumnAccess {
            insertable: field.insertable,
            updatable: field.updatable,
        };
    }
    if descriptor.discriminator() == Some(column) {
        return ColumnAccess {
            insertable: true,
            updatable: false,
        };
    }
    ColumnAccess {
        insertable: true,
        updatable: true,
    }
}

/// The subtype an instance of a hierarchy belongs to.
pub fn subtype_of(object: &dyn EntityObject) -> Result<Option<&'static SubtypeInfo>> {
    let descriptor = object.descriptor();
    if descriptor.inheritance.is_none() {
        return Ok(None);
    }
    let name = object
        .subtype()
        .ok_or_else(|| Error::mapping(descriptor.name, "hierarchy instance reports no subtype"))?;
    descriptor
        .subtype(name)
        .map(Some)
        .ok_or_else(|| Error::mapping(descriptor.name, format!("unknown subtype '{}'", name)))
}

/// The FK value an owning to-one relation currently points at.
pub fn foreign_key_value(state: &RelationState) -> Option<Value> {
    match state {
        RelationState::Null => Some(Value::Null),
        RelationState::Unloaded(key) => key.clone(),
        RelationState::One(target) => Some(target.entity_id().unwrap_or(Value::Null)),
        RelationState::Many(_) => None,
    }
}

/// Build the per-table images of `object`.
///
/// Owning relations named in `deferred` are written as NULL; the flush uses
/// this to break insert cycles.
pub fn row_image(object: &dyn EntityObject, deferred: &[&str]) -> Result<Vec<TableImage>> {
    let descriptor = object.descriptor();
    let subtype = subtype_of(object)?;
    let mut values: HashMap<&'static str, Value> = object.row_image().into_iter().collect();
    let mut take = |column: &'static str| values.remove(column).unwrap_or(Value::Null);

    let mut base = TableImage::new(descriptor.table);
    if let (Some(column), Some(subtype)) = (descriptor.discriminator(), subtype) {
        base.set(column, Value::Text(subtype.discriminator_value.to_string()));
    }
    for field in descriptor.fields {
        base.set(field.column, take(field.column));
    }
    for field in descriptor.embedded.iter().flat_map(|e| e.fields.iter()) {
        base.set(field.column, take(field.column));
    }

    let views: Vec<RelationView> = object.relations();
    for relation in descriptor.foreign_keys().filter(|r| r.writable) {
        let Some(column) = relation.join_column else {
            continue;
        };
        if deferred.contains(&relation.name) {
            base.set(column, Value::Null);
            continue;
        }
        if let Some(value) = views
            .iter()
            .find(|v| v.name == relation.name)
            .and_then(|v| foreign_key_value(&v.state))
        {
            base.set(column, value);
        }
    }

    let mut images = vec![base];
    if let Some(inheritance) = descriptor.inheritance {
        if inheritance.is_joined() {
            if let Some(subtype) = subtype {
                let mut own = TableImage::new(subtype.table);
                for field in subtype.fields {
                    own.set(field.column, take(field.column));
                }
                images.push(own);
            }
        } else {
            for other in inheritance.subtypes {
                let mine = subtype.is_some_and(|s| s.name == other.name);
                for field in other.fields {
                    let value = if mine { take(field.column) } else { Value::Null };
                    images[0].set(field.column, value);
                }
            }
        }
    }

    if let Some(column) = values.keys().next() {
        return Err(Error::mapping(
            descriptor.name,
            format!("row image has unmapped column '{}'", column),
        ));
    }
    Ok(images)
}
