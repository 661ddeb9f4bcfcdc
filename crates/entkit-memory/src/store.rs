//! Table storage and constraint checks.

use entkit_core::{Error, Metamodel, Value};
use std::collections::{BTreeMap, HashMap};

/// One stored row, by column name.
pub type Record = BTreeMap<String, Value>;

/// A referential constraint checked on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub rows: Vec<Record>,
}

/// Every table plus the constraints known about them.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: HashMap<String, Table>,
    primary_keys: HashMap<String, String>,
    foreign_keys: Vec<ForeignKey>,
    sequences: HashMap<String, i64>,
}

fn constraint(message: String) -> Error {
    tracing::debug!(%message, "Constraint violation");
    Error::executor(message)
}

impl Database {
    pub fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], |t| t.rows.as_slice())
    }

    pub fn table_mut(&mut self, table: &str) -> &mut Table {
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn set_primary_key(&mut self, table: &str, column: &str) {
        self.primary_keys
            .insert(table.to_string(), column.to_string());
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Derive keys and constraints from entity metadata: entity keys,
    /// owning FK columns, join tables, value-collection tables and joined
    /// subtype tables.
    pub fn apply_schema(&mut self, model: &Metamodel) {
        for entity in model.entities() {
            self.set_primary_key(entity.table, entity.id.column);
            for relation in entity.foreign_keys() {
                let (Some(column), Some(target)) = (relation.join_column, model.get(relation.target))
                else {
                    continue;
                };
                self.add_foreign_key(ForeignKey {
                    table: entity.table.to_string(),
                    column: column.to_string(),
                    references_table: target.table.to_string(),
                    references_column: target.id.column.to_string(),
                });
            }
            for relation in entity.link_tables() {
                let (Some(link), Some(target)) = (relation.join_table, model.get(relation.target))
                else {
                    continue;
                };
                self.add_foreign_key(ForeignKey {
                    table: link.table.to_string(),
                    column: link.owner_column.to_string(),
                    references_table: entity.table.to_string(),
                    references_column: entity.id.column.to_string(),
                });
                self.add_foreign_key(ForeignKey {
                    table: link.table.to_string(),
                    column: link.target_column.to_string(),
                    references_table: target.table.to_string(),
                    references_column: target.id.column.to_string(),
                });
            }
            for collection in entity.value_collections {
                self.add_foreign_key(ForeignKey {
                    table: collection.table.to_string(),
                    column: collection.owner_column.to_string(),
                    references_table: entity.table.to_string(),
                    references_column: entity.id.column.to_string(),
                });
            }
            if let Some(inheritance) = entity.inheritance.filter(|i| i.is_joined()) {
                for subtype in inheritance.subtypes {
                    self.set_primary_key(subtype.table, entity.id.column);
                    self.add_foreign_key(ForeignKey {
                        table: subtype.table.to_string(),
                        column: entity.id.column.to_string(),
                        references_table: entity.table.to_string(),
                        references_column: entity.id.column.to_string(),
                    });
                }
            }
        }
    }

    /// Next value of the table's key sequence.
    pub fn next_key(&mut self, table: &str) -> Value {
        let next = self.sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        Value::BigInt(*next)
    }

    /// Replace the contents with `snapshot`, keeping key sequences so that
    /// keys handed out before a rollback are never reused.
    pub fn restore(&mut self, snapshot: Database) {
        let sequences = std::mem::take(&mut self.sequences);
        *self = snapshot;
        self.sequences = sequences;
    }

    fn exists(&self, table: &str, column: &str, value: &Value) -> bool {
        self.rows(table)
            .iter()
            .any(|row| row.get(column).is_some_and(|v| v.sql_eq(value) == Some(true)))
    }

    /// Outgoing references of `record` must point at existing rows.
    pub fn check_references(&self, table: &str, record: &Record) -> Result<(), Error> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(value) = record.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            if !self.exists(&fk.references_table, &fk.references_column, value) {
                return Err(constraint(format!(
                    "foreign key {}.{} = {} has no matching {}.{}",
                    table, fk.column, value, fk.references_table, fk.references_column
                )));
            }
        }
        Ok(())
    }

    /// No remaining row may reference `record`.
    pub fn check_not_referenced(&self, table: &str, record: &Record) -> Result<(), Error> {
        for fk in self.foreign_keys.iter().filter(|fk| fk.references_table == table) {
            let Some(value) = record.get(&fk.references_column) else {
                continue;
            };
            if self.exists(&fk.table, &fk.column, value) {
                return Err(constraint(format!(
                    "{}.{} = {} is still referenced by {}.{}",
                    table, fk.references_column, value, fk.table, fk.column
                )));
            }
        }
        Ok(())
    }

    /// Insert a record, enforcing key uniqueness and references.
    pub fn insert(&mut self, table: &str, record: Record) -> Result<(), Error> {
        if let Some(key) = self.primary_keys.get(table) {
            match record.get(key) {
                None | Some(Value::Null) => {
                    return Err(constraint(format!("{}.{} may not be NULL", table, key)));
                }
                Some(value) if self.exists(table, key, value) => {
                    return Err(constraint(format!(
                        "duplicate key {}.{} = {}",
                        table, key, value
                    )));
                }
                Some(value) => {
                    // Explicit keys push the sequence past them.
                    if let Some(explicit) = value.as_i64() {
                        let next = self.sequences.entry(table.to_string()).or_insert(0);
                        *next = (*next).max(explicit);
                    }
                }
            }
        }
        self.check_references(table, &record)?;
        self.table_mut(table).rows.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn with_team_fk() -> Database {
        let mut db = Database::default();
        db.set_primary_key("team", "team_id");
        db.add_foreign_key(ForeignKey {
            table: "member".into(),
            column: "team_id".into(),
            references_table: "team".into(),
            references_column: "team_id".into(),
        });
        db
    }

    #[test]
    fn test_insert_checks_references() {
        let mut db = with_team_fk();
        let member = record(&[("member_id", Value::BigInt(1)), ("team_id", Value::BigInt(7))]);
        assert!(db.insert("member", member.clone()).is_err());

        db.insert("team", record(&[("team_id", Value::BigInt(7))])).unwrap();
        db.insert("member", member).unwrap();
        assert_eq!(db.rows("member").len(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut db = with_team_fk();
        db.insert("team", record(&[("team_id", Value::BigInt(1))])).unwrap();
        assert!(db.insert("team", record(&[("team_id", Value::Int(1))])).is_err());
    }

    #[test]
    fn test_referenced_row_cannot_be_removed() {
        let mut db = with_team_fk();
        let team = record(&[("team_id", Value::BigInt(1))]);
        db.insert("team", team.clone()).unwrap();
        db.insert(
            "member",
            record(&[("member_id", Value::BigInt(1)), ("team_id", Value::BigInt(1))]),
        )
        .unwrap();
        assert!(db.check_not_referenced("team", &team).is_err());
    }

    #[test]
    fn test_sequences_are_per_table() {
        let mut db = Database::default();
        assert_eq!(db.next_key("team"), Value::BigInt(1));
        assert_eq!(db.next_key("team"), Value::BigInt(2));
        assert_eq!(db.next_key("member"), Value::BigInt(1));
    }

    #[test]
    fn test_explicit_keys_advance_sequence() {
        let mut db = with_team_fk();
        db.insert("team", record(&[("team_id", Value::BigInt(5))])).unwrap();
        assert_eq!(db.next_key("team"), Value::BigInt(6));
    }

    #[test]
    fn test_restore_keeps_sequences() {
        let mut db = Database::default();
        let snapshot = db.clone();
        db.next_key("team");
        db.insert("team", record(&[("team_id", Value::BigInt(1))])).unwrap();
        db.restore(snapshot);
        assert!(db.rows("team").is_empty());
        assert_eq!(db.next_key("team"), Value::BigInt(2));
    }
}
