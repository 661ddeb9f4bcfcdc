//! Snapshot-based dirty checking.
//!
//! A snapshot records what the database holds for an instance: its key, the
//! table images, the value-collection rows and, for owning many-to-many
//! relations whose contents are known, the linked target keys. Comparing a fresh
//! capture against it yields the [`ChangeSet`] the flush writes.
//!
//! A JSON digest of the captured state gives a cheap "unchanged" answer
//! before the column-by-column comparison.

use crate::inheritance::{TableImage, row_image};
use entkit_core::{EntityObject, RelationState, Result, Value};
use serde::Serialize;
use std::time::Instant;

/// Everything about an instance the flush may write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectState {
    /// Key of the row; `Null` before one is assigned
    pub key: Value,
    pub tables: Vec<TableImage>,
    pub collections: Vec<(&'static str, Vec<Vec<Value>>)>,
    /// Keys of linked targets per owning many-to-many relation
    pub links: Vec<(&'static str, Vec<Value>)>,
}

impl ObjectState {
    /// Capture the current state of `object`. Only loaded link collections
    /// are included.
    pub fn capture(object: &dyn EntityObject) -> Result<Self> {
        Ok(Self {
            key: object.entity_id().unwrap_or(Value::Null),
            tables: row_image(object, &[])?,
            collections: capture_collections(object),
            links: capture_links(object),
        })
    }

    /// The state of a row that was just inserted: `tables` as written, no
    /// element rows and no link rows yet.
    pub fn inserted(object: &dyn EntityObject, tables: Vec<TableImage>) -> Self {
        Self {
            key: object.entity_id().unwrap_or(Value::Null),
            tables,
            collections: Vec::new(),
            links: object
                .descriptor()
                .link_tables()
                .map(|r| (r.name, Vec::new()))
                .collect(),
        }
    }

    pub fn table(&self, table: &str) -> Option<&TableImage> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn links(&self, relation: &str) -> Option<&[Value]> {
        self.links
            .iter()
            .find(|(name, _)| *name == relation)
            .map(|(_, keys)| keys.as_slice())
    }

    fn digest(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn capture_collections(object: &dyn EntityObject) -> Vec<(&'static str, Vec<Vec<Value>>)> {
    let mut current = object.value_collections();
    object
        .descriptor()
        .value_collections
        .iter()
        .filter_map(|info| {
            let index = current.iter().position(|(name, _)| *name == info.name)?;
            Some(current.swap_remove(index))
        })
        .collect()
}

/// Keys of the loaded targets of each owning many-to-many relation.
pub fn capture_links(object: &dyn EntityObject) -> Vec<(&'static str, Vec<Value>)> {
    let views = object.relations();
    object
        .descriptor()
        .link_tables()
        .filter_map(|relation| {
            let view = views.iter().find(|v| v.name == relation.name)?;
            match &view.state {
                RelationState::Many(targets) => Some((
                    relation.name,
                    targets
                        .iter()
                        .map(|t| t.entity_id().unwrap_or(Value::Null))
                        .collect(),
                )),
                _ => None,
            }
        })
        .collect()
}

fn same(a: &Value, b: &Value) -> bool {
    a.sort_cmp(b).is_eq()
}

fn same_rows(a: &[Vec<Value>], b: &[Vec<Value>]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.len() == y.len() && x.iter().zip(y).all(|(p, q)| same(p, q)))
}

fn without(keys: &[Value], removed: &[Value]) -> Vec<Value> {
    keys.iter()
        .filter(|k| !removed.iter().any(|r| same(k, r)))
        .cloned()
        .collect()
}

/// Recorded database state of one instance.
#[derive(Debug, Clone)]
pub struct Snapshot {
    state: ObjectState,
    digest: String,
    taken_at: Instant,
}

impl Snapshot {
    pub fn new(state: ObjectState) -> Self {
        let digest = state.digest();
        Self {
            state,
            digest,
            taken_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// Record the link rows of `relation` as now known.
    pub fn set_links(&mut self, relation: &'static str, keys: Vec<Value>) {
        match self.state.links.iter_mut().find(|(name, _)| *name == relation) {
            Some(slot) => slot.1 = keys,
            None => self.state.links.push((relation, keys)),
        }
        self.digest = self.state.digest();
    }

    /// The snapshot after `written` has been flushed. Link relations that
    /// were not loaded keep their recorded contents.
    pub fn advance(&self, written: ObjectState) -> Snapshot {
        let mut state = written;
        for (relation, keys) in &self.state.links {
            if state.links(relation).is_none() {
                state.links.push((*relation, keys.clone()));
            }
        }
        Snapshot::new(state)
    }

    /// Key of the row as the database holds it.
    pub fn key(&self) -> &Value {
        &self.state.key
    }

    /// Whether the key of `current` is not the recorded one. Keys are
    /// immutable once a row exists.
    pub fn key_changed(&self, current: &ObjectState) -> bool {
        !self.state.key.is_null() && !same(&self.state.key, &current.key)
    }

    /// Whether `current` differs from the recorded state.
    pub fn is_dirty(&self, current: &ObjectState) -> bool {
        if current.digest() == self.digest {
            return false;
        }
        self.key_changed(current) || !self.diff(current).is_empty()
    }

    /// What changed between the recorded state and `current`.
    pub fn diff(&self, current: &ObjectState) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for image in &current.tables {
            let recorded = self.state.table(image.table);
            let columns: Vec<&'static str> = image
                .columns
                .iter()
                .filter(|(column, value)| {
                    recorded
                        .and_then(|r| r.get(column))
                        .is_none_or(|old| !same(old, value))
                })
                .map(|(column, _)| *column)
                .collect();
            if !columns.is_empty() {
                changes.tables.push(TableChange {
                    table: image.table,
                    columns,
                });
            }
        }

        for (name, rows) in &current.collections {
            match self.state.collections.iter().find(|(n, _)| n == name) {
                Some((_, old)) if same_rows(old, rows) => {}
                Some(_) => changes.collections.push(CollectionChange {
                    name: *name,
                    fresh: false,
                }),
                None if rows.is_empty() => {}
                None => changes.collections.push(CollectionChange {
                    name: *name,
                    fresh: true,
                }),
            }
        }

        for (relation, keys) in &current.links {
            match self.state.links(relation) {
                Some(old) => {
                    let added = without(keys, old);
                    let removed = without(old, keys);
                    if !added.is_empty() || !removed.is_empty() {
                        changes.links.push(LinkChange {
                            relation: *relation,
                            added,
                            removed,
                            replace: false,
                        });
                    }
                }
                None => changes.links.push(LinkChange {
                    relation: *relation,
                    added: keys.clone(),
                    removed: Vec::new(),
                    replace: true,
                }),
            }
        }
        changes
    }
}

/// Changed columns of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
}

/// A value collection whose rows must be rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChange {
    pub name: &'static str,
    /// No rows were ever written, so there is nothing to delete first
    pub fresh: bool,
}

/// Link rows to add and remove for one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkChange {
    pub relation: &'static str,
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    /// Stored links are unknown; delete them all before adding
    pub replace: bool,
}

/// The difference between a snapshot and the current state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub tables: Vec<TableChange>,
    pub collections: Vec<CollectionChange>,
    pub links: Vec<LinkChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.collections.is_empty() && self.links.is_empty()
    }

    pub fn table(&self, table: &str) -> Option<&TableChange> {
        self.tables.iter().find(|t| t.table == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_entities::{Member, Product, Team, member_of};
    use entkit_core::{Collection, Managed};

    fn snapshot_of(object: &dyn EntityObject) -> Snapshot {
        Snapshot::new(ObjectState::capture(object).unwrap())
    }

    #[test]
    fn test_unchanged_instance_is_clean() {
        let team = Managed::new(Team::with_id(1, "red"));
        let snapshot = snapshot_of(&*team.erase());
        let current = ObjectState::capture(&*team.erase()).unwrap();
        assert!(!snapshot.is_dirty(&current));
        assert!(snapshot.diff(&current).is_empty());
    }

    #[test]
    fn test_changed_column_is_reported() {
        let team = Managed::new(Team::with_id(1, "red"));
        let snapshot = snapshot_of(&*team.erase());
        team.write().name = "blue".into();

        let current = ObjectState::capture(&*team.erase()).unwrap();
        assert!(snapshot.is_dirty(&current));
        let changes = snapshot.diff(&current);
        assert_eq!(
            changes.tables,
            vec![TableChange {
                table: "team",
                columns: vec!["name"],
            }]
        );
    }

    #[test]
    fn test_changed_key_is_detected() {
        let team = Managed::new(Team::with_id(1, "red"));
        let snapshot = snapshot_of(&*team.erase());
        assert_eq!(snapshot.key(), &Value::BigInt(1));
        team.write().id = Some(2);

        let current = ObjectState::capture(&*team.erase()).unwrap();
        assert!(snapshot.key_changed(&current));
        assert!(snapshot.is_dirty(&current));
        assert!(snapshot.diff(&current).is_empty());
    }

    #[test]
    fn test_integer_width_is_not_a_change() {
        let team = Managed::new(Team::with_id(1, "red"));
        let mut state = ObjectState::capture(&*team.erase()).unwrap();
        state.tables[0].set("version", Value::Int(0));
        let snapshot = Snapshot::new(state);
        let current = ObjectState::capture(&*team.erase()).unwrap();
        assert!(!snapshot.is_dirty(&current));
    }

    #[test]
    fn test_link_changes_are_diffed() {
        let team = Managed::new(Team::with_id(1, "red"));
        let member = member_of(&team, "kim", 30);
        let keep = Managed::new(Product::new(1, "pen"));
        let drop = Managed::new(Product::new(2, "ink"));
        member.write().products = Collection::from(vec![keep.clone(), drop.clone()]);
        let snapshot = snapshot_of(&*member.erase());

        let added = Managed::new(Product::new(3, "pad"));
        member.write().products = Collection::from(vec![keep, added]);
        let changes = snapshot.diff(&ObjectState::capture(&*member.erase()).unwrap());
        assert_eq!(changes.links.len(), 1);
        assert_eq!(changes.links[0].added, vec![Value::BigInt(3)]);
        assert_eq!(changes.links[0].removed, vec![Value::BigInt(2)]);
        assert!(!changes.links[0].replace);
    }

    #[test]
    fn test_unknown_links_are_replaced() {
        let member = Managed::new(Member::new("kim", 30));
        let mut state = ObjectState::capture(&*member.erase()).unwrap();
        state.links.clear();
        let snapshot = Snapshot::new(state);

        let changes = snapshot.diff(&ObjectState::capture(&*member.erase()).unwrap());
        assert!(changes.links[0].replace);
    }

    #[test]
    fn test_value_collection_rewrite() {
        let member = Managed::new(Member::new("kim", 30));
        let erased = member.erase();
        let fresh = Snapshot::new(ObjectState::inserted(
            &*erased,
            ObjectState::capture(&*erased).unwrap().tables,
        ));
        member.write().tags = vec!["a".into()];
        let changes = fresh.diff(&ObjectState::capture(&*erased).unwrap());
        assert_eq!(
            changes.collections,
            vec![CollectionChange {
                name: "tags",
                fresh: true
            }]
        );

        let loaded = snapshot_of(&*erased);
        member.write().tags.push("b".into());
        let changes = loaded.diff(&ObjectState::capture(&*erased).unwrap());
        assert!(!changes.collections[0].fresh);
    }

    #[test]
    fn test_advance_keeps_unloaded_links() {
        let member = Managed::new(Member::new("kim", 30));
        let erased = member.erase();
        let mut snapshot = snapshot_of(&*erased);
        snapshot.set_links("products", vec![Value::BigInt(9)]);

        let mut written = ObjectState::capture(&*erased).unwrap();
        written.links.clear();
        let next = snapshot.advance(written);
        assert_eq!(next.state().links("products"), Some(&[Value::BigInt(9)][..]));
    }
}
