//! Flush execution: turning tracked changes into statements.

use crate::change_tracker::{ObjectState, Snapshot};
use crate::context::PersistenceContext;
use crate::events::ContextEvent;
use crate::flush::{
    Edge, FlushResult, MandatoryCycle, PlanNode, clear_column_statement, clear_links_statement,
    delete_elements_statement, delete_link_statement, delete_statement, insert_element_statement,
    insert_link_statement, insert_statement, order_nodes, update_statement,
};
use crate::identity_map::IdentityKey;
use crate::inheritance::row_image;
use crate::state::LifecycleState;
use entkit_core::{
    Cx, EntityObject, Error, FieldInfo, ObjectId, Outcome, RelationState, Result, SqlType,
    StaleStateError, Value, WriteKind,
};
use entkit_query::{Executor, Statement};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Run one write and return the affected row count.
async fn write<E: Executor>(executor: &E, cx: &Cx, statement: &Statement) -> Outcome<u64, Error> {
    tracing::debug!(statement = %statement, "Flush statement");
    let result = entkit_core::try_outcome!(executor.execute(cx, statement).await);
    Outcome::Ok(result.affected())
}

fn initial_version(field: &FieldInfo) -> Value {
    match field.sql_type {
        SqlType::Integer => Value::Int(0),
        _ => Value::BigInt(0),
    }
}

fn next_version(field: &FieldInfo, current: &Value) -> Value {
    match current {
        Value::Int(n) => Value::Int(n + 1),
        Value::BigInt(n) => Value::BigInt(n + 1),
        _ => match initial_version(field) {
            Value::Int(_) => Value::Int(1),
            _ => Value::BigInt(1),
        },
    }
}

fn stale(object: &dyn EntityObject, key: &Value, write: WriteKind, table: &'static str) -> Error {
    Error::StaleState(StaleStateError {
        entity: object.descriptor().name,
        key: key.clone(),
        write,
        table,
    })
}

/// The key the database holds for a written instance. Updates and
/// deletes always address the row by this key.
fn recorded_key(object: &dyn EntityObject, snapshot: &Snapshot) -> Result<Value> {
    Some(snapshot.key())
        .filter(|k| !k.is_null())
        .cloned()
        .ok_or_else(|| Error::mapping(object.descriptor().name, "instance has no key"))
}

impl<E: Executor> PersistenceContext<E> {
    /// Tracked instances in `state`, in persist order.
    fn in_state(&self, state: LifecycleState, inserted: bool) -> Vec<Arc<dyn EntityObject>> {
        let mut found: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.state == state && e.inserted == inserted)
            .map(|e| (e.seq, Arc::clone(&e.object)))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, object)| object).collect()
    }

    /// Write every pending change: inserts, then updates, then element and
    /// link rows, then deletes.
    ///
    /// On error the statements already executed stay executed; the caller
    /// should roll the transaction back.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        entkit_core::try_result!(self.ensure_open("flush"));
        entkit_core::try_result!(self.events.fire(ContextEvent::BeforeFlush));
        entkit_core::try_outcome!(self.cascade_removals(cx).await);
        entkit_core::try_result!(self.cascade_pending());
        entkit_core::try_result!(self.check_references());
        entkit_core::try_result!(self.check_keys());

        let mut result = FlushResult::default();
        entkit_core::try_outcome!(self.flush_inserts(cx, &mut result).await);
        entkit_core::try_outcome!(self.flush_updates(cx, &mut result).await);
        entkit_core::try_outcome!(self.flush_elements(cx, &mut result).await);
        entkit_core::try_outcome!(self.flush_deletes(cx, &mut result).await);

        entkit_core::try_result!(self.events.fire(ContextEvent::AfterFlush));
        if result.is_empty() {
            tracing::debug!("Flush found nothing to write");
        } else {
            tracing::info!(
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                statements = result.statements,
                "Flush complete"
            );
        }
        Outcome::Ok(result)
    }

    async fn flush_inserts(&mut self, cx: &Cx, result: &mut FlushResult) -> Outcome<(), Error> {
        let pending = self.in_state(LifecycleState::Managed, false);
        if pending.is_empty() {
            return Outcome::Ok(());
        }
        let ids: HashSet<ObjectId> = pending.iter().map(ObjectId::of).collect();
        let nodes: Vec<PlanNode> = pending
            .iter()
            .map(|object| insert_node(object, &ids))
            .collect();
        let order = entkit_core::try_result!(order_nodes(&nodes, MandatoryCycle::Fail));
        let by_id: HashMap<ObjectId, Arc<dyn EntityObject>> =
            pending.into_iter().map(|o| (ObjectId::of(&o), o)).collect();

        for id in &order.order {
            let Some(object) = by_id.get(id).cloned() else {
                continue;
            };
            let descriptor = object.descriptor();
            let key = match object.entity_id().filter(|k| !k.is_null()) {
                Some(key) => key,
                None => {
                    let key =
                        entkit_core::try_outcome!(self.executor.generate_key(cx, descriptor.table).await);
                    entkit_core::try_result!(object.assign_id(key.clone()));
                    entkit_core::try_result!(
                        self.identity
                            .register(IdentityKey::new(descriptor, key.clone()), &object)
                    );
                    key
                }
            };
            if let Some(field) = descriptor.version_field() {
                let unset = object
                    .row_image()
                    .iter()
                    .any(|(column, value)| *column == field.column && value.is_null());
                if unset {
                    entkit_core::try_result!(object.assign_version(initial_version(field)));
                }
            }

            let deferred = order.broken_for(*id);
            let images = entkit_core::try_result!(row_image(&*object, &deferred));
            for image in &images {
                let statement = insert_statement(descriptor, &key, image);
                entkit_core::try_outcome!(write(&self.executor, cx, &statement).await);
                result.statements += 1;
            }
            if let Some(entry) = self.entries.get_mut(id) {
                entry.inserted = true;
                entry.snapshot = Some(Snapshot::new(ObjectState::inserted(&*object, images)));
            }
            result.inserted += 1;
            tracing::debug!(entity = descriptor.name, key = %key, deferred = deferred.len(), "Inserted");
        }
        Outcome::Ok(())
    }

    async fn flush_updates(&mut self, cx: &Cx, result: &mut FlushResult) -> Outcome<(), Error> {
        for object in self.in_state(LifecycleState::Managed, true) {
            let id = ObjectId::of(&object);
            let Some(snapshot) = self.entries.get(&id).and_then(|e| e.snapshot.clone()) else {
                continue;
            };
            let current = entkit_core::try_result!(ObjectState::capture(&*object));
            if !snapshot.is_dirty(&current) {
                continue;
            }
            let changes = snapshot.diff(&current);
            if changes.tables.is_empty() {
                continue;
            }

            let descriptor = object.descriptor();
            let key = entkit_core::try_result!(recorded_key(&*object, &snapshot));
            let version = descriptor.version_field().map(|field| {
                let expected = snapshot
                    .state()
                    .table(descriptor.table)
                    .and_then(|t| t.get(field.column))
                    .cloned()
                    .unwrap_or(Value::Null);
                let next = next_version(field, &expected);
                (field.column, expected, next)
            });

            let mut written = current.tables.clone();
            for image in &mut written {
                let is_base = image.table == descriptor.table;
                if is_base {
                    if let Some((column, _, next)) = &version {
                        image.set(*column, next.clone());
                    }
                }
                let changed = changes.table(image.table).is_some() || (is_base && version.is_some());
                if !changed {
                    continue;
                }
                let check = version
                    .as_ref()
                    .filter(|_| is_base)
                    .map(|(column, expected, next)| (*column, expected, next));
                let statement = update_statement(descriptor, &key, image, check);
                let affected = entkit_core::try_outcome!(write(&self.executor, cx, &statement).await);
                result.statements += 1;
                if affected == 0 {
                    return Outcome::Err(stale(&*object, &key, WriteKind::Update, image.table));
                }
            }
            if let Some((_, _, next)) = version {
                entkit_core::try_result!(object.assign_version(next));
            }

            let state = snapshot.state();
            let advanced = snapshot.advance(ObjectState {
                key: key.clone(),
                tables: written,
                collections: state.collections.clone(),
                links: state.links.clone(),
            });
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.snapshot = Some(advanced);
            }
            result.updated += 1;
            tracing::debug!(entity = descriptor.name, key = %key, tables = changes.tables.len(), "Updated");
        }
        Outcome::Ok(())
    }

    /// Rewrite changed element collections and link rows of managed owners.
    async fn flush_elements(&mut self, cx: &Cx, result: &mut FlushResult) -> Outcome<(), Error> {
        for object in self.in_state(LifecycleState::Managed, true) {
            let id = ObjectId::of(&object);
            let Some(snapshot) = self.entries.get(&id).and_then(|e| e.snapshot.clone()) else {
                continue;
            };
            let current = entkit_core::try_result!(ObjectState::capture(&*object));
            let changes = snapshot.diff(&current);
            if changes.collections.is_empty() && changes.links.is_empty() {
                continue;
            }
            let descriptor = object.descriptor();
            let key = entkit_core::try_result!(recorded_key(&*object, &snapshot));

            let mut statements = Vec::new();
            for change in &changes.collections {
                let Some(info) = descriptor.value_collection(change.name) else {
                    continue;
                };
                if !change.fresh {
                    statements.push(delete_elements_statement(info, &key));
                }
                let rows = current
                    .collections
                    .iter()
                    .find(|(name, _)| *name == change.name)
                    .map(|(_, rows)| rows.as_slice())
                    .unwrap_or_default();
                statements.extend(rows.iter().map(|row| insert_element_statement(info, &key, row)));
            }
            for change in &changes.links {
                let Some(relation) = descriptor.relationship(change.relation) else {
                    continue;
                };
                if change.replace {
                    statements.push(entkit_core::try_result!(clear_links_statement(
                        descriptor, relation, &key
                    )));
                }
                for target in &change.removed {
                    statements.push(entkit_core::try_result!(delete_link_statement(
                        descriptor, relation, &key, target
                    )));
                }
                for target in &change.added {
                    statements.push(entkit_core::try_result!(insert_link_statement(
                        descriptor, relation, &key, target
                    )));
                }
            }

            for statement in &statements {
                entkit_core::try_outcome!(write(&self.executor, cx, statement).await);
            }
            result.statements += statements.len();

            let advanced = snapshot.advance(ObjectState {
                key: key.clone(),
                tables: snapshot.state().tables.clone(),
                collections: current.collections,
                links: current.links,
            });
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.snapshot = Some(advanced);
            }
            tracing::debug!(
                entity = descriptor.name,
                key = %key,
                collections = changes.collections.len(),
                links = changes.links.len(),
                "Rewrote auxiliary rows"
            );
        }
        Outcome::Ok(())
    }

    async fn flush_deletes(&mut self, cx: &Cx, result: &mut FlushResult) -> Outcome<(), Error> {
        let removed = self.in_state(LifecycleState::Removed, true);
        if removed.is_empty() {
            return Outcome::Ok(());
        }
        let nodes = entkit_core::try_result!(self.delete_nodes(&removed));
        let order = entkit_core::try_result!(order_nodes(&nodes, MandatoryCycle::Ignore));
        let by_id: HashMap<ObjectId, Arc<dyn EntityObject>> =
            removed.into_iter().map(|o| (ObjectId::of(&o), o)).collect();

        // Cycles between removed rows are broken by clearing a nullable FK.
        for (holder, relation) in &order.broken {
            let Some(object) = by_id.get(holder) else {
                continue;
            };
            let descriptor = object.descriptor();
            let Some(column) = descriptor.relationship(relation).and_then(|r| r.join_column) else {
                continue;
            };
            let Some(snapshot) = self.entries.get(holder).and_then(|e| e.snapshot.as_ref()) else {
                continue;
            };
            let key = entkit_core::try_result!(recorded_key(&**object, snapshot));
            let statement = clear_column_statement(descriptor, &key, column);
            entkit_core::try_outcome!(write(&self.executor, cx, &statement).await);
            result.statements += 1;
        }

        for id in &order.order {
            let Some(object) = by_id.get(id).cloned() else {
                continue;
            };
            let descriptor = object.descriptor();
            let Some(snapshot) = self.entries.get(id).and_then(|e| e.snapshot.clone()) else {
                continue;
            };
            let key = entkit_core::try_result!(recorded_key(&*object, &snapshot));

            let mut statements: Vec<Statement> = descriptor
                .value_collections
                .iter()
                .map(|info| delete_elements_statement(info, &key))
                .collect();
            for relation in descriptor.link_tables() {
                statements.push(entkit_core::try_result!(clear_links_statement(
                    descriptor, relation, &key
                )));
            }
            for statement in &statements {
                entkit_core::try_outcome!(write(&self.executor, cx, statement).await);
            }
            result.statements += statements.len();

            let version = descriptor.version_field().map(|field| {
                let expected = snapshot
                    .state()
                    .table(descriptor.table)
                    .and_then(|t| t.get(field.column))
                    .cloned()
                    .unwrap_or(Value::Null);
                (field.column, expected)
            });
            // Subtype rows first, the base row last.
            for image in snapshot.state().tables.iter().rev() {
                let check = version
                    .as_ref()
                    .filter(|_| image.table == descriptor.table)
                    .map(|(column, expected)| (*column, expected));
                let statement = delete_statement(descriptor, image.table, &key, check);
                let affected = entkit_core::try_outcome!(write(&self.executor, cx, &statement).await);
                result.statements += 1;
                if affected == 0 {
                    return Outcome::Err(stale(&*object, &key, WriteKind::Delete, image.table));
                }
            }

            self.release(&object);
            result.deleted += 1;
            tracing::debug!(entity = descriptor.name, key = %key, "Deleted");
        }
        Outcome::Ok(())
    }

    /// Keys of written instances are immutable: a changed key would make
    /// the update address another row.
    pub(crate) fn check_keys(&self) -> Result<()> {
        for entry in self.entries.values() {
            let Some(snapshot) = &entry.snapshot else {
                continue;
            };
            let current = entry.object.entity_id().unwrap_or(Value::Null);
            if snapshot.key().is_null() || snapshot.key().sort_cmp(&current).is_eq() {
                continue;
            }
            let descriptor = entry.object.descriptor();
            return Err(Error::mapping(
                descriptor.name,
                format!(
                    "primary key of a managed instance changed from {} to {current}",
                    snapshot.key()
                ),
            ));
        }
        Ok(())
    }

    /// Dependency nodes for deletes: a removed row holding an FK to another
    /// removed row goes first. FK values come from the snapshot, which is
    /// what the database holds.
    fn delete_nodes(&self, removed: &[Arc<dyn EntityObject>]) -> Result<Vec<PlanNode>> {
        let mut by_key: HashMap<IdentityKey, ObjectId> = HashMap::new();
        for object in removed {
            if let Some(key) = IdentityKey::of(object) {
                by_key.insert(key, ObjectId::of(object));
            }
        }

        let mut nodes: Vec<PlanNode> = removed
            .iter()
            .map(|object| PlanNode {
                id: ObjectId::of(object),
                entity: object.descriptor().name,
                edges: Vec::new(),
            })
            .collect();
        let position: HashMap<ObjectId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        for object in removed {
            let holder = ObjectId::of(object);
            let descriptor = object.descriptor();
            let Some(base) = self
                .entries
                .get(&holder)
                .and_then(|e| e.snapshot.as_ref())
                .and_then(|s| s.state().table(descriptor.table).cloned())
            else {
                continue;
            };
            for relation in descriptor.foreign_keys() {
                let Some(value) = relation
                    .join_column
                    .and_then(|column| base.get(column))
                    .filter(|v| !v.is_null())
                else {
                    continue;
                };
                let target = self.model.require(relation.target)?;
                let Some(parent) = by_key.get(&IdentityKey::new(target, value.clone())) else {
                    continue;
                };
                if let Some(index) = position.get(parent) {
                    nodes[*index].edges.push(Edge {
                        before: holder,
                        holder,
                        relation: relation.name,
                        nullable: relation.optional,
                    });
                }
            }
        }
        Ok(nodes)
    }
}

/// Insert dependencies of `object`: the pending inserts its owning to-one
/// edges point at.
fn insert_node(object: &Arc<dyn EntityObject>, pending: &HashSet<ObjectId>) -> PlanNode {
    let holder = ObjectId::of(object);
    let descriptor = object.descriptor();
    let views = object.relations();
    let mut edges = Vec::new();
    for relation in descriptor.foreign_keys().filter(|r| r.writable) {
        let Some(view) = views.iter().find(|v| v.name == relation.name) else {
            continue;
        };
        let RelationState::One(target) = &view.state else {
            continue;
        };
        let before = ObjectId::of(target);
        if pending.contains(&before) {
            edges.push(Edge {
                before,
                holder,
                relation: relation.name,
                nullable: relation.optional,
            });
        }
    }
    PlanNode {
        id: holder,
        entity: descriptor.name,
        edges,
    }
}
