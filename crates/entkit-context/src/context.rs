//! The persistence context.
//!
//! A [`PersistenceContext`] is the unit of work: it owns the identity map,
//! the per-instance snapshots and lifecycle states, and writes the
//! accumulated changes through its [`Executor`] at flush. It is driven
//! through `&mut self` and is not internally synchronized.
//!
//! ```ignore
//! let mut ctx = PersistenceContext::new(MemoryExecutor::with_schema(&model), model);
//! let team = Managed::new(Team::new("red"));
//! ctx.persist(&team)?;
//! ctx.flush(&cx).await;
//! let again = ctx.find::<Team>(&cx, team.id().unwrap()).await;
//! ```

use crate::cascade::{Visited, reachable};
use crate::change_tracker::{ObjectState, Snapshot};
use crate::config::ContextConfig;
use crate::events::{ContextEvent, ContextEventCallbacks};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::state::{LifecycleOp, LifecycleState, transition};
use entkit_core::{
    CascadeOp, ContextClosedError, ContextToken, Cx, Entity, EntityDescriptor, EntityObject,
    Error, HydrateScope, IdentityConflictError, LifecycleError, Loadable, LoaderHandle, Managed,
    Metamodel, ObjectId, Outcome, RelationValue, RelationshipInfo, Result,
};
use entkit_query::{EntityRow, Executor, Hydrated, Hydrator, QuerySession};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

/// What the context knows about one tracked instance.
pub(crate) struct Entry {
    pub object: Arc<dyn EntityObject>,
    pub state: LifecycleState,
    /// Whether the row exists (loaded, or written by an earlier flush)
    pub inserted: bool,
    /// Recorded database state; `None` until inserted
    pub snapshot: Option<Snapshot>,
    /// Persist order, used as the flush tie-breaker
    pub seq: u64,
}

/// Identity map, snapshots and unit of work over one executor.
pub struct PersistenceContext<E: Executor> {
    pub(crate) executor: E,
    pub(crate) model: Arc<Metamodel>,
    pub(crate) config: ContextConfig,
    pub(crate) events: ContextEventCallbacks,
    pub(crate) token: Arc<ContextToken>,
    pub(crate) identity: IdentityMap,
    pub(crate) entries: HashMap<ObjectId, Entry>,
    /// Instances this context has released
    pub(crate) detached: HashMap<ObjectId, Weak<dyn EntityObject>>,
    pub(crate) next_seq: u64,
    pub(crate) in_transaction: bool,
    pub(crate) closed: bool,
    /// Freshly hydrated instances waiting for their element collections
    /// and eager references
    pub(crate) loaded: VecDeque<Arc<dyn EntityObject>>,
}

impl<E: Executor> PersistenceContext<E> {
    /// Create a context with the default configuration.
    pub fn new(executor: E, model: impl Into<Arc<Metamodel>>) -> Self {
        Self::with_config(executor, model, ContextConfig::default())
    }

    /// Create a context with custom configuration.
    pub fn with_config(
        executor: E,
        model: impl Into<Arc<Metamodel>>,
        config: ContextConfig,
    ) -> Self {
        Self {
            executor,
            model: model.into(),
            config,
            events: ContextEventCallbacks::default(),
            token: ContextToken::new(),
            identity: IdentityMap::new(),
            entries: HashMap::new(),
            detached: HashMap::new(),
            next_seq: 0,
            in_transaction: false,
            closed: false,
            loaded: VecDeque::new(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.model
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Number of tracked instances, removed ones included.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::closed(operation));
        }
        Ok(())
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before every flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.register(ContextEvent::BeforeFlush, f);
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.register(ContextEvent::AfterFlush, f);
    }

    /// Register a callback to run before commit. An error aborts the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.register(ContextEvent::BeforeCommit, f);
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.register(ContextEvent::AfterCommit, f);
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.events.register(ContextEvent::AfterRollback, f);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(crate) fn object_state(&self, object: &Arc<dyn EntityObject>) -> LifecycleState {
        let id = ObjectId::of(object);
        if let Some(entry) = self.entries.get(&id) {
            return entry.state;
        }
        let released = self
            .detached
            .get(&id)
            .and_then(Weak::upgrade)
            .is_some_and(|o| ObjectId::of(&o) == id);
        if released {
            return LifecycleState::Detached;
        }
        // A generated key can only come from a database.
        let keyed = object.entity_id().is_some_and(|k| !k.is_null());
        if keyed && object.descriptor().id.is_generated() {
            return LifecycleState::Detached;
        }
        LifecycleState::Transient
    }

    /// The lifecycle state of `entity` relative to this context.
    pub fn state_of<T: Entity>(&self, entity: &Managed<T>) -> LifecycleState {
        self.object_state(&entity.erase())
    }

    /// Whether `entity` is managed (and not removed) by this context.
    pub fn contains<T: Entity>(&self, entity: &Managed<T>) -> bool {
        self.state_of(entity) == LifecycleState::Managed
    }

    /// Whether a reference or collection is loaded, without loading it.
    pub fn is_loaded(&self, relation: &impl Loadable) -> bool {
        relation.is_loaded()
    }

    /// Fail with `IdentityConflict` if a different instance holds `object`'s key.
    fn check_identity(&self, object: &Arc<dyn EntityObject>) -> Result<()> {
        let Some(key) = IdentityKey::of(object) else {
            return Ok(());
        };
        match self.identity.lookup(&key) {
            Some(existing) if ObjectId::of(&existing) != ObjectId::of(object) => {
                Err(Error::IdentityConflict(IdentityConflictError {
                    entity: key.entity,
                    key: key.key,
                }))
            }
            _ => Ok(()),
        }
    }

    /// Start tracking a transient instance as a pending insert.
    pub(crate) fn manage(&mut self, object: Arc<dyn EntityObject>) -> Result<()> {
        let descriptor = object.descriptor();
        match IdentityKey::of(&object) {
            Some(key) => self.identity.register(key, &object)?,
            None if !descriptor.id.is_generated() => {
                return Err(Error::mapping(
                    descriptor.name,
                    format!(
                        "assigned key '{}' must be set before persist",
                        descriptor.id.field
                    ),
                ));
            }
            None => {}
        }
        tracing::debug!(entity = descriptor.name, seq = self.next_seq, "Managing new instance");
        self.entries.insert(
            ObjectId::of(&object),
            Entry {
                object,
                state: LifecycleState::Managed,
                inserted: false,
                snapshot: None,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        Ok(())
    }

    /// Make `entity` managed, cascading along persist edges.
    ///
    /// Nothing is written until flush. Every reached instance is checked
    /// before any of them changes state, so a failed persist leaves the
    /// context untouched.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub fn persist<T: Entity>(&mut self, entity: &Managed<T>) -> Result<()> {
        self.ensure_open("persist")?;
        let reached = reachable(&entity.erase(), CascadeOp::Persist, &mut Visited::new());

        let mut plan = Vec::with_capacity(reached.len());
        for object in reached {
            let state = self.object_state(&object);
            transition(state, object.descriptor().name, LifecycleOp::Persist)?;
            if state == LifecycleState::Transient {
                self.check_identity(&object)?;
            }
            plan.push((object, state));
        }

        for (object, state) in plan {
            match state {
                LifecycleState::Transient => self.manage(object)?,
                LifecycleState::Removed => {
                    if let Some(entry) = self.entries.get_mut(&ObjectId::of(&object)) {
                        entry.state = LifecycleState::Managed;
                    }
                }
                LifecycleState::Managed | LifecycleState::Detached => {}
            }
        }
        Ok(())
    }

    /// Schedule `entity` for deletion, cascading along remove edges.
    ///
    /// An instance that was never flushed is simply forgotten; removing a
    /// transient instance does nothing.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub fn remove<T: Entity>(&mut self, entity: &Managed<T>) -> Result<()> {
        self.ensure_open("remove")?;
        let reached = reachable(&entity.erase(), CascadeOp::Remove, &mut Visited::new());

        let mut plan = Vec::with_capacity(reached.len());
        for object in reached {
            let state = self.object_state(&object);
            transition(state, object.descriptor().name, LifecycleOp::Remove)?;
            plan.push((object, state));
        }

        for (object, state) in plan {
            if state != LifecycleState::Managed {
                continue;
            }
            let id = ObjectId::of(&object);
            let inserted = self.entries.get(&id).is_some_and(|e| e.inserted);
            if inserted {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.state = LifecycleState::Removed;
                }
            } else {
                self.entries.remove(&id);
                if let Some(key) = IdentityKey::of(&object) {
                    self.identity.evict(&key, &object);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn release(&mut self, object: &Arc<dyn EntityObject>) {
        let id = ObjectId::of(object);
        self.entries.remove(&id);
        if let Some(key) = IdentityKey::of(object) {
            self.identity.evict(&key, object);
        }
        self.detached.insert(id, Arc::downgrade(object));
    }

    /// Stop tracking `entity`. Pending changes to it are discarded.
    pub fn detach<T: Entity>(&mut self, entity: &Managed<T>) -> Result<()> {
        self.ensure_open("detach")?;
        let object = entity.erase();
        let state = self.object_state(&object);
        transition(state, T::descriptor().name, LifecycleOp::Detach)?;
        if matches!(state, LifecycleState::Managed | LifecycleState::Removed) {
            self.release(&object);
            tracing::debug!(entity = T::descriptor().name, "Detached instance");
        }
        Ok(())
    }

    /// Detach everything. Lazy proxies created so far can no longer be
    /// resolved.
    pub fn clear(&mut self) {
        let released = self.entries.len();
        for (id, entry) in self.entries.drain() {
            self.detached.insert(id, Arc::downgrade(&entry.object));
        }
        self.detached.retain(|_, object| object.strong_count() > 0);
        self.identity.clear();
        self.loaded.clear();
        self.token.close();
        self.token = ContextToken::new();
        tracing::debug!(released, "Cleared persistence context");
    }

    /// Detach everything and invalidate the context. Idempotent; also run
    /// on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.in_transaction {
            tracing::warn!("Closing a persistence context with an open transaction");
        }
        self.clear();
        self.token.close();
        self.closed = true;
        tracing::debug!("Persistence context closed");
    }

    // ========================================================================
    // Dirty Checking
    // ========================================================================

    /// Whether a flush would write anything for `entity`.
    pub fn is_dirty<T: Entity>(&self, entity: &Managed<T>) -> Result<bool> {
        let object = entity.erase();
        let Some(entry) = self.entries.get(&ObjectId::of(&object)) else {
            return Ok(false);
        };
        match (&entry.snapshot, entry.state) {
            (_, LifecycleState::Removed) | (None, _) => Ok(true),
            (Some(snapshot), _) => Ok(snapshot.is_dirty(&ObjectState::capture(&*object)?)),
        }
    }

    /// Names of the fields, relations and element collections of `entity`
    /// that differ from its snapshot.
    pub fn changed_fields<T: Entity>(&self, entity: &Managed<T>) -> Result<Vec<&'static str>> {
        let object = entity.erase();
        let Some(snapshot) = self
            .entries
            .get(&ObjectId::of(&object))
            .and_then(|e| e.snapshot.as_ref())
        else {
            return Ok(Vec::new());
        };
        let current = ObjectState::capture(&*object)?;
        let changes = snapshot.diff(&current);
        let descriptor = object.descriptor();

        let mut names: Vec<&'static str> = Vec::new();
        if snapshot.key_changed(&current) {
            names.push(descriptor.id.field);
        }
        let columns = changes.tables.iter().flat_map(|t| t.columns.iter());
        for name in columns.filter_map(|column| field_for_column(descriptor, column)) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.extend(changes.collections.iter().map(|c| c.name));
        names.extend(changes.links.iter().map(|l| l.relation));
        Ok(names)
    }

    /// Whether the next flush has anything to write. Transient instances
    /// reachable through persist cascades are picked up first.
    pub(crate) fn has_pending_changes(&mut self) -> Result<bool> {
        self.cascade_pending()?;
        for entry in self.entries.values() {
            match (&entry.snapshot, entry.state) {
                (_, LifecycleState::Removed) | (None, _) => return Ok(true),
                (Some(snapshot), _) => {
                    if snapshot.is_dirty(&ObjectState::capture(&*entry.object)?) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Persist transient instances reachable from managed ones.
    pub(crate) fn cascade_pending(&mut self) -> Result<()> {
        let mut roots: Vec<(u64, Arc<dyn EntityObject>)> = self
            .entries
            .values()
            .filter(|e| e.state == LifecycleState::Managed)
            .map(|e| (e.seq, Arc::clone(&e.object)))
            .collect();
        roots.sort_by_key(|(seq, _)| *seq);

        let mut visited = Visited::new();
        let mut found = Vec::new();
        for (_, root) in roots {
            for object in reachable(&root, CascadeOp::Persist, &mut visited) {
                if self.object_state(&object) == LifecycleState::Transient {
                    found.push(object);
                }
            }
        }
        for object in found {
            if self.object_state(&object) == LifecycleState::Transient {
                self.check_identity(&object)?;
                self.manage(object)?;
            }
        }
        Ok(())
    }

    /// Owning edges of managed instances must not point at unmanaged
    /// instances that have no key.
    pub(crate) fn check_references(&self) -> Result<()> {
        for entry in self.entries.values() {
            if entry.state != LifecycleState::Managed {
                continue;
            }
            let descriptor = entry.object.descriptor();
            for view in entry.object.relations() {
                let owning = descriptor
                    .relationship(view.name)
                    .is_some_and(|r| r.is_owning() && r.writable);
                if !owning {
                    continue;
                }
                for target in view.state.targets() {
                    let tracked = self.entries.contains_key(&ObjectId::of(&target));
                    let keyed = target.entity_id().is_some_and(|k| !k.is_null());
                    if !tracked && !keyed {
                        return Err(Error::Lifecycle(LifecycleError {
                            entity: target.descriptor().name,
                            state: LifecycleState::Transient.name(),
                            operation: "flush a reference to",
                        }));
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction. A no-op if one is already open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        entkit_core::try_result!(self.ensure_open("begin"));
        if self.in_transaction {
            return Outcome::Ok(());
        }
        entkit_core::try_outcome!(self.executor.begin(cx).await);
        self.in_transaction = true;
        Outcome::Ok(())
    }

    /// Flush, then commit the open transaction.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        entkit_core::try_outcome!(self.flush(cx).await);
        entkit_core::try_result!(self.events.fire(ContextEvent::BeforeCommit));
        if self.in_transaction {
            entkit_core::try_outcome!(self.executor.commit(cx).await);
            self.in_transaction = false;
        }
        entkit_core::try_result!(self.events.fire(ContextEvent::AfterCommit));
        Outcome::Ok(())
    }

    /// Roll back the open transaction. With `detach_on_rollback` every
    /// instance is detached, since their in-memory state no longer matches
    /// the rows.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        entkit_core::try_result!(self.ensure_open("rollback"));
        if self.in_transaction {
            entkit_core::try_outcome!(self.executor.rollback(cx).await);
            self.in_transaction = false;
        }
        if self.config.detach_on_rollback {
            self.clear();
        }
        entkit_core::try_result!(self.events.fire(ContextEvent::AfterRollback));
        Outcome::Ok(())
    }

    /// Proxies may only be resolved through the open context that made them.
    pub(crate) fn check_loader(&self, loader: &LoaderHandle, operation: &'static str) -> Result<()> {
        self.ensure_open(operation)?;
        let detail = if !loader.is_open() {
            "the context that created this proxy is closed"
        } else if !loader.belongs_to(&self.token) {
            "the proxy belongs to another context"
        } else {
            return Ok(());
        };
        Err(Error::ContextClosed(ContextClosedError {
            operation,
            detail: Some(detail.to_string()),
        }))
    }

    /// Record the link rows of an owning many-to-many edge as loaded.
    pub(crate) fn record_links(
        &mut self,
        owner: &Arc<dyn EntityObject>,
        relation: &'static RelationshipInfo,
        targets: &[Arc<dyn EntityObject>],
    ) {
        if relation.join_table.is_none() {
            return;
        }
        if let Some(snapshot) = self
            .entries
            .get_mut(&ObjectId::of(owner))
            .and_then(|e| e.snapshot.as_mut())
        {
            let keys = targets
                .iter()
                .map(|t| t.entity_id().unwrap_or(entkit_core::Value::Null))
                .collect();
            snapshot.set_links(relation.name, keys);
        }
    }
}

/// The field or relation name that owns `column`.
fn field_for_column(descriptor: &EntityDescriptor, column: &str) -> Option<&'static str> {
    if let Some(field) = descriptor.fields.iter().find(|f| f.column == column) {
        return Some(field.name);
    }
    if let Some(embedded) = descriptor
        .embedded
        .iter()
        .find(|e| e.fields.iter().any(|f| f.column == column))
    {
        return Some(embedded.name);
    }
    let subtype_field = descriptor
        .inheritance
        .iter()
        .flat_map(|i| i.subtypes.iter())
        .flat_map(|s| s.fields.iter())
        .find(|f| f.column == column);
    if let Some(field) = subtype_field {
        return Some(field.name);
    }
    descriptor
        .foreign_keys()
        .find(|r| r.join_column == Some(column))
        .map(|r| r.name)
}

impl<E: Executor> Drop for PersistenceContext<E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: Executor> std::fmt::Debug for PersistenceContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("tracked", &self.entries.len())
            .field("identity", &self.identity.len())
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.closed)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: Executor> Hydrator for PersistenceContext<E> {
    fn hydrate(
        &mut self,
        descriptor: &'static EntityDescriptor,
        row: &EntityRow,
    ) -> Result<Hydrated> {
        let key = IdentityKey::new(descriptor, row.key.clone());
        if let Some(existing) = self.identity.lookup(&key) {
            let removed = self
                .entries
                .get(&ObjectId::of(&existing))
                .is_some_and(|e| e.state == LifecycleState::Removed);
            return Ok(if removed {
                Hydrated::Excluded
            } else {
                Hydrated::Instance(existing)
            });
        }

        let scope = HydrateScope::new(
            descriptor,
            row.subtype,
            LoaderHandle::new(Arc::clone(&self.token)),
        );
        let object = (descriptor.factory)(&row.row, &scope)?;
        self.identity.register(key, &object)?;
        let snapshot = Snapshot::new(ObjectState::capture(&*object)?);
        self.entries.insert(
            ObjectId::of(&object),
            Entry {
                object: Arc::clone(&object),
                state: LifecycleState::Managed,
                inserted: true,
                snapshot: Some(snapshot),
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        self.loaded.push_back(Arc::clone(&object));
        tracing::trace!(entity = descriptor.name, key = %row.key, "Hydrated instance");
        Ok(Hydrated::Instance(object))
    }

    fn attach(
        &mut self,
        owner: &Arc<dyn EntityObject>,
        relation: &'static RelationshipInfo,
        value: RelationValue,
    ) -> Result<()> {
        // A relation the caller already holds in memory is not overwritten.
        let loaded = owner
            .relations()
            .into_iter()
            .find(|v| v.name == relation.name)
            .is_some_and(|v| v.state.is_loaded());
        if loaded {
            return Ok(());
        }
        let targets = match &value {
            RelationValue::Many(targets) => Some(targets.clone()),
            RelationValue::One(_) => None,
        };
        owner.attach(relation.name, value)?;
        if let Some(targets) = targets {
            self.record_links(owner, relation, &targets);
        }
        Ok(())
    }
}

impl<E: Executor> QuerySession for PersistenceContext<E> {
    type Exec = E;

    fn metamodel(&self) -> &Metamodel {
        &self.model
    }

    fn executor(&self) -> &E {
        &self.executor
    }

    fn before_statement(
        &mut self,
        cx: &Cx,
        operation: &'static str,
    ) -> impl Future<Output = Outcome<(), Error>> {
        async move {
            entkit_core::try_result!(self.ensure_open(operation));
            if self.config.auto_flush && entkit_core::try_result!(self.has_pending_changes()) {
                tracing::debug!(operation, "Auto-flushing before statement");
                entkit_core::try_outcome!(self.flush(cx).await);
            }
            Outcome::Ok(())
        }
    }

    fn after_load(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> {
        self.settle(cx)
    }

    fn after_bulk(&mut self, affected: u64) {
        tracing::debug!(affected, "Bulk statement bypassed the identity map");
        if self.config.clear_after_bulk {
            self.clear();
        }
    }

    fn removed_keys(&self, entity: &'static EntityDescriptor) -> Vec<entkit_core::Value> {
        self.entries
            .values()
            .filter(|e| e.state == LifecycleState::Removed && e.inserted)
            .filter(|e| e.object.descriptor().name == entity.name)
            .filter_map(|e| e.snapshot.as_ref().map(|s| s.key().clone()))
            .collect()
    }
}

