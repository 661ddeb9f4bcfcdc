//! Loading through the context: find, proxy resolution, refresh.
//!
//! Every instance that enters the context through a query is queued in
//! `loaded`; [`PersistenceContext::settle`] then fills its element
//! collections and eager to-one references and re-takes its snapshot, so
//! the recorded state matches what was read.

use crate::cascade::{Visited, reachable};
use crate::change_tracker::{ObjectState, Snapshot};
use crate::context::PersistenceContext;
use crate::identity_map::IdentityKey;
use crate::state::LifecycleState;
use entkit_core::{
    CascadeOp, Collection, Cx, Entity, EntityDescriptor, EntityObject, Error, FetchType,
    HydrateScope, LifecycleError, LoaderHandle, Lookup, Managed, NotFoundError, ObjectId, Outcome,
    Ref, RelationState, RelationValue, RelationshipInfo, Result, Value,
};
use entkit_query::{
    Executor, Expr, Hydrator, JoinEdge, JoinKind, JoinSpec, PlanColumn, Projection, QuerySpec,
    SelectPlan, Source, Statement, TableRef, TupleItem, compile, materialize, query,
};
use std::sync::Arc;

/// `alias` over `entity`, projected whole.
fn entity_spec(entity: &'static EntityDescriptor, alias: &str) -> QuerySpec {
    let source = Source {
        entity,
        alias: alias.to_string(),
    };
    QuerySpec {
        from: Some(source.clone()),
        projections: vec![Projection::Entity(source)],
        ..QuerySpec::default()
    }
}

/// The targets of `relation` for the owner keyed `owner_key`, in key order.
fn relation_spec(
    owner: &'static EntityDescriptor,
    owner_key: Value,
    relation: &RelationshipInfo,
    target: &'static EntityDescriptor,
) -> QuerySpec {
    let target = Source {
        entity: target,
        alias: "t".to_string(),
    };
    QuerySpec {
        from: Some(Source {
            entity: owner,
            alias: "o".to_string(),
        }),
        projections: vec![Projection::Entity(target.clone())],
        joins: vec![JoinSpec {
            kind: JoinKind::Inner,
            target: target.clone(),
            edge: JoinEdge::Relation {
                owner: "o".to_string(),
                relation: relation.name.to_string(),
            },
            fetch: false,
            on: None,
        }],
        filters: vec![Expr::path("o", owner.id.field).eq(Expr::lit(owner_key))],
        order_by: vec![Expr::path("t", target.entity.id.field).asc()],
        ..QuerySpec::default()
    }
}

/// The row of `descriptor` keyed `key`.
fn key_spec(descriptor: &'static EntityDescriptor, key: Value) -> QuerySpec {
    let mut spec = entity_spec(descriptor, "e");
    spec.filters
        .push(Expr::path("e", descriptor.id.field).eq(Expr::lit(key)));
    spec
}

fn not_found(descriptor: &EntityDescriptor, key: Value) -> Error {
    Error::NotFound(NotFoundError {
        entity: descriptor.name,
        key,
    })
}

impl<E: Executor> PersistenceContext<E> {
    /// Run `spec` and return the instances in its first position.
    async fn load_entities(
        &mut self,
        cx: &Cx,
        spec: &QuerySpec,
    ) -> Outcome<Vec<Arc<dyn EntityObject>>, Error> {
        let compiled = entkit_core::try_result!(compile(spec, &self.model));
        let statement = Statement::Select(compiled.plan.clone());
        let rows = entkit_core::try_outcome!(query(&self.executor, cx, &statement).await);
        let tuples = entkit_core::try_result!(materialize(&compiled, &rows, self));
        let found = tuples
            .into_iter()
            .filter_map(|tuple| match tuple.into_items().into_iter().next() {
                Some(TupleItem::Entity(Some(object))) => Some(object),
                _ => None,
            })
            .collect();
        Outcome::Ok(found)
    }

    /// The instance keyed `key`, from the identity map or the database.
    /// Instances scheduled for removal are not returned.
    pub(crate) async fn load_by_key(
        &mut self,
        cx: &Cx,
        descriptor: &'static EntityDescriptor,
        key: Value,
    ) -> Outcome<Option<Arc<dyn EntityObject>>, Error> {
        if let Some(existing) = self.identity.lookup(&IdentityKey::new(descriptor, key.clone())) {
            let removed = self
                .entries
                .get(&ObjectId::of(&existing))
                .is_some_and(|e| e.state == LifecycleState::Removed);
            return Outcome::Ok((!removed).then_some(existing));
        }
        let found = entkit_core::try_outcome!(self.load_entities(cx, &key_spec(descriptor, key)).await);
        Outcome::Ok(found.into_iter().next())
    }

    /// Drain the queue of freshly hydrated instances: load their element
    /// collections and eager references, then re-take their snapshots.
    pub(crate) async fn settle(&mut self, cx: &Cx) -> Outcome<(), Error> {
        while let Some(object) = self.loaded.pop_front() {
            let id = ObjectId::of(&object);
            if !self.entries.contains_key(&id) {
                continue;
            }
            let descriptor = object.descriptor();
            let Some(key) = object.entity_id() else {
                continue;
            };

            for info in descriptor.value_collections {
                let mut plan = SelectPlan::new(TableRef::new(info.table, "c"));
                plan.projections = info
                    .columns()
                    .map(|column| PlanColumn {
                        expr: Expr::qualified("c", column),
                        label: column.to_string(),
                    })
                    .collect();
                plan.filter = Some(Expr::qualified("c", info.owner_column).eq(Expr::lit(key.clone())));
                let rows =
                    entkit_core::try_outcome!(query(&self.executor, cx, &Statement::Select(plan)).await);
                entkit_core::try_result!(object.load_value_collection(info.name, &rows));
            }

            for view in object.relations() {
                let Some(relation) = descriptor.relationship(view.name) else {
                    continue;
                };
                if relation.fetch != FetchType::Eager || !relation.kind.is_singular() {
                    continue;
                }
                let RelationState::Unloaded(Some(target_key)) = view.state else {
                    continue;
                };
                let target_descriptor = entkit_core::try_result!(self.model.require(relation.target));
                let target =
                    entkit_core::try_outcome!(self.load_by_key(cx, target_descriptor, target_key).await);
                entkit_core::try_result!(object.attach(relation.name, RelationValue::One(target)));
            }

            let state = entkit_core::try_result!(ObjectState::capture(&*object));
            if let Some(entry) = self.entries.get_mut(&id) {
                let links = entry.snapshot.as_ref().map(|s| s.state().links.clone());
                let mut snapshot = Snapshot::new(state);
                for (relation, keys) in links.into_iter().flatten() {
                    if snapshot.state().links(relation).is_none() {
                        snapshot.set_links(relation, keys);
                    }
                }
                entry.snapshot = Some(snapshot);
            }
        }
        Outcome::Ok(())
    }

    /// Find an instance by key. A hit in the identity map returns the
    /// managed instance without touching the database.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub async fn find<T: Entity>(
        &mut self,
        cx: &Cx,
        key: impl Into<Value>,
    ) -> Outcome<Option<Managed<T>>, Error> {
        entkit_core::try_result!(self.ensure_open("find"));
        let found = entkit_core::try_outcome!(self.load_by_key(cx, T::descriptor(), key.into()).await);
        entkit_core::try_outcome!(self.settle(cx).await);
        match found {
            Some(object) => Outcome::Ok(Some(entkit_core::try_result!(Managed::from_erased(object)))),
            None => Outcome::Ok(None),
        }
    }

    /// Like [`find`](Self::find), but a missing row is a `NotFound` error.
    pub async fn get<T: Entity>(&mut self, cx: &Cx, key: impl Into<Value>) -> Outcome<Managed<T>, Error> {
        let key = key.into();
        match entkit_core::try_outcome!(self.find::<T>(cx, key.clone()).await) {
            Some(found) => Outcome::Ok(found),
            None => Outcome::Err(not_found(T::descriptor(), key)),
        }
    }

    /// A reference to the row keyed `key` without loading it. The target
    /// is loaded on first [`resolve`](Self::resolve); a missing row then
    /// fails with `NotFound`.
    pub fn get_reference<T: Entity>(&mut self, key: impl Into<Value>) -> Result<Ref<T>> {
        self.ensure_open("get_reference")?;
        let key = key.into();
        if let Some(existing) = self.identity.lookup(&IdentityKey::new(T::descriptor(), key.clone())) {
            return Ok(Ref::Resolved(Managed::from_erased(existing)?));
        }
        let scope = HydrateScope::new(
            T::descriptor(),
            None,
            LoaderHandle::new(Arc::clone(&self.token)),
        );
        Ok(scope.reference(key))
    }

    /// Load the target of a lazy reference through this context.
    ///
    /// Fails with `ContextClosed` if the proxy was created by another
    /// context, or by this one before it was cleared or closed.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub async fn resolve<T: Entity>(
        &mut self,
        cx: &Cx,
        reference: &Ref<T>,
    ) -> Outcome<Option<Managed<T>>, Error> {
        let proxy = match reference {
            Ref::Null => return Outcome::Ok(None),
            Ref::Resolved(target) => return Outcome::Ok(Some(target.clone())),
            Ref::Unresolved(proxy) => proxy,
        };
        if proxy.is_resolved() {
            return Outcome::Ok(proxy.get());
        }
        entkit_core::try_result!(self.check_loader(proxy.loader(), "resolve"));

        let found = match proxy.lookup() {
            Lookup::Key(key) => {
                let cached = self.identity.lookup(&IdentityKey::new(T::descriptor(), key.clone()));
                let found = match cached {
                    Some(existing) => Some(existing),
                    None => entkit_core::try_outcome!(
                        self.load_entities(cx, &key_spec(T::descriptor(), key.clone())).await
                    )
                    .into_iter()
                    .next(),
                };
                match found {
                    Some(object) => object,
                    None => return Outcome::Err(not_found(T::descriptor(), key.clone())),
                }
            }
            Lookup::Inverse {
                relation,
                owner_key,
            } => {
                let (target, owning) = entkit_core::try_result!(self.model.owning_side(relation));
                let mut spec = entity_spec(target, "e");
                spec.filters
                    .push(Expr::path("e", owning.name).eq(Expr::lit(owner_key.clone())));
                let found = entkit_core::try_outcome!(self.load_entities(cx, &spec).await);
                match found.into_iter().next() {
                    Some(object) => object,
                    None => return Outcome::Ok(proxy.fill(None)),
                }
            }
        };
        entkit_core::try_outcome!(self.settle(cx).await);
        let target = entkit_core::try_result!(Managed::from_erased(found));
        Outcome::Ok(proxy.fill(Some(target)))
    }

    /// Load the contents of a lazy collection through this context, in key
    /// order.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub async fn resolve_collection<T: Entity>(
        &mut self,
        cx: &Cx,
        collection: &Collection<T>,
    ) -> Outcome<Vec<Managed<T>>, Error> {
        let proxy = match collection {
            Collection::Resolved(items) => return Outcome::Ok(items.clone()),
            Collection::Unresolved(proxy) => proxy,
        };
        if proxy.is_resolved() {
            return Outcome::Ok(proxy.fill(Vec::new()));
        }
        entkit_core::try_result!(self.check_loader(proxy.loader(), "resolve_collection"));

        let owner = proxy.owner();
        let relation = proxy.relation();
        let spec = relation_spec(owner, proxy.owner_key().clone(), relation, T::descriptor());
        let found = entkit_core::try_outcome!(self.load_entities(cx, &spec).await);
        entkit_core::try_outcome!(self.settle(cx).await);

        let mut items = Vec::with_capacity(found.len());
        for object in &found {
            items.push(entkit_core::try_result!(Managed::from_erased(Arc::clone(object))));
        }
        let items = proxy.fill(items);
        let owner_key = IdentityKey::new(owner, proxy.owner_key().clone());
        if let Some(owner) = self.identity.lookup(&owner_key) {
            self.record_links(&owner, relation, &found);
        }
        tracing::debug!(relation = relation.name, count = items.len(), "Resolved collection");
        Outcome::Ok(items)
    }

    /// Load the unresolved targets of `relation` on a written `owner`.
    async fn load_relation(
        &mut self,
        cx: &Cx,
        owner: &Arc<dyn EntityObject>,
        relation: &'static RelationshipInfo,
        target_key: Option<Value>,
    ) -> Outcome<RelationValue, Error> {
        let target = entkit_core::try_result!(self.model.require(relation.target));
        if let Some(key) = target_key {
            let found = entkit_core::try_outcome!(self.load_by_key(cx, target, key).await);
            return Outcome::Ok(RelationValue::One(found));
        }
        let Some(owner_key) = owner.entity_id() else {
            return Outcome::Ok(if relation.kind.is_singular() {
                RelationValue::One(None)
            } else {
                RelationValue::Many(Vec::new())
            });
        };
        let spec = relation_spec(owner.descriptor(), owner_key, relation, target);
        let found = entkit_core::try_outcome!(self.load_entities(cx, &spec).await);
        Outcome::Ok(if relation.kind.is_singular() {
            RelationValue::One(found.into_iter().next())
        } else {
            RelationValue::Many(found)
        })
    }

    /// Removal cascades into targets that were never loaded. Before the
    /// deletes are ordered, load those targets and schedule them as well,
    /// so dependent rows are deleted with the rows they reference.
    pub(crate) async fn cascade_removals(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut queue: Vec<Arc<dyn EntityObject>> = self
            .entries
            .values()
            .filter(|e| e.state == LifecycleState::Removed && e.inserted)
            .map(|e| Arc::clone(&e.object))
            .collect();
        let mut visited = Visited::new();
        let mut loaded = 0_usize;

        while let Some(object) = queue.pop() {
            if !visited.insert(&object) {
                continue;
            }
            let descriptor = object.descriptor();
            for view in object.relations() {
                let Some(relation) = descriptor.relationship(view.name) else {
                    continue;
                };
                if !relation.cascade.includes(CascadeOp::Remove) {
                    continue;
                }
                let targets = match view.state {
                    RelationState::Unloaded(target_key) => {
                        let value = entkit_core::try_outcome!(
                            self.load_relation(cx, &object, relation, target_key).await
                        );
                        let targets = match &value {
                            RelationValue::One(target) => target.iter().cloned().collect(),
                            RelationValue::Many(targets) => targets.clone(),
                        };
                        entkit_core::try_result!(Hydrator::attach(self, &object, relation, value));
                        loaded += targets.len();
                        targets
                    }
                    state => state.targets(),
                };
                for target in targets {
                    let id = ObjectId::of(&target);
                    let Some(entry) = self.entries.get(&id) else {
                        continue;
                    };
                    match (entry.state, entry.inserted) {
                        (LifecycleState::Managed, true) => {
                            if let Some(entry) = self.entries.get_mut(&id) {
                                entry.state = LifecycleState::Removed;
                            }
                            queue.push(target);
                        }
                        (LifecycleState::Managed, false) => {
                            self.entries.remove(&id);
                            if let Some(key) = IdentityKey::of(&target) {
                                self.identity.evict(&key, &target);
                            }
                        }
                        (LifecycleState::Removed, _) => queue.push(target),
                        _ => {}
                    }
                }
            }
        }
        entkit_core::try_outcome!(self.settle(cx).await);
        if loaded > 0 {
            tracing::debug!(loaded, "Loaded targets of removal cascades");
        }
        Outcome::Ok(())
    }

    /// Overwrite `entity` (and instances reachable along refresh cascades)
    /// with the database state. Pending changes to them are discarded.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = T::descriptor().name))]
    pub async fn refresh<T: Entity>(&mut self, cx: &Cx, entity: &Managed<T>) -> Outcome<(), Error> {
        entkit_core::try_result!(self.ensure_open("refresh"));
        let root = entity.erase();
        let state = self.object_state(&root);
        let inserted = self
            .entries
            .get(&ObjectId::of(&root))
            .is_some_and(|e| e.inserted);
        if state != LifecycleState::Managed || !inserted {
            return Outcome::Err(Error::Lifecycle(LifecycleError {
                entity: T::descriptor().name,
                state: state.name(),
                operation: "refresh",
            }));
        }

        for object in reachable(&root, CascadeOp::Refresh, &mut Visited::new()) {
            let id = ObjectId::of(&object);
            let tracked = self
                .entries
                .get(&id)
                .is_some_and(|e| e.inserted && e.state == LifecycleState::Managed);
            if !tracked {
                continue;
            }
            let descriptor = object.descriptor();
            let Some(key) = object.entity_id() else {
                continue;
            };

            let compiled = entkit_core::try_result!(compile(&key_spec(descriptor, key.clone()), &self.model));
            let statement = Statement::Select(compiled.plan.clone());
            let rows = entkit_core::try_outcome!(query(&self.executor, cx, &statement).await);
            let read = match (rows.first(), compiled.segments.first()) {
                (Some(row), Some(segment)) => {
                    entkit_core::try_result!(segment.layout.read(row, segment.start))
                }
                _ => None,
            };
            let Some(read) = read else {
                return Outcome::Err(not_found(descriptor, key));
            };

            let scope = HydrateScope::new(
                descriptor,
                read.subtype,
                LoaderHandle::new(Arc::clone(&self.token)),
            );
            let fresh = entkit_core::try_result!((descriptor.factory)(&read.row, &scope));
            entkit_core::try_result!(object.replace_with(fresh));
            let snapshot = Snapshot::new(entkit_core::try_result!(ObjectState::capture(&*object)));
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.snapshot = Some(snapshot);
            }
            self.loaded.push_back(object);
            tracing::debug!(entity = descriptor.name, key = %key, "Refreshed");
        }
        self.settle(cx).await
    }
}
