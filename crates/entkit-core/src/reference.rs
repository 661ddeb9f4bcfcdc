//! Relationship references and lazy proxies.
//!
//! A to-one relationship field is a [`Ref<T>`], a to-many field a
//! [`Collection<T>`]. Both are explicit sum types: either the target is
//! already resolved, or the field holds a proxy that knows how to find it
//! (the key, or the owner key for collections) plus a [`LoaderHandle`] tying
//! it to the context that created it.
//!
//! Proxies never perform I/O on their own. Resolution goes through the
//! owning context; the loaded value is cached in a cell shared by every
//! clone of the proxy, so resolving a clone also resolves the original
//! field.

use crate::Result;
use crate::descriptor::EntityDescriptor;
use crate::entity::{Entity, Managed, RelationState, RelationValue, RelationView};
use crate::error::{Error, LifecycleError};
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness marker shared between a context and the proxies it creates.
#[derive(Debug)]
pub struct ContextToken {
    id: u64,
    open: AtomicBool,
}

impl ContextToken {
    /// A fresh, open token.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Invalidate every proxy created under this token.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Handle a proxy uses to find its context again.
#[derive(Clone)]
pub struct LoaderHandle {
    token: Arc<ContextToken>,
}

impl LoaderHandle {
    pub fn new(token: Arc<ContextToken>) -> Self {
        Self { token }
    }

    /// A handle whose context is already gone.
    pub fn detached() -> Self {
        let token = ContextToken::new();
        token.close();
        Self { token }
    }

    pub fn context_id(&self) -> u64 {
        self.token.id
    }

    pub fn is_open(&self) -> bool {
        self.token.is_open()
    }

    /// Whether this handle was issued by the context owning `token`.
    pub fn belongs_to(&self, token: &ContextToken) -> bool {
        self.token.id == token.id
    }
}

impl fmt::Debug for LoaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderHandle")
            .field("context", &self.token.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// How an unresolved to-one proxy finds its target.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// By the target's primary key (owning side)
    Key(Value),
    /// By the owner's key through the owning relationship on the target
    /// (inverse one-to-one)
    Inverse {
        relation: &'static RelationshipInfo,
        owner_key: Value,
    },
}

/// An unresolved to-one reference.
pub struct Proxy<T: Entity> {
    lookup: Lookup,
    loader: LoaderHandle,
    cell: Arc<OnceLock<Option<Managed<T>>>>,
}

impl<T: Entity> Proxy<T> {
    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    /// The target key, for owning-side proxies.
    pub fn key(&self) -> Option<&Value> {
        match &self.lookup {
            Lookup::Key(key) => Some(key),
            Lookup::Inverse { .. } => None,
        }
    }

    pub fn loader(&self) -> &LoaderHandle {
        &self.loader
    }

    /// Whether a load has completed (possibly finding nothing).
    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The loaded target, if resolved.
    pub fn get(&self) -> Option<Managed<T>> {
        self.cell.get().cloned().flatten()
    }

    /// Store the loaded target. A second fill keeps the first value.
    pub fn fill(&self, target: Option<Managed<T>>) -> Option<Managed<T>> {
        self.cell.get_or_init(|| target).clone()
    }
}

impl<T: Entity> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        Self {
            lookup: self.lookup.clone(),
            loader: self.loader.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

/// A to-one relationship field.
pub enum Ref<T: Entity> {
    /// No target (NULL foreign key)
    Null,
    /// Target instance present
    Resolved(Managed<T>),
    /// Lazy proxy
    Unresolved(Proxy<T>),
}

impl<T: Entity> Ref<T> {
    /// The target key, when known without loading.
    pub fn key(&self) -> Option<Value> {
        match self {
            Ref::Null => None,
            Ref::Resolved(target) => target.id(),
            Ref::Unresolved(proxy) => match proxy.get() {
                Some(target) => target.id(),
                None => proxy.key().cloned(),
            },
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Ref::Null)
    }

    /// The target if it is available without I/O.
    pub fn get(&self) -> Option<Managed<T>> {
        match self {
            Ref::Null => None,
            Ref::Resolved(target) => Some(target.clone()),
            Ref::Unresolved(proxy) => proxy.get(),
        }
    }

    pub fn proxy(&self) -> Option<&Proxy<T>> {
        match self {
            Ref::Unresolved(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Current state, for cascades and the flush.
    pub fn view(&self, name: &'static str) -> RelationView {
        let state = match self {
            Ref::Null => RelationState::Null,
            Ref::Resolved(target) => RelationState::One(target.erase()),
            Ref::Unresolved(proxy) => match proxy.cell.get() {
                Some(Some(target)) => RelationState::One(target.erase()),
                Some(None) => RelationState::Null,
                None => RelationState::Unloaded(proxy.key().cloned()),
            },
        };
        RelationView { name, state }
    }

    /// Replace the field with a loaded target.
    pub fn attach(&mut self, value: RelationValue) -> Result<()> {
        *self = match value {
            RelationValue::One(Some(target)) => Ref::Resolved(Managed::from_erased(target)?),
            RelationValue::One(None) => Ref::Null,
            RelationValue::Many(_) => {
                return Err(Error::mapping(
                    T::descriptor().name,
                    "a to-one reference cannot hold a collection",
                ));
            }
        };
        Ok(())
    }
}

impl<T: Entity> Default for Ref<T> {
    fn default() -> Self {
        Ref::Null
    }
}

impl<T: Entity> Clone for Ref<T> {
    fn clone(&self) -> Self {
        match self {
            Ref::Null => Ref::Null,
            Ref::Resolved(target) => Ref::Resolved(target.clone()),
            Ref::Unresolved(proxy) => Ref::Unresolved(proxy.clone()),
        }
    }
}

impl<T: Entity> From<Managed<T>> for Ref<T> {
    fn from(target: Managed<T>) -> Self {
        Ref::Resolved(target)
    }
}

impl<T: Entity> From<&Managed<T>> for Ref<T> {
    fn from(target: &Managed<T>) -> Self {
        Ref::Resolved(target.clone())
    }
}

impl<T: Entity> From<Option<Managed<T>>> for Ref<T> {
    fn from(target: Option<Managed<T>>) -> Self {
        target.map_or(Ref::Null, Ref::Resolved)
    }
}

impl<T: Entity> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Null => f.write_str("Ref::Null"),
            Ref::Resolved(target) => write!(f, "Ref::Resolved({:?})", target.id()),
            Ref::Unresolved(proxy) => f
                .debug_struct("Ref::Unresolved")
                .field("lookup", &proxy.lookup)
                .field("resolved", &proxy.is_resolved())
                .finish(),
        }
    }
}

/// An unresolved to-many relationship.
pub struct CollectionProxy<T: Entity> {
    owner: &'static EntityDescriptor,
    relation: &'static RelationshipInfo,
    owner_key: Value,
    loader: LoaderHandle,
    cell: Arc<OnceLock<Vec<Managed<T>>>>,
}

impl<T: Entity> CollectionProxy<T> {
    pub fn owner(&self) -> &'static EntityDescriptor {
        self.owner
    }

    pub fn relation(&self) -> &'static RelationshipInfo {
        self.relation
    }

    pub fn owner_key(&self) -> &Value {
        &self.owner_key
    }

    pub fn loader(&self) -> &LoaderHandle {
        &self.loader
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Store the loaded elements. A second fill keeps the first value.
    pub fn fill(&self, items: Vec<Managed<T>>) -> Vec<Managed<T>> {
        self.cell.get_or_init(|| items).clone()
    }
}

impl<T: Entity> Clone for CollectionProxy<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            relation: self.relation,
            owner_key: self.owner_key.clone(),
            loader: self.loader.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

/// A to-many relationship field.
pub enum Collection<T: Entity> {
    Resolved(Vec<Managed<T>>),
    Unresolved(CollectionProxy<T>),
}

impl<T: Entity> Collection<T> {
    /// An empty, loaded collection (new owners start here).
    pub fn new() -> Self {
        Collection::Resolved(Vec::new())
    }

    /// The elements if loaded.
    pub fn items(&self) -> Option<&[Managed<T>]> {
        match self {
            Collection::Resolved(items) => Some(items),
            Collection::Unresolved(proxy) => proxy.cell.get().map(Vec::as_slice),
        }
    }

    /// Number of elements if loaded.
    pub fn len(&self) -> Option<usize> {
        self.items().map(<[Managed<T>]>::len)
    }

    pub fn proxy(&self) -> Option<&CollectionProxy<T>> {
        match self {
            Collection::Unresolved(proxy) => Some(proxy),
            Collection::Resolved(_) => None,
        }
    }

    /// Add an element. The collection must be loaded.
    pub fn push(&mut self, item: Managed<T>) -> Result<()> {
        self.loaded_mut("add to")?.push(item);
        Ok(())
    }

    /// Remove an element by identity. Returns whether it was present.
    pub fn remove(&mut self, item: &Managed<T>) -> Result<bool> {
        let items = self.loaded_mut("remove from")?;
        let before = items.len();
        items.retain(|existing| !existing.ptr_eq(item));
        Ok(items.len() != before)
    }

    fn loaded_mut(&mut self, operation: &'static str) -> Result<&mut Vec<Managed<T>>> {
        if let Collection::Unresolved(proxy) = self {
            let Some(items) = proxy.cell.get() else {
                return Err(Error::Lifecycle(LifecycleError {
                    entity: T::descriptor().name,
                    state: "unloaded collection",
                    operation,
                }));
            };
            *self = Collection::Resolved(items.clone());
        }
        match self {
            Collection::Resolved(items) => Ok(items),
            Collection::Unresolved(_) => Err(Error::Custom("collection not loaded".into())),
        }
    }

    /// Current state, for cascades and the flush.
    pub fn view(&self, name: &'static str) -> RelationView {
        let state = match self.items() {
            Some(items) => RelationState::Many(items.iter().map(Managed::erase).collect()),
            None => RelationState::Unloaded(None),
        };
        RelationView { name, state }
    }

    /// Replace the field with loaded elements.
    pub fn attach(&mut self, value: RelationValue) -> Result<()> {
        let RelationValue::Many(items) = value else {
            return Err(Error::mapping(
                T::descriptor().name,
                "a collection cannot hold a single reference",
            ));
        };
        let items = items
            .into_iter()
            .map(Managed::from_erased)
            .collect::<Result<Vec<_>>>()?;
        *self = Collection::Resolved(items);
        Ok(())
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for Collection<T> {
    fn clone(&self) -> Self {
        match self {
            Collection::Resolved(items) => Collection::Resolved(items.clone()),
            Collection::Unresolved(proxy) => Collection::Unresolved(proxy.clone()),
        }
    }
}

impl<T: Entity> From<Vec<Managed<T>>> for Collection<T> {
    fn from(items: Vec<Managed<T>>) -> Self {
        Collection::Resolved(items)
    }
}

impl<T: Entity> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.items() {
            Some(items) => write!(f, "Collection({} items)", items.len()),
            None => f.write_str("Collection(unloaded)"),
        }
    }
}

/// Introspect a relationship field without loading it.
pub trait Loadable {
    fn is_loaded(&self) -> bool;
}

impl<T: Entity> Loadable for Ref<T> {
    fn is_loaded(&self) -> bool {
        match self {
            Ref::Null | Ref::Resolved(_) => true,
            Ref::Unresolved(proxy) => proxy.is_resolved(),
        }
    }
}

impl<T: Entity> Loadable for Collection<T> {
    fn is_loaded(&self) -> bool {
        self.items().is_some()
    }
}

/// Context handed to [`Entity::from_row`] for building relationship fields.
#[derive(Debug, Clone)]
pub struct HydrateScope {
    entity: &'static EntityDescriptor,
    subtype: Option<&'static str>,
    loader: LoaderHandle,
}

impl HydrateScope {
    pub fn new(
        entity: &'static EntityDescriptor,
        subtype: Option<&'static str>,
        loader: LoaderHandle,
    ) -> Self {
        Self {
            entity,
            subtype,
            loader,
        }
    }

    /// A scope with no live context; proxies it creates cannot be resolved.
    pub fn detached(entity: &'static EntityDescriptor) -> Self {
        Self::new(entity, None, LoaderHandle::detached())
    }

    /// Same scope for a specific subtype.
    pub fn with_subtype(mut self, subtype: Option<&'static str>) -> Self {
        self.subtype = subtype;
        self
    }

    pub fn entity(&self) -> &'static EntityDescriptor {
        self.entity
    }

    /// The concrete subtype resolved from the discriminator or joined rows.
    pub fn subtype(&self) -> Option<&'static str> {
        self.subtype
    }

    pub fn loader(&self) -> &LoaderHandle {
        &self.loader
    }

    fn relation(&self, name: &str) -> Result<&'static RelationshipInfo> {
        self.entity
            .relationship(name)
            .ok_or_else(|| crate::entity::unknown_relation(self.entity.name, name))
    }

    /// A lazy reference to the target with key `key` (`Null` for NULL).
    pub fn reference<T: Entity>(&self, key: Value) -> Ref<T> {
        if key.is_null() {
            return Ref::Null;
        }
        Ref::Unresolved(Proxy {
            lookup: Lookup::Key(key),
            loader: self.loader.clone(),
            cell: Arc::new(OnceLock::new()),
        })
    }

    /// A lazy reference built from the FK column of owning relation
    /// `relation` in `row`.
    pub fn reference_from<T: Entity>(&self, row: &Row, relation: &str) -> Result<Ref<T>> {
        let info = self.relation(relation)?;
        let column = info.join_column.ok_or_else(|| {
            Error::mapping(
                self.entity.name,
                format!("relationship '{}' has no join column", relation),
            )
        })?;
        Ok(self.reference(row.value_or_null(column)))
    }

    /// A lazy reference for the inverse side of a one-to-one relation.
    pub fn inverse_reference<T: Entity>(&self, relation: &str, owner_key: Value) -> Result<Ref<T>> {
        let info = self.relation(relation)?;
        Ok(Ref::Unresolved(Proxy {
            lookup: Lookup::Inverse {
                relation: info,
                owner_key,
            },
            loader: self.loader.clone(),
            cell: Arc::new(OnceLock::new()),
        }))
    }

    /// A lazy collection for relation `relation` of the owner keyed `owner_key`.
    pub fn collection<T: Entity>(&self, relation: &str, owner_key: Value) -> Result<Collection<T>> {
        let info = self.relation(relation)?;
        Ok(Collection::Unresolved(CollectionProxy {
            owner: self.entity,
            relation: info,
            owner_key,
            loader: self.loader.clone(),
            cell: Arc::new(OnceLock::new()),
        }))
    }

    /// A lazy collection keyed by the id column found in `row`.
    pub fn collection_from<T: Entity>(&self, row: &Row, relation: &str) -> Result<Collection<T>> {
        self.collection(relation, row.value_or_null(self.entity.id.column))
    }
}
