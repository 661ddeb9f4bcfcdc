//! The entity contract and shared instance handles.
//!
//! An [`Entity`] is a plain Rust struct that knows how to turn itself into a
//! row image and back. Inside a persistence context every instance lives
//! behind a [`Managed`] handle so that "the same row" is always "the same
//! object": identity is handle identity, not value equality.

use crate::Result;
use crate::descriptor::EntityDescriptor;
use crate::error::Error;
use crate::reference::HydrateScope;
use crate::row::Row;
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Builds a type-erased instance from a row.
pub type EntityFactory = fn(&Row, &HydrateScope) -> Result<Arc<dyn EntityObject>>;

/// Trait for types that map to entity rows.
///
/// Usually derived; the derive writes the descriptor and every method below
/// from field attributes:
///
/// ```ignore
/// #[derive(Debug, Entity)]
/// struct Member {
///     #[entity(id, generated, column = "member_id")]
///     id: Option<i64>,
///     #[entity(column = "username")]
///     name: String,
///     age: i32,
///     team: Ref<Team>,
/// }
/// ```
///
/// Hand-written impls return a static [`EntityDescriptor`] from
/// `descriptor` and must keep `to_row`/`from_row` in step with it.
pub trait Entity: Sized + Send + Sync + 'static {
    /// Static metadata for this entity kind.
    fn descriptor() -> &'static EntityDescriptor;

    /// The primary key, or `None` before one is assigned.
    fn id(&self) -> Option<Value>;

    /// Store a key assigned by the application or generated at flush.
    fn set_id(&mut self, id: Value) -> Result<()>;

    /// The persistent column image: plain, embedded and subtype columns.
    ///
    /// The key, the discriminator and relationship FK columns are not part
    /// of the image; the context derives them from metadata and
    /// [`relations`](Entity::relations).
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Rebuild an instance from a row.
    fn from_row(row: &Row, scope: &HydrateScope) -> Result<Self>;

    /// The concrete subtype, for inheritance hierarchies.
    fn subtype(&self) -> Option<&'static str> {
        None
    }

    /// Current state of every relationship field.
    fn relations(&self) -> Vec<RelationView> {
        Vec::new()
    }

    /// Replace a relationship field with loaded instances.
    fn attach(&mut self, relation: &str, value: RelationValue) -> Result<()> {
        let _ = value;
        Err(unknown_relation(Self::descriptor().name, relation))
    }

    /// Element rows of each collection of value types, in codec order.
    fn value_collections(&self) -> Vec<(&'static str, Vec<Vec<Value>>)> {
        Vec::new()
    }

    /// Populate a collection of value types from its auxiliary rows.
    fn load_value_collection(&mut self, name: &str, rows: &[Row]) -> Result<()> {
        let _ = rows;
        Err(Error::mapping(
            Self::descriptor().name,
            format!("no value collection named '{}'", name),
        ))
    }

    /// Store a new optimistic-lock version after an update.
    fn set_version(&mut self, version: Value) -> Result<()> {
        let _ = version;
        Err(Error::mapping(
            Self::descriptor().name,
            "entity declares a version field but does not implement set_version",
        ))
    }
}

/// Error for a relationship name the entity does not declare.
pub fn unknown_relation(entity: &'static str, relation: &str) -> Error {
    Error::mapping(entity, format!("no relationship named '{}'", relation))
}

/// Snapshot of one relationship field, as seen by cascades and the flush.
#[derive(Clone)]
pub struct RelationView {
    pub name: &'static str,
    pub state: RelationState,
}

/// Loaded state of a relationship field.
#[derive(Clone)]
pub enum RelationState {
    /// Empty to-one reference
    Null,
    /// Unresolved proxy; to-one proxies expose the target key
    Unloaded(Option<Value>),
    /// Loaded to-one target
    One(Arc<dyn EntityObject>),
    /// Loaded collection
    Many(Vec<Arc<dyn EntityObject>>),
}

impl RelationState {
    /// The loaded targets, empty when nothing is loaded.
    pub fn targets(&self) -> Vec<Arc<dyn EntityObject>> {
        match self {
            RelationState::One(target) => vec![Arc::clone(target)],
            RelationState::Many(targets) => targets.clone(),
            RelationState::Null | RelationState::Unloaded(_) => Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, RelationState::Unloaded(_))
    }
}

impl fmt::Debug for RelationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationState::Null => f.write_str("Null"),
            RelationState::Unloaded(key) => f.debug_tuple("Unloaded").field(key).finish(),
            RelationState::One(target) => f
                .debug_tuple("One")
                .field(&target.descriptor().name)
                .field(&target.entity_id())
                .finish(),
            RelationState::Many(targets) => write!(f, "Many({} items)", targets.len()),
        }
    }
}

impl fmt::Debug for RelationView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationView")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// Loaded instances handed to [`Entity::attach`].
pub enum RelationValue {
    One(Option<Arc<dyn EntityObject>>),
    Many(Vec<Arc<dyn EntityObject>>),
}

/// Object-safe view of an entity behind its lock.
///
/// Implemented for every `RwLock<E>`; the context stores
/// `Arc<dyn EntityObject>` so it can track instances of many kinds.
pub trait EntityObject: Send + Sync + 'static {
    fn descriptor(&self) -> &'static EntityDescriptor;
    fn entity_id(&self) -> Option<Value>;
    fn assign_id(&self, id: Value) -> Result<()>;
    fn row_image(&self) -> Vec<(&'static str, Value)>;
    fn subtype(&self) -> Option<&'static str>;
    fn relations(&self) -> Vec<RelationView>;
    fn attach(&self, relation: &str, value: RelationValue) -> Result<()>;
    fn value_collections(&self) -> Vec<(&'static str, Vec<Vec<Value>>)>;
    fn load_value_collection(&self, name: &str, rows: &[Row]) -> Result<()>;
    fn assign_version(&self, version: Value) -> Result<()>;
    /// Overwrite this instance's state with a freshly loaded one.
    fn replace_with(&self, fresh: Arc<dyn EntityObject>) -> Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> EntityObject for RwLock<E> {
    fn descriptor(&self) -> &'static EntityDescriptor {
        E::descriptor()
    }

    fn entity_id(&self) -> Option<Value> {
        read_lock(self).id()
    }

    fn assign_id(&self, id: Value) -> Result<()> {
        write_lock(self).set_id(id)
    }

    fn row_image(&self) -> Vec<(&'static str, Value)> {
        read_lock(self).to_row()
    }

    fn subtype(&self) -> Option<&'static str> {
        read_lock(self).subtype()
    }

    fn relations(&self) -> Vec<RelationView> {
        read_lock(self).relations()
    }

    fn attach(&self, relation: &str, value: RelationValue) -> Result<()> {
        write_lock(self).attach(relation, value)
    }

    fn value_collections(&self) -> Vec<(&'static str, Vec<Vec<Value>>)> {
        read_lock(self).value_collections()
    }

    fn load_value_collection(&self, name: &str, rows: &[Row]) -> Result<()> {
        write_lock(self).load_value_collection(name, rows)
    }

    fn assign_version(&self, version: Value) -> Result<()> {
        write_lock(self).set_version(version)
    }

    fn replace_with(&self, fresh: Arc<dyn EntityObject>) -> Result<()> {
        let fresh = fresh
            .into_any()
            .downcast::<RwLock<E>>()
            .map_err(|_| Error::mapping(E::descriptor().name, "refreshed instance has another type"))?;
        let value = match Arc::try_unwrap(fresh) {
            Ok(lock) => lock.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(_) => {
                return Err(Error::mapping(
                    E::descriptor().name,
                    "refreshed instance is shared",
                ));
            }
        };
        *write_lock(self) = value;
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn read_lock<E>(lock: &RwLock<E>) -> RwLockReadGuard<'_, E> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<E>(lock: &RwLock<E>) -> RwLockWriteGuard<'_, E> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Address-based identity of a shared instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Identity of an erased instance.
    pub fn of(object: &Arc<dyn EntityObject>) -> Self {
        ObjectId(Arc::as_ptr(object).cast::<()>() as usize)
    }
}

/// A shared handle to an entity instance.
///
/// Clones share the instance. Two handles obtained from the same context
/// for the same key satisfy [`Managed::ptr_eq`].
pub struct Managed<E: Entity>(Arc<RwLock<E>>);

impl<E: Entity> Managed<E> {
    /// Wrap a new (transient) instance.
    pub fn new(entity: E) -> Self {
        Managed(Arc::new(RwLock::new(entity)))
    }

    /// Borrow the instance for reading.
    ///
    /// Do not hold the guard across context calls that may touch the same
    /// instance.
    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        read_lock(&self.0)
    }

    /// Borrow the instance for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        write_lock(&self.0)
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Managed<E>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.0).cast::<()>() as usize)
    }

    /// Type-erase the handle.
    pub fn erase(&self) -> Arc<dyn EntityObject> {
        let erased: Arc<dyn EntityObject> = self.0.clone();
        erased
    }

    /// Recover a typed handle from an erased one.
    pub fn from_erased(object: Arc<dyn EntityObject>) -> Result<Self> {
        let found = object.descriptor().name;
        object
            .into_any()
            .downcast::<RwLock<E>>()
            .map(Managed)
            .map_err(|_| {
                Error::mapping(
                    E::descriptor().name,
                    format!("instance of {} cannot be viewed as this entity", found),
                )
            })
    }

    /// The current key.
    pub fn id(&self) -> Option<Value> {
        self.read().id()
    }
}

impl<E: Entity> Clone for Managed<E> {
    fn clone(&self) -> Self {
        Managed(Arc::clone(&self.0))
    }
}

impl<E: Entity + fmt::Debug> fmt::Debug for Managed<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Managed").field(&*self.read()).finish()
    }
}

/// Factory stored in descriptors: hydrate `E` and erase it.
pub fn entity_factory<E: Entity>(row: &Row, scope: &HydrateScope) -> Result<Arc<dyn EntityObject>> {
    let entity = E::from_row(row, scope)?;
    let erased: Arc<dyn EntityObject> = Arc::new(RwLock::new(entity));
    Ok(erased)
}
