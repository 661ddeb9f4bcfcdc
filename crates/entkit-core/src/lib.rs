//! Core types for entkit.
//!
//! `entkit-core` is the **foundation layer**: every other entkit crate builds
//! on the types defined here, and nothing here performs I/O.
//!
//! # Role In The Architecture
//!
//! - **Values and rows**: [`Value`], [`Row`] and [`SqlType`] are the data the
//!   executor capability exchanges with the engine.
//! - **Entity metadata**: [`EntityDescriptor`] with its field, relationship,
//!   embedded, value-collection and inheritance metadata, validated as a
//!   whole by [`Metamodel`].
//! - **Instances**: the [`Entity`] trait, the object-safe [`EntityObject`]
//!   view and the shared [`Managed`] handle that carries instance identity.
//! - **References**: [`Ref`] and [`Collection`] relationship fields, which are
//!   either resolved or lazy proxies bound to a context.
//! - **Errors**: the single [`Error`] type shared by all crates.
//!
//! Async operations elsewhere in the workspace use asupersync's [`Cx`] and
//! [`Outcome`], re-exported here so downstream crates agree on one version.

pub mod codec;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod field;
pub mod inheritance;
pub mod metamodel;
pub mod outcome;
pub mod reference;
pub mod relationship;
pub mod row;
pub mod types;
pub mod value;

pub use asupersync::{Cx, Outcome};

pub use codec::Embeddable;
pub use descriptor::{EntityDescriptor, PathTarget, TableSlot};
pub use entity::{
    Entity, EntityFactory, EntityObject, Managed, ObjectId, RelationState, RelationValue,
    RelationView, entity_factory, unknown_relation,
};
pub use error::{
    ContextClosedError, Error, ExecutorError, IdentityConflictError, InsertOrderError,
    LifecycleError, MappingError, NotFoundError, QueryCompilationError,
    QueryCompilationErrorKind, Result, StaleStateError, TypeError, WriteKind,
};
pub use field::{EmbeddedInfo, FieldInfo, IdInfo, KeyGeneration, ValueCollectionInfo};
pub use inheritance::{InheritanceInfo, InheritanceStrategy, SubtypeInfo};
pub use metamodel::{Metamodel, MetamodelBuilder};
pub use reference::{
    Collection, CollectionProxy, ContextToken, HydrateScope, Loadable, LoaderHandle, Lookup,
    Proxy, Ref,
};
pub use relationship::{
    Cascade, CascadeOp, FetchType, JoinTableInfo, RelationshipInfo, RelationshipKind,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use types::{SqlType, TypeFamily};
pub use value::{Value, hash_values};
