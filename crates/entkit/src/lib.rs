//! entkit - an object/relational persistence engine with a typed query
//! compiler.
//!
//! entkit provides:
//!
//! - A persistence context with an identity map, snapshot dirty checking,
//!   cascades and dependency-ordered flushes
//! - Lazy references and collections that resolve through their context
//! - Single-table and joined inheritance over closed enum hierarchies
//! - A typed query builder compiled to a logical plan, with fetch joins,
//!   aggregates, subqueries and pagination
//! - Bulk update and delete statements that bypass the identity map
//!
//! Storage is reached only through the [`Executor`] capability;
//! [`MemoryExecutor`] interprets plans in process. Entities are declared
//! with `#[derive(Entity)]` and `#[derive(Embeddable)]`; the generated code
//! names `entkit_core` directly, so applications depend on it as well.
//!
//! # Quick Start
//!
//! ```ignore
//! use entkit::prelude::*;
//!
//! let model = Metamodel::builder().register::<Team>().register::<Member>().build()?;
//! let mut ctx = PersistenceContext::new(MemoryExecutor::with_schema(&model), model);
//!
//! // Persist a graph; the flush inserts the team before its member.
//! let team = Managed::new(Team::new("A"));
//! ctx.persist(&member_of(&team, "m1"))?;
//! ctx.flush(&cx).await;
//!
//! // Query it back with the members populated from the same result set.
//! let t = EntityPath::<Team>::new("t");
//! let m = EntityPath::<Member>::new("m");
//! let teams = select_from(&t)
//!     .fetch_join(&t, "members", &m)
//!     .filter(t.get("name").eq("A"))
//!     .fetch(&cx, &mut ctx)
//!     .await;
//! ```

pub use entkit_core::codec;
pub use entkit_core::{
    Cascade, CascadeOp, Collection, CollectionProxy, ContextClosedError, Cx, EmbeddedInfo,
    Embeddable, Entity, EntityDescriptor, EntityObject, Error, FetchType, FieldInfo, FromValue,
    HydrateScope, IdInfo, IdentityConflictError, InheritanceInfo, InheritanceStrategy,
    InsertOrderError, KeyGeneration, LifecycleError, Loadable, Managed, Metamodel,
    MetamodelBuilder, NotFoundError, ObjectId, Outcome, Proxy, QueryCompilationError,
    QueryCompilationErrorKind, Ref, RelationState, RelationValue, RelationView, RelationshipInfo,
    RelationshipKind, Result, Row, SqlType, StaleStateError, SubtypeInfo, Value,
    ValueCollectionInfo, WriteKind, entity_factory, unknown_relation,
};

pub use entkit_query::{
    AggregateFunc, CaseBuilder, CaseWhen, CompiledQuery, Delete, EntityPath, ExecResult, Executor,
    Expr, FromTuple, JoinKind, NullsOrder, OrderDirection, OrderSpec, Paged, Projection,
    QuerySession, ScalarFunc, Select, SelectPlan, Statement, Tuple, TupleItem, Update, case_when,
    count_all, escape_like, exists, lit, not_exists, param, select, select_as, select_entity,
    select_from, select_one, select_scalar, subquery,
};

pub use entkit_context::{
    ContextConfig, ContextEvent, FlushResult, IdentityKey, LifecycleState, PersistenceContext,
};

pub use entkit_memory::MemoryExecutor;

pub use entkit_macros::{Embeddable, Entity};

/// Everything an application typically needs.
pub mod prelude {
    pub use crate::{
        Cascade, Collection, ContextConfig, Cx, Delete, Entity, EntityPath, Error, Expr, FetchType,
        HydrateScope, LifecycleState, Loadable, Managed, MemoryExecutor, Metamodel, NullsOrder,
        Outcome, PersistenceContext, Projection, Ref, Result, Row, Select, SqlType, Tuple, Update,
        Value, case_when, count_all, exists, lit, param, select, select_as, select_from,
        select_one, select_scalar, subquery,
    };
}
