//! Typed query builder and compiler for entkit.
//!
//! `entkit-query` is the **query layer**. Queries are built against entity
//! paths, compiled against a [`Metamodel`](entkit_core::Metamodel) into a
//! logical [`Statement`], and run through the [`Executor`] capability.
//!
//! # Role In The Architecture
//!
//! - **Builder**: [`select_from`], [`select`] and friends produce a typed
//!   [`Select`]; [`EntityPath`] and [`Expr`] build predicates, projections
//!   and orderings.
//! - **Compiler**: [`compile`] resolves aliases, paths, relationship joins,
//!   parameters and aggregates, failing with a `QueryCompilation` error
//!   before anything executes.
//! - **Materialization**: result rows become tuples of instances through a
//!   [`Hydrator`], normally a persistence context with an identity map.
//! - **Bulk statements**: [`Update`] and [`Delete`] bypass the identity map.
//! - **Executor**: the single capability a backend implements.

pub mod bulk;
pub mod clause;
pub mod compile;
pub mod executor;
pub mod expr;
pub mod fetch;
pub mod layout;
pub mod materialize;
pub mod path;
pub mod plan;
pub mod select;

#[cfg(test)]
mod fixtures;

pub use bulk::{Delete, Update};
pub use clause::{NullsOrder, OrderDirection, OrderSpec};
pub use compile::{CompiledQuery, FetchDirective, Output, Page, Segment, compile};
pub use executor::{Executor, query};
pub use expr::{
    AggregateFunc, BinaryOp, CaseBuilder, CaseWhen, Expr, ScalarFunc, Subquery, UnaryOp,
    case_when, count_all, escape_like, exists, lit, not_exists, param, subquery,
};
pub use fetch::{Paged, QuerySession};
pub use layout::{EntityLayout, EntityRow, subtype_alias};
pub use materialize::{FromTuple, Hydrated, Hydrator, Tuple, TupleItem, materialize};
pub use path::EntityPath;
pub use plan::{
    DeleteStatement, ExecResult, InsertStatement, JoinKind, PlanColumn, PlanJoin, SelectPlan,
    Statement, TableRef, UpdateStatement,
};
pub use select::{
    JoinEdge, JoinSpec, Projection, QuerySpec, Select, Source, select, select_as, select_entity,
    select_from, select_one, select_scalar,
};
