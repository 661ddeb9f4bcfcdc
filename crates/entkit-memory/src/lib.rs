//! In-memory executor for entkit.
//!
//! `entkit-memory` interprets the logical [`Statement`](entkit_query::Statement)
//! IR directly over in-process tables. It is the reference backend used by
//! the test suites and is handy for prototyping against a metamodel without
//! a database.
//!
//! - Selects support inner, left and theta joins, three-valued predicates,
//!   `LIKE`, `IN`, `BETWEEN`, correlated subqueries, grouping with `HAVING`,
//!   `DISTINCT`, ordering with null placement, and offset/limit paging.
//! - Writes enforce primary keys and, when built with
//!   [`MemoryExecutor::with_schema`], the foreign keys implied by the
//!   metamodel.
//! - Transactions snapshot the whole database at `begin`.

mod eval;
pub mod executor;
mod select;
pub mod store;
mod write;

pub use executor::MemoryExecutor;
pub use store::{Database, ForeignKey, Record};
