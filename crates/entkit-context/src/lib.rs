//! Persistence context and unit of work for entkit.
//!
//! `entkit-context` is the **unit-of-work layer**. A [`PersistenceContext`]
//! tracks every instance it loads or persists, guarantees one in-memory
//! instance per row, detects changes against snapshots, and writes them in
//! dependency order at flush.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one managed instance per (entity, key).
//! - **Lifecycle**: transient, managed, removed and detached states with
//!   cascading persist, remove and refresh.
//! - **Dirty checking**: snapshot comparison, no interception of setters.
//! - **Flush planning**: inserts parents first, breaks nullable FK cycles
//!   with a deferred update, and fails on cycles of mandatory FKs.
//! - **Lazy loading**: proxies resolve through the context that created
//!   them, and only while it is open.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = PersistenceContext::new(MemoryExecutor::with_schema(&model), model);
//!
//! let team = Managed::new(Team::new("red"));
//! ctx.persist(&team)?;
//! ctx.commit(&cx).await;
//!
//! let teams = select_from(&EntityPath::<Team>::new("t"))
//!     .fetch(&cx, &mut ctx)
//!     .await;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod config;
pub mod context;
pub mod events;
pub mod flush;
pub mod identity_map;
pub mod inheritance;
mod load;
pub mod state;
mod unit_of_work;

#[cfg(test)]
mod test_entities;

pub use cascade::{Visited, reachable};
pub use change_tracker::{ChangeSet, ObjectState, Snapshot};
pub use config::ContextConfig;
pub use context::PersistenceContext;
pub use events::{ContextEvent, ContextEventCallbacks};
pub use flush::FlushResult;
pub use identity_map::{IdentityKey, IdentityMap};
pub use state::{LifecycleOp, LifecycleState};
