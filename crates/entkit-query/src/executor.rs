//! The executor capability.
//!
//! The engine never renders SQL or talks to a database itself. Everything it
//! needs from the outside world is this trait: run a logical statement,
//! demarcate a transaction, and hand out generated keys. A driver crate
//! turns [`Statement`]s into its dialect; `entkit-memory` interprets them
//! directly.

use crate::plan::{ExecResult, Statement};
use entkit_core::{Cx, Error, Outcome, Value};
use std::future::Future;
use std::sync::Arc;

/// Executes logical statements.
///
/// All methods are cancel-aware through the [`Cx`] they receive.
pub trait Executor: Send + Sync {
    /// Execute a statement. Selects return rows labelled with the plan's
    /// projection labels; writes return the affected row count.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Produce a fresh key for an insert into `table`.
    fn generate_key(
        &self,
        cx: &Cx,
        table: &'static str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;
}

impl<T: Executor> Executor for Arc<T> {
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        (**self).execute(cx, statement)
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).begin(cx)
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).commit(cx)
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).rollback(cx)
    }

    fn generate_key(
        &self,
        cx: &Cx,
        table: &'static str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        (**self).generate_key(cx, table)
    }
}

/// Run a select and return its rows.
pub async fn query<E: Executor>(
    executor: &E,
    cx: &Cx,
    statement: &Statement,
) -> Outcome<Vec<entkit_core::Row>, Error> {
    let result = entkit_core::try_outcome!(executor.execute(cx, statement).await);
    Outcome::Ok(result.into_rows())
}
