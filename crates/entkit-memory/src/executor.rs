//! `MemoryExecutor`, the in-process implementation of [`Executor`].
//!
//! All state sits behind one mutex; every statement runs synchronously under
//! it and the returned future is already complete. Every statement is also
//! appended to a log so tests can assert exactly what the engine issued.

use crate::eval::Interpreter;
use crate::store::{Database, Record};
use crate::write;
use entkit_core::{Cx, Error, Metamodel, Outcome, Result, Value};
use entkit_query::{ExecResult, Executor, Statement};
use std::future::Future;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct State {
    db: Database,
    /// Database image taken at `begin`
    snapshot: Option<Database>,
    log: Vec<Statement>,
    fail_next_write: Option<String>,
}

/// An executor over in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: Mutex<State>,
}

impl MemoryExecutor {
    /// An executor without constraints.
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor enforcing the keys and references implied by `model`.
    pub fn with_schema(model: &Metamodel) -> Self {
        let mut db = Database::default();
        db.apply_schema(model);
        Self {
            state: Mutex::new(State {
                db,
                ..State::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Insert a row directly, bypassing the statement log.
    pub fn seed<I, S>(&self, table: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let record: Record = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.with_state(|state| state.db.insert(table, record))
    }

    /// A copy of every row in `table`.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.with_state(|state| state.db.rows(table).to_vec())
    }

    /// One column of every row in `table`.
    pub fn column(&self, table: &str, column: &str) -> Vec<Value> {
        self.with_state(|state| write::column_values(&state.db, table, column))
    }

    /// Every statement executed so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.with_state(|state| state.log.clone())
    }

    /// Rendered statements, in execution order.
    pub fn statement_log(&self) -> Vec<String> {
        self.with_state(|state| state.log.iter().map(ToString::to_string).collect())
    }

    /// Number of executed statements of the given kind (`"SELECT"`,
    /// `"INSERT"`, `"UPDATE"` or `"DELETE"`).
    pub fn count(&self, kind: &str) -> usize {
        self.with_state(|state| state.log.iter().filter(|s| s.kind() == kind).count())
    }

    /// Number of write statements executed so far.
    pub fn writes(&self) -> usize {
        self.with_state(|state| state.log.iter().filter(|s| s.is_write()).count())
    }

    pub fn clear_log(&self) {
        self.with_state(|state| state.log.clear());
    }

    /// Make the next write statement fail with `message`.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        let message = message.into();
        self.with_state(|state| state.fail_next_write = Some(message));
    }

    pub fn in_transaction(&self) -> bool {
        self.with_state(|state| state.snapshot.is_some())
    }

    fn execute_sync(&self, statement: &Statement) -> Result<ExecResult> {
        self.with_state(|state| {
            state.log.push(statement.clone());
            tracing::debug!(statement = %statement, "Executing statement");
            if statement.is_write() {
                if let Some(message) = state.fail_next_write.take() {
                    return Err(Error::executor(message));
                }
            }
            match statement {
                Statement::Select(plan) => Interpreter::new(&state.db).select(plan).map(ExecResult::Rows),
                Statement::Insert(insert) => write::insert(&mut state.db, insert).map(ExecResult::Affected),
                Statement::Update(update) => write::update(&mut state.db, update).map(ExecResult::Affected),
                Statement::Delete(delete) => write::delete(&mut state.db, delete).map(ExecResult::Affected),
            }
        })
    }

    fn begin_sync(&self) -> Result<()> {
        self.with_state(|state| {
            if state.snapshot.is_some() {
                return Err(Error::executor("Already in a transaction"));
            }
            tracing::debug!("BEGIN");
            state.snapshot = Some(state.db.clone());
            Ok(())
        })
    }

    fn commit_sync(&self) -> Result<()> {
        self.with_state(|state| {
            if state.snapshot.take().is_none() {
                return Err(Error::executor("Not in a transaction"));
            }
            tracing::debug!("COMMIT");
            Ok(())
        })
    }

    fn rollback_sync(&self) -> Result<()> {
        self.with_state(|state| {
            let Some(snapshot) = state.snapshot.take() else {
                return Err(Error::executor("Not in a transaction"));
            };
            tracing::debug!("ROLLBACK");
            state.db.restore(snapshot);
            Ok(())
        })
    }
}

impl Executor for MemoryExecutor {
    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = self.execute_sync(statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn generate_key(
        &self,
        _cx: &Cx,
        table: &'static str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let key = self.with_state(|state| state.db.next_key(table));
        async move { Outcome::Ok(key) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entkit_query::{
        DeleteStatement, Expr, InsertStatement, PlanColumn, SelectPlan, TableRef,
    };

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn insert_team(id: i64) -> Statement {
        Statement::Insert(InsertStatement {
            table: "team",
            values: vec![("team_id", Value::BigInt(id)), ("name", "t".into())],
        })
    }

    #[test]
    fn test_rollback_discards_writes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = MemoryExecutor::new();

        rt.block_on(async {
            unwrap_outcome(executor.execute(&cx, &insert_team(1)).await);
            unwrap_outcome(executor.begin(&cx).await);
            unwrap_outcome(executor.execute(&cx, &insert_team(2)).await);
            assert!(matches!(executor.begin(&cx).await, Outcome::Err(_)));
            unwrap_outcome(executor.rollback(&cx).await);
        });

        assert_eq!(executor.column("team", "team_id"), vec![Value::BigInt(1)]);
        assert!(!executor.in_transaction());
        assert_eq!(executor.count("INSERT"), 2);
    }

    #[test]
    fn test_select_returns_labelled_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = MemoryExecutor::new();
        executor
            .seed("team", [("team_id", Value::BigInt(4)), ("name", "red".into())])
            .unwrap();

        let mut plan = SelectPlan::new(TableRef::new("team", "t"));
        plan.projections.push(PlanColumn {
            expr: Expr::qualified("t", "name"),
            label: "t.name".into(),
        });
        let rows = rt.block_on(async {
            unwrap_outcome(executor.execute(&cx, &Statement::Select(plan)).await)
        });
        let rows = rows.into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("t.name"), Some(&Value::Text("red".into())));
        assert_eq!(executor.writes(), 0);
    }

    #[test]
    fn test_injected_failure_hits_next_write_only() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = MemoryExecutor::new();
        executor.fail_next_write("disk full");

        rt.block_on(async {
            assert!(matches!(
                executor.execute(&cx, &insert_team(1)).await,
                Outcome::Err(Error::Executor(_))
            ));
            unwrap_outcome(executor.execute(&cx, &insert_team(1)).await);
            let delete = Statement::Delete(DeleteStatement {
                table: "team",
                alias: None,
                filter: None,
            });
            let result = unwrap_outcome(executor.execute(&cx, &delete).await);
            assert_eq!(result.affected(), 1);
        });
    }

    #[test]
    fn test_generated_keys_survive_rollback() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let executor = MemoryExecutor::new();

        rt.block_on(async {
            unwrap_outcome(executor.begin(&cx).await);
            let first = unwrap_outcome(executor.generate_key(&cx, "team").await);
            unwrap_outcome(executor.rollback(&cx).await);
            let second = unwrap_outcome(executor.generate_key(&cx, "team").await);
            assert_eq!(first, Value::BigInt(1));
            assert_eq!(second, Value::BigInt(2));
        });
    }
}
