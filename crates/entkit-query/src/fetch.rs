//! Running compiled selects through a session.

use crate::compile::{CompiledQuery, compile};
use crate::executor::{Executor, query};
use crate::expr::{Expr, count_all};
use crate::materialize::{Hydrator, materialize};
use crate::plan::Statement;
use crate::select::{Projection, QuerySpec, Select};
use entkit_core::{Cx, EntityDescriptor, Error, Metamodel, Outcome, Result, Row, Value};
use serde::Serialize;
use std::future::Future;

/// What a select needs from the context it runs in.
///
/// A persistence context implements this: it hydrates rows through its
/// identity map, flushes pending changes before statements that could
/// observe them, and reacts to bulk writes it did not see.
pub trait QuerySession: Hydrator {
    type Exec: Executor;

    fn metamodel(&self) -> &Metamodel;

    fn executor(&self) -> &Self::Exec;

    /// Called before every statement; `operation` names the caller.
    fn before_statement(
        &mut self,
        cx: &Cx,
        operation: &'static str,
    ) -> impl Future<Output = Outcome<(), Error>>;

    /// Called after rows have been materialized.
    fn after_load(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>>;

    /// Called after a bulk statement bypassed the identity map.
    fn after_bulk(&mut self, affected: u64);

    /// Keys of stored `entity` rows the session has scheduled for
    /// deletion. Results hydrating one of them are left out.
    fn removed_keys(&self, entity: &'static EntityDescriptor) -> Vec<Value>;
}

/// A page of results together with the unpaginated total.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<O> {
    pub items: Vec<O>,
    pub total: u64,
}

impl<O> Paged<O> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

async fn run<S: QuerySession>(
    cx: &Cx,
    session: &mut S,
    spec: &QuerySpec,
) -> Outcome<(CompiledQuery, Vec<Row>), Error> {
    entkit_core::try_outcome!(session.before_statement(cx, "query").await);
    let compiled = entkit_core::try_result!(compile(spec, session.metamodel()));
    tracing::debug!(statement = %compiled.plan, "Executing query");
    let statement = Statement::Select(compiled.plan.clone());
    let rows = entkit_core::try_outcome!(query(session.executor(), cx, &statement).await);
    tracing::trace!(rows = rows.len(), "Query returned rows");
    Outcome::Ok((compiled, rows))
}

impl<O> Select<O> {
    /// Compile without executing.
    pub fn compile(&self, model: &Metamodel) -> Result<CompiledQuery> {
        compile(self.spec(), model)
    }

    /// Execute and return every result.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn fetch<S: QuerySession>(&self, cx: &Cx, session: &mut S) -> Outcome<Vec<O>, Error> {
        let (compiled, rows) = entkit_core::try_outcome!(run(cx, session, self.spec()).await);
        let tuples = entkit_core::try_result!(materialize(&compiled, &rows, session));
        entkit_core::try_outcome!(session.after_load(cx).await);

        let materializer = self.materializer();
        let mut results = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            results.push(entkit_core::try_result!(materializer(tuple)));
        }
        Outcome::Ok(results)
    }

    /// Execute and return the single result, if any.
    ///
    /// More than one result is a [`Error::NonUniqueResult`].
    pub async fn fetch_one<S: QuerySession>(
        &self,
        cx: &Cx,
        session: &mut S,
    ) -> Outcome<Option<O>, Error> {
        let mut results = entkit_core::try_outcome!(self.fetch(cx, session).await);
        match results.len() {
            0 => Outcome::Ok(None),
            1 => Outcome::Ok(results.pop()),
            count => Outcome::Err(Error::NonUniqueResult { count }),
        }
    }

    /// Execute with a limit of one and return the first result.
    pub async fn fetch_first<S: QuerySession>(
        &self,
        cx: &Cx,
        session: &mut S,
    ) -> Outcome<Option<O>, Error> {
        let first = self.map_spec(|spec| spec.limit = Some(1));
        let results = entkit_core::try_outcome!(first.fetch(cx, session).await);
        Outcome::Ok(results.into_iter().next())
    }

    /// Count the results the query would return without pagination.
    ///
    /// Like [`fetch`](Self::fetch), the count leaves out rows of selected
    /// entities the session has removed but not yet flushed.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn fetch_count<S: QuerySession>(
        &self,
        cx: &Cx,
        session: &mut S,
    ) -> Outcome<u64, Error> {
        // Pending changes must be flushed before the removed keys are read.
        entkit_core::try_outcome!(session.before_statement(cx, "query").await);
        let mut excluded = Vec::new();
        for projection in &self.spec().projections {
            if let Projection::Entity(source) = projection {
                let keys = session.removed_keys(source.entity);
                if !keys.is_empty() {
                    let path = Expr::path(source.alias.clone(), source.entity.id.field);
                    excluded.push(path.not_in_list(keys));
                }
            }
        }
        let unpaged = self.map_spec(|spec| {
            spec.offset = None;
            spec.limit = None;
            spec.filters.extend(excluded);
        });
        // Grouped and distinct results are counted after the fact.
        if !self.spec().group_by.is_empty() || self.spec().distinct {
            let results = entkit_core::try_outcome!(unpaged.fetch(cx, session).await);
            return Outcome::Ok(results.len() as u64);
        }

        let spec = entkit_core::try_result!(count_spec(unpaged.spec()));
        let (_, rows) = entkit_core::try_outcome!(run(cx, session, &spec).await);
        let count = match rows.first() {
            Some(row) => entkit_core::try_result!(row.get_as::<i64>(0)),
            None => 0,
        };
        Outcome::Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Whether the query has any result.
    pub async fn fetch_exists<S: QuerySession>(
        &self,
        cx: &Cx,
        session: &mut S,
    ) -> Outcome<bool, Error> {
        let count = entkit_core::try_outcome!(self.fetch_count(cx, session).await);
        Outcome::Ok(count > 0)
    }

    /// Execute one page and the matching count query.
    pub async fn fetch_page<S: QuerySession>(
        &self,
        cx: &Cx,
        session: &mut S,
    ) -> Outcome<Paged<O>, Error> {
        let items = entkit_core::try_outcome!(self.fetch(cx, session).await);
        let total = entkit_core::try_outcome!(self.fetch_count(cx, session).await);
        Outcome::Ok(Paged { items, total })
    }
}

/// The COUNT variant of a query: same source, joins and filters, one
/// aggregate projection. Joins are counted by distinct root key so that
/// to-many joins do not inflate the total.
fn count_spec(spec: &QuerySpec) -> Result<QuerySpec> {
    let Some(root) = spec.root().cloned() else {
        return Err(Error::compile(
            entkit_core::QueryCompilationErrorKind::Incomplete,
            "query has no FROM entity",
        ));
    };
    let counted = if spec.joins.is_empty() {
        count_all()
    } else {
        Expr::path(root.alias.clone(), root.entity.id.field).count_distinct()
    };
    let mut count = spec.clone();
    count.from = Some(root);
    count.projections = vec![Projection::Expr(counted)];
    count.order_by.clear();
    count.offset = None;
    count.limit = None;
    for join in &mut count.joins {
        join.fetch = false;
    }
    Ok(count)
}
