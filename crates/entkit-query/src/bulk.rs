//! Bulk UPDATE and DELETE.
//!
//! Bulk statements go straight to the executor. They never consult or
//! update the identity map, so managed instances may hold stale state
//! afterwards; the session is told how many rows were affected and decides
//! what to do about it.

use crate::compile::Compiler;
use crate::executor::Executor;
use crate::expr::{Expr, Subquery};
use crate::fetch::QuerySession;
use crate::layout::subtype_alias;
use crate::path::EntityPath;
use crate::plan::{DeleteStatement, PlanColumn, SelectPlan, Statement, UpdateStatement};
use crate::select::Source;
use entkit_core::{
    Cx, Entity, Error, Metamodel, Outcome, PathTarget, QueryCompilationErrorKind as Kind, Result,
    TableSlot, Value,
};
use std::collections::HashMap;

fn compile_filter(compiler: &mut Compiler<'_>, filters: &[Expr]) -> Result<Option<Expr>> {
    let mut compiled = Vec::with_capacity(filters.len());
    for filter in filters {
        let (expr, _) = compiler.expr(filter)?;
        if expr.contains_aggregate() {
            return Err(Error::compile(
                Kind::AggregatePlacement,
                format!("aggregate in bulk WHERE: {}", filter),
            ));
        }
        compiled.push(Some(expr));
    }
    Ok(Expr::all(compiled))
}

async fn execute_all<E: Executor>(
    executor: &E,
    cx: &Cx,
    statements: &[Statement],
) -> Outcome<u64, Error> {
    let mut affected = 0;
    for statement in statements {
        tracing::debug!(statement = %statement, "Executing bulk statement");
        let result = entkit_core::try_outcome!(executor.execute(cx, statement).await);
        affected = result.affected();
    }
    // The last statement targets the root table; its count is the answer.
    Outcome::Ok(affected)
}

/// A bulk `UPDATE` over one entity's primary table.
///
/// ```ignore
/// let m = EntityPath::<Member>::new("m");
/// let n = Update::table(&m)
///     .set("age", m.get("age").add(1))
///     .filter(m.get("age").ge(20))
///     .execute(&cx, &mut ctx)
///     .await;
/// ```
#[derive(Debug, Clone)]
pub struct Update {
    source: Source,
    assignments: Vec<(String, Expr)>,
    filters: Vec<Expr>,
    bindings: HashMap<String, Value>,
}

impl Update {
    pub fn table<E: Entity>(path: &EntityPath<E>) -> Self {
        Self {
            source: Source::of(path),
            assignments: Vec::new(),
            filters: Vec::new(),
            bindings: HashMap::new(),
        }
    }

    /// Assign `value` to field `field`.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.assignments.push((field.into(), value.into()));
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Compile to a single-table statement.
    pub fn compile(&self, model: &Metamodel) -> Result<Statement> {
        if self.assignments.is_empty() {
            return Err(Error::compile(Kind::Incomplete, "bulk update sets nothing"));
        }
        let (mut compiler, layout) = Compiler::for_bulk(model, &self.source, &self.bindings)?;
        let descriptor = layout.descriptor();

        let mut assignments = Vec::with_capacity(self.assignments.len());
        for (field, value) in &self.assignments {
            let (column, target_type) = match descriptor.resolve_path(field) {
                Some(PathTarget::Column {
                    column,
                    sql_type,
                    nullable,
                    slot: TableSlot::Base,
                }) => {
                    if column == descriptor.id.column {
                        return Err(Error::compile(
                            Kind::UnknownField,
                            format!("bulk update cannot assign the key of {}", descriptor.name),
                        ));
                    }
                    if !nullable && matches!(value, Expr::Literal(Value::Null)) {
                        return Err(Error::compile(
                            Kind::TypeMismatch,
                            format!("{}.{} is not nullable", descriptor.name, field),
                        ));
                    }
                    (column, Some(sql_type))
                }
                Some(PathTarget::ForeignKey { relation, column }) => {
                    (column, model.get(relation.target).map(|t| t.id.sql_type))
                }
                Some(PathTarget::Column { .. }) => {
                    return Err(Error::compile(
                        Kind::UnknownField,
                        format!(
                            "'{}' is stored in a subtype table; bulk update only writes {}",
                            field, descriptor.table
                        ),
                    ));
                }
                None => {
                    return Err(Error::compile(
                        Kind::UnknownField,
                        format!("{} has no assignable field '{}'", descriptor.name, field),
                    ));
                }
            };
            let (expr, value_type) = compiler.expr(value)?;
            if let (Some(a), Some(b)) = (target_type, value_type) {
                if !a.is_compatible_with(&b) {
                    return Err(Error::compile(
                        Kind::TypeMismatch,
                        format!("cannot assign {} to {} ({})", b.name(), field, a.name()),
                    ));
                }
            }
            if expr.contains_aggregate() {
                return Err(Error::compile(
                    Kind::AggregatePlacement,
                    format!("aggregate in bulk SET: {}", value),
                ));
            }
            assignments.push((column, expr));
        }

        Ok(Statement::Update(UpdateStatement {
            table: descriptor.table,
            alias: Some(self.source.alias.clone()),
            assignments,
            filter: compile_filter(&mut compiler, &self.filters)?,
        }))
    }

    /// Execute through a session; returns the number of rows updated.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.source.entity.name))]
    pub async fn execute<S: QuerySession>(&self, cx: &Cx, session: &mut S) -> Outcome<u64, Error> {
        entkit_core::try_outcome!(session.before_statement(cx, "bulk update").await);
        let statement = entkit_core::try_result!(self.compile(session.metamodel()));
        let affected = entkit_core::try_outcome!(
            execute_all(session.executor(), cx, std::slice::from_ref(&statement)).await
        );
        session.after_bulk(affected);
        Outcome::Ok(affected)
    }

    /// Execute directly, without a session.
    pub async fn execute_on<E: Executor>(
        &self,
        cx: &Cx,
        executor: &E,
        model: &Metamodel,
    ) -> Outcome<u64, Error> {
        let statement = entkit_core::try_result!(self.compile(model));
        execute_all(executor, cx, std::slice::from_ref(&statement)).await
    }
}

/// A bulk `DELETE`.
///
/// For a joined hierarchy the matching subtype rows are deleted first,
/// selected by key from the root table.
#[derive(Debug, Clone)]
pub struct Delete {
    source: Source,
    filters: Vec<Expr>,
    bindings: HashMap<String, Value>,
}

impl Delete {
    pub fn from<E: Entity>(path: &EntityPath<E>) -> Self {
        Self {
            source: Source::of(path),
            filters: Vec::new(),
            bindings: HashMap::new(),
        }
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Compile to the statements to run, root table last.
    pub fn compile(&self, model: &Metamodel) -> Result<Vec<Statement>> {
        let (mut compiler, layout) = Compiler::for_bulk(model, &self.source, &self.bindings)?;
        let descriptor = layout.descriptor();
        let filter = compile_filter(&mut compiler, &self.filters)?;
        let alias = self.source.alias.clone();

        let mut statements = Vec::new();
        if let Some(inheritance) = descriptor.inheritance.filter(|i| i.is_joined()) {
            let mut keys = SelectPlan::new(layout.table());
            keys.projections.push(PlanColumn {
                expr: layout.key(),
                label: "key".to_string(),
            });
            keys.filter.clone_from(&filter);
            for subtype in inheritance.subtypes {
                let sub_alias = subtype_alias(&alias, subtype);
                statements.push(Statement::Delete(DeleteStatement {
                    table: subtype.table,
                    alias: Some(sub_alias.clone()),
                    filter: Some(Expr::InSubquery {
                        expr: Box::new(Expr::qualified(sub_alias, descriptor.id.column)),
                        query: Box::new(Subquery::Plan(keys.clone())),
                        negated: false,
                    }),
                }));
            }
        }
        statements.push(Statement::Delete(DeleteStatement {
            table: descriptor.table,
            alias: Some(alias),
            filter,
        }));
        Ok(statements)
    }

    /// Execute through a session; returns the number of root rows deleted.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.source.entity.name))]
    pub async fn execute<S: QuerySession>(&self, cx: &Cx, session: &mut S) -> Outcome<u64, Error> {
        entkit_core::try_outcome!(session.before_statement(cx, "bulk delete").await);
        let statements = entkit_core::try_result!(self.compile(session.metamodel()));
        let affected = entkit_core::try_outcome!(execute_all(session.executor(), cx, &statements).await);
        session.after_bulk(affected);
        Outcome::Ok(affected)
    }

    /// Execute directly, without a session.
    pub async fn execute_on<E: Executor>(
        &self,
        cx: &Cx,
        executor: &E,
        model: &Metamodel,
    ) -> Outcome<u64, Error> {
        let statements = entkit_core::try_result!(self.compile(model));
        execute_all(executor, cx, &statements).await
    }
}
