//! The logical statement IR handed to executors.
//!
//! Plans reference physical tables and columns only; every entity-level
//! concept (paths, relationships, inheritance, parameters) has been resolved
//! by the compiler or the flush planner. A plan is immutable once built.

use crate::clause::{NullsOrder, OrderDirection, OrderSpec};
use crate::expr::Expr;
use entkit_core::{Row, Value};
use std::fmt;

/// A table with the alias it is referenced by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: &'static str,
    pub alias: String,
}

impl TableRef {
    pub fn new(table: &'static str, alias: impl Into<String>) -> Self {
        Self {
            table,
            alias: alias.into(),
        }
    }
}

/// Join kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

/// A physical join.
#[derive(Debug, Clone)]
pub struct PlanJoin {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Expr,
}

/// One output column of a select.
#[derive(Debug, Clone)]
pub struct PlanColumn {
    pub expr: Expr,
    /// Name of the column in result rows
    pub label: String,
}

/// A compiled SELECT.
#[derive(Debug, Clone)]
pub struct SelectPlan {
    pub distinct: bool,
    pub from: TableRef,
    pub joins: Vec<PlanJoin>,
    pub projections: Vec<PlanColumn>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderSpec>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl SelectPlan {
    /// A plan selecting nothing from `from`.
    pub fn new(from: TableRef) -> Self {
        Self {
            distinct: false,
            from,
            joins: Vec::new(),
            projections: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    /// Output labels in order.
    pub fn labels(&self) -> Vec<String> {
        self.projections.iter().map(|c| c.label.clone()).collect()
    }

    /// Whether the plan aggregates rows.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self
                .projections
                .iter()
                .any(|c| c.expr.contains_aggregate())
    }
}

/// INSERT of one row.
#[derive(Debug, Clone)]
pub struct InsertStatement {
    pub table: &'static str,
    pub values: Vec<(&'static str, Value)>,
}

/// UPDATE over a single table.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub table: &'static str,
    /// Alias the filter and assignments may qualify columns with
    pub alias: Option<String>,
    pub assignments: Vec<(&'static str, Expr)>,
    pub filter: Option<Expr>,
}

/// DELETE over a single table.
#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub table: &'static str,
    pub alias: Option<String>,
    pub filter: Option<Expr>,
}

/// A logical statement.
#[derive(Debug, Clone)]
pub enum Statement {
    Select(SelectPlan),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    /// Statement verb, for logs and assertions.
    pub const fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }

    pub const fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }

    /// The table written or read from.
    pub fn table(&self) -> &'static str {
        match self {
            Statement::Select(plan) => plan.from.table,
            Statement::Insert(s) => s.table,
            Statement::Update(s) => s.table,
            Statement::Delete(s) => s.table,
        }
    }
}

/// What an executor returns.
#[derive(Debug, Clone)]
pub enum ExecResult {
    Rows(Vec<Row>),
    Affected(u64),
}

impl ExecResult {
    /// Result rows; write results yield none.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            ExecResult::Rows(rows) => rows,
            ExecResult::Affected(_) => Vec::new(),
        }
    }

    /// Affected row count; for selects, the number of rows.
    pub fn affected(&self) -> u64 {
        match self {
            ExecResult::Rows(rows) => rows.len() as u64,
            ExecResult::Affected(n) => *n,
        }
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    mut each: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        each(f, item)?;
    }
    Ok(())
}

fn write_order(f: &mut fmt::Formatter<'_>, spec: &OrderSpec) -> fmt::Result {
    let direction = match spec.direction {
        OrderDirection::Asc => "ASC",
        OrderDirection::Desc => "DESC",
    };
    write!(f, "{} {}", spec.expr, direction)?;
    match spec.nulls {
        Some(NullsOrder::First) => f.write_str(" NULLS FIRST"),
        Some(NullsOrder::Last) => f.write_str(" NULLS LAST"),
        None => Ok(()),
    }
}

impl fmt::Display for SelectPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        write_list(f, &self.projections, |f, c| write!(f, "{}", c.expr))?;
        write!(f, " FROM {} {}", self.from.table, self.from.alias)?;
        for join in &self.joins {
            write!(
                f,
                " {} {} {} ON {}",
                join.kind.as_str(),
                join.table.table,
                join.table.alias,
                join.on
            )?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {}", filter)?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" GROUP BY ")?;
            write_list(f, &self.group_by, |f, e| write!(f, "{}", e))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {}", having)?;
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY ")?;
            write_list(f, &self.order_by, write_order)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(plan) => write!(f, "{}", plan),
            Statement::Insert(insert) => {
                write!(f, "INSERT INTO {} (", insert.table)?;
                write_list(f, &insert.values, |f, (c, _)| f.write_str(c))?;
                f.write_str(") VALUES (")?;
                write_list(f, &insert.values, |f, (_, v)| write!(f, "{}", v))?;
                f.write_str(")")
            }
            Statement::Update(update) => {
                write!(f, "UPDATE {}", update.table)?;
                if let Some(alias) = &update.alias {
                    write!(f, " {}", alias)?;
                }
                f.write_str(" SET ")?;
                write_list(f, &update.assignments, |f, (c, e)| write!(f, "{} = {}", c, e))?;
                if let Some(filter) = &update.filter {
                    write!(f, " WHERE {}", filter)?;
                }
                Ok(())
            }
            Statement::Delete(delete) => {
                write!(f, "DELETE FROM {}", delete.table)?;
                if let Some(alias) = &delete.alias {
                    write!(f, " {}", alias)?;
                }
                if let Some(filter) = &delete.filter {
                    write!(f, " WHERE {}", filter)?;
                }
                Ok(())
            }
        }
    }
}
