//! Query compilation: from a [`QuerySpec`] to a [`SelectPlan`].
//!
//! Compilation is purely structural. It resolves aliases and paths against
//! the metamodel, turns relationship joins into physical join conditions,
//! substitutes bound parameters, checks operand types and aggregate
//! placement, and records which joined entities populate which
//! relationships. Nothing is executed; a query that compiles can still fail
//! at the executor, but a query that does not compile never reaches it.

use crate::expr::{AggregateFunc, BinaryOp, Expr, ScalarFunc, Subquery, UnaryOp};
use crate::layout::EntityLayout;
use crate::plan::{JoinKind, PlanColumn, PlanJoin, SelectPlan, TableRef};
use crate::select::{JoinEdge, Projection, QuerySpec, Source};
use entkit_core::{
    EntityDescriptor, Error, Metamodel, PathTarget, QueryCompilationErrorKind as Kind,
    RelationshipInfo, Result, SqlType, TableSlot, Value,
};
use std::collections::HashMap;

/// An entity's columns inside a compiled plan.
#[derive(Debug, Clone)]
pub struct Segment {
    pub alias: String,
    pub layout: EntityLayout,
    /// Index of the segment's first column in the plan's projections
    pub start: usize,
}

/// What each tuple position is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// Index into `segments`
    Entity(usize),
    /// Index into the plan's projections
    Value(usize),
}

/// A relationship populated from a fetch join.
#[derive(Debug, Clone, Copy)]
pub struct FetchDirective {
    /// Segment of the owning entity
    pub owner: usize,
    pub relation: &'static RelationshipInfo,
    /// Segment of the fetched entity
    pub target: usize,
}

impl FetchDirective {
    pub fn is_collection(&self) -> bool {
        !self.relation.kind.is_singular()
    }
}

/// Pagination applied after materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: Option<u64>,
}

/// A validated, executable query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: SelectPlan,
    pub segments: Vec<Segment>,
    pub outputs: Vec<Output>,
    pub fetches: Vec<FetchDirective>,
    /// Set when a collection fetch join forced pagination out of the plan
    pub in_memory_page: Option<Page>,
    /// Collapse duplicate root tuples produced by collection fetch joins
    pub collapse: bool,
}

impl CompiledQuery {
    pub fn has_collection_fetch(&self) -> bool {
        self.fetches.iter().any(FetchDirective::is_collection)
    }
}

/// Compile a query against a metamodel.
pub fn compile(spec: &QuerySpec, model: &Metamodel) -> Result<CompiledQuery> {
    let mut compiler = Compiler::new(model);
    let (compiled, _) = compiler.select(spec, false)?;
    tracing::debug!(
        segments = compiled.segments.len(),
        fetches = compiled.fetches.len(),
        plan = %compiled.plan,
        "Compiled query"
    );
    Ok(compiled)
}

fn fail<T>(kind: Kind, message: impl Into<String>) -> Result<T> {
    Err(Error::compile(kind, message))
}

/// Logical type of a literal.
pub fn value_type(value: &Value) -> Option<SqlType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(SqlType::Boolean),
        Value::Int(_) => Some(SqlType::Integer),
        Value::BigInt(_) => Some(SqlType::BigInt),
        Value::Double(_) => Some(SqlType::Double),
        Value::Text(_) => Some(SqlType::Text),
        Value::Bytes(_) => Some(SqlType::Blob),
        Value::Date(_) => Some(SqlType::Date),
        Value::Timestamp(_) => Some(SqlType::Timestamp),
        Value::Uuid(_) => Some(SqlType::Uuid),
        Value::Json(_) => Some(SqlType::Json),
    }
}

#[derive(Debug, Clone)]
struct Binding {
    descriptor: &'static EntityDescriptor,
    layout: EntityLayout,
}

/// Resolves expressions against the aliases in scope.
///
/// Scopes nest for subqueries: an inner query sees its own aliases and
/// every outer one, which is what makes correlated subqueries work.
pub(crate) struct Compiler<'a> {
    model: &'a Metamodel,
    scopes: Vec<HashMap<String, Binding>>,
    params: Vec<HashMap<String, Value>>,
    /// Reject paths outside the base table (bulk statements)
    primary_only: Option<String>,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(model: &'a Metamodel) -> Self {
        Self {
            model,
            scopes: Vec::new(),
            params: Vec::new(),
            primary_only: None,
        }
    }

    /// A compiler for a single-table write statement over `source`.
    pub(crate) fn for_bulk(
        model: &'a Metamodel,
        source: &Source,
        bindings: &HashMap<String, Value>,
    ) -> Result<(Self, EntityLayout)> {
        let mut compiler = Self::new(model);
        compiler.scopes.push(HashMap::new());
        compiler.params.push(bindings.clone());
        compiler.primary_only = Some(source.alias.clone());
        let layout = compiler.declare(source)?;
        Ok((compiler, layout))
    }

    fn declare(&mut self, source: &Source) -> Result<EntityLayout> {
        if self.scopes.iter().any(|s| s.contains_key(&source.alias)) {
            return fail(
                Kind::DuplicateAlias,
                format!("alias '{}' is introduced twice", source.alias),
            );
        }
        let descriptor = self
            .model
            .get(source.entity.name)
            .ok_or_else(|| Error::mapping(source.entity.name, "entity is not registered"))?;
        let layout = EntityLayout::new(descriptor, &source.alias);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(
                source.alias.clone(),
                Binding {
                    descriptor,
                    layout: layout.clone(),
                },
            );
        }
        Ok(layout)
    }

    fn lookup(&self, alias: &str) -> Result<&Binding> {
        match self.scopes.iter().rev().find_map(|s| s.get(alias)) {
            Some(binding) => Ok(binding),
            None => fail(
                Kind::UnknownAlias,
                format!("alias '{}' is not introduced by from or join", alias),
            ),
        }
    }

    fn param(&self, name: &str) -> Result<Value> {
        match self.params.iter().rev().find_map(|p| p.get(name)) {
            Some(value) => Ok(value.clone()),
            None => fail(
                Kind::UnboundParameter,
                format!("parameter ':{}' has no binding", name),
            ),
        }
    }

    fn select(
        &mut self,
        spec: &QuerySpec,
        nested: bool,
    ) -> Result<(CompiledQuery, Vec<Option<SqlType>>)> {
        let Some(root) = spec.root().cloned() else {
            return fail(Kind::Incomplete, "query has no FROM entity");
        };
        if spec.stray_on.is_some() {
            return fail(Kind::Incomplete, "on condition without a preceding join");
        }
        self.scopes.push(HashMap::new());
        self.params.push(spec.bindings.clone());
        let result = self.select_in_scope(spec, &root, nested);
        self.scopes.pop();
        self.params.pop();
        result
    }

    fn select_in_scope(
        &mut self,
        spec: &QuerySpec,
        root: &Source,
        nested: bool,
    ) -> Result<(CompiledQuery, Vec<Option<SqlType>>)> {
        let root_layout = self.declare(root)?;
        let mut plan = SelectPlan::new(root_layout.table());
        plan.joins.extend(root_layout.joins().iter().cloned());
        plan.distinct = spec.distinct;

        // (owner alias, relation, target alias)
        let mut pending_fetches: Vec<(String, &'static RelationshipInfo, String)> = Vec::new();
        for join in &spec.joins {
            if join.fetch && nested {
                return fail(Kind::InvalidSubquery, "subqueries cannot fetch join");
            }
            let layout = self.declare(&join.target)?;
            match &join.edge {
                JoinEdge::Relation { owner, relation } => {
                    let owner_binding = self.lookup(owner)?.clone();
                    let Some(info) = owner_binding.descriptor.relationship(relation) else {
                        return fail(
                            Kind::UnknownRelation,
                            format!(
                                "{} has no relationship '{}'",
                                owner_binding.descriptor.name, relation
                            ),
                        );
                    };
                    if info.target != layout.descriptor().name {
                        return fail(
                            Kind::TypeMismatch,
                            format!(
                                "'{}.{}' targets {}, but alias '{}' is {}",
                                owner,
                                relation,
                                info.target,
                                join.target.alias,
                                layout.descriptor().name
                            ),
                        );
                    }
                    let extra = match &join.on {
                        Some(on) => Some(self.predicate(on)?),
                        None => None,
                    };
                    self.relation_join(&mut plan, join.kind, &owner_binding.layout, info, &layout, extra)?;
                    if join.fetch {
                        pending_fetches.push((owner.clone(), info, join.target.alias.clone()));
                    }
                }
                JoinEdge::Theta => {
                    let on = match (&join.on, join.kind) {
                        (Some(on), _) => self.predicate(on)?,
                        (None, JoinKind::Inner) => Expr::lit(true),
                        (None, JoinKind::Left) => {
                            return fail(
                                Kind::Incomplete,
                                format!("left join of '{}' needs an on condition", join.target.alias),
                            );
                        }
                    };
                    plan.joins.push(PlanJoin {
                        kind: join.kind,
                        table: layout.table(),
                        on,
                    });
                }
            }
            plan.joins.extend(layout.joins().iter().cloned());
        }

        // Projections
        let mut segments: Vec<Segment> = Vec::new();
        let mut outputs = Vec::new();
        let mut types = Vec::new();
        for (index, projection) in spec.projections.iter().enumerate() {
            match projection {
                Projection::Entity(source) => {
                    let binding = self.lookup(&source.alias)?.clone();
                    if !std::ptr::eq(binding.descriptor, source.entity)
                        && binding.descriptor.name != source.entity.name
                    {
                        return fail(
                            Kind::TypeMismatch,
                            format!(
                                "alias '{}' is {}, not {}",
                                source.alias, binding.descriptor.name, source.entity.name
                            ),
                        );
                    }
                    if nested {
                        // A subquery selecting an entity yields its key.
                        outputs.push(Output::Value(plan.projections.len()));
                        types.push(Some(binding.descriptor.id.sql_type));
                        plan.projections.push(PlanColumn {
                            expr: binding.layout.key(),
                            label: format!("expr{}", index),
                        });
                    } else {
                        let start = plan.projections.len();
                        plan.projections.extend(binding.layout.plan_columns());
                        segments.push(Segment {
                            alias: source.alias.clone(),
                            layout: binding.layout,
                            start,
                        });
                        outputs.push(Output::Entity(segments.len() - 1));
                        types.push(None);
                    }
                }
                Projection::Expr(expr) => {
                    let (compiled, ty) = self.expr(expr)?;
                    outputs.push(Output::Value(plan.projections.len()));
                    types.push(ty);
                    plan.projections.push(PlanColumn {
                        expr: compiled,
                        label: format!("expr{}", index),
                    });
                }
            }
        }
        if outputs.is_empty() {
            return fail(Kind::Incomplete, "query selects nothing");
        }

        // Fetch directives; fetched entities not selected become hidden segments.
        let mut fetches = Vec::new();
        for (owner, relation, target) in pending_fetches {
            let Some(owner_segment) = segments.iter().position(|s| s.alias == owner) else {
                return fail(
                    Kind::Incomplete,
                    format!("fetch join owner '{}' is not selected", owner),
                );
            };
            let target_segment = match segments.iter().position(|s| s.alias == target) {
                Some(index) => index,
                None => {
                    let layout = self.lookup(&target)?.layout.clone();
                    let start = plan.projections.len();
                    plan.projections.extend(layout.plan_columns());
                    segments.push(Segment {
                        alias: target.clone(),
                        layout,
                        start,
                    });
                    segments.len() - 1
                }
            };
            fetches.push(FetchDirective {
                owner: owner_segment,
                relation,
                target: target_segment,
            });
        }

        // WHERE
        let mut filters = Vec::new();
        for filter in &spec.filters {
            let compiled = self.predicate(filter)?;
            if compiled.contains_aggregate() {
                return fail(
                    Kind::AggregatePlacement,
                    format!("aggregate in WHERE: {}", filter),
                );
            }
            filters.push(Some(compiled));
        }
        if let Some(subtype) = &spec.subtype {
            let restriction = root_layout
                .subtype_filter(subtype)
                .map_err(|e| Error::compile(Kind::UnknownField, e.to_string()))?;
            filters.push(Some(restriction));
        }
        plan.filter = Expr::all(filters);

        // GROUP BY / HAVING
        for key in &spec.group_by {
            let (compiled, _) = self.expr(key)?;
            if compiled.contains_aggregate() {
                return fail(Kind::AggregatePlacement, format!("aggregate in GROUP BY: {}", key));
            }
            plan.group_by.push(compiled);
        }
        let mut having = Vec::new();
        for predicate in &spec.having {
            having.push(Some(self.predicate(predicate)?));
        }
        plan.having = Expr::all(having);

        let aggregated = !plan.group_by.is_empty()
            || plan.projections.iter().any(|c| c.expr.contains_aggregate());
        if plan.having.is_some() && !aggregated {
            return fail(
                Kind::AggregatePlacement,
                "HAVING needs GROUP BY or aggregate projections",
            );
        }
        if aggregated {
            if !segments.is_empty() {
                return fail(
                    Kind::AggregatePlacement,
                    "entities cannot be selected alongside aggregates",
                );
            }
            for column in &plan.projections {
                check_grouped(&column.expr, &plan.group_by)?;
            }
            if let Some(having) = &plan.having {
                check_grouped(having, &plan.group_by)?;
            }
        }

        // ORDER BY
        for order in &spec.order_by {
            let (compiled, _) = self.expr(&order.expr)?;
            if aggregated {
                check_grouped(&compiled, &plan.group_by)?;
            } else if compiled.contains_aggregate() {
                return fail(
                    Kind::AggregatePlacement,
                    format!("aggregate in ORDER BY of a non-aggregate query: {}", order.expr),
                );
            }
            plan.order_by.push(order.clone().map_expr(|_| compiled));
        }

        // Pagination
        let collection_fetch = fetches.iter().any(FetchDirective::is_collection);
        let mut in_memory_page = None;
        if spec.offset.is_some() || spec.limit.is_some() {
            if spec.order_by.is_empty() {
                tracing::warn!(
                    root = root.entity.name,
                    "Paginating a query without ORDER BY; row order is unspecified"
                );
            }
            if collection_fetch {
                tracing::warn!(
                    root = root.entity.name,
                    offset = ?spec.offset,
                    limit = ?spec.limit,
                    "Collection fetch join with pagination; applying pagination in memory"
                );
                in_memory_page = Some(Page {
                    offset: spec.offset.unwrap_or(0),
                    limit: spec.limit,
                });
            } else {
                plan.offset = spec.offset;
                plan.limit = spec.limit;
            }
        }
        let collapse =
            collection_fetch && outputs.iter().all(|o| matches!(o, Output::Entity(_)));

        Ok((
            CompiledQuery {
                plan,
                segments,
                outputs,
                fetches,
                in_memory_page,
                collapse,
            },
            types,
        ))
    }

    /// Physical joins for `owner.relation`, ending at `target`'s table.
    fn relation_join(
        &self,
        plan: &mut SelectPlan,
        kind: JoinKind,
        owner: &EntityLayout,
        relation: &'static RelationshipInfo,
        target: &EntityLayout,
        extra: Option<Expr>,
    ) -> Result<()> {
        let with_extra = |on: Expr| match &extra {
            Some(extra) => on.and(extra.clone()),
            None => on,
        };
        let link_alias = format!("{}__link", target.alias());

        if let Some(column) = relation.join_column {
            plan.joins.push(PlanJoin {
                kind,
                table: target.table(),
                on: with_extra(target.key().eq(owner.qualify(TableSlot::Base, column))),
            });
            return Ok(());
        }
        if let Some(link) = relation.join_table {
            plan.joins.push(PlanJoin {
                kind,
                table: TableRef::new(link.table, link_alias.clone()),
                on: Expr::qualified(link_alias.clone(), link.owner_column).eq(owner.key()),
            });
            plan.joins.push(PlanJoin {
                kind,
                table: target.table(),
                on: with_extra(target.key().eq(Expr::qualified(link_alias, link.target_column))),
            });
            return Ok(());
        }

        let (_, owning) = self.model.owning_side(relation)?;
        if let Some(column) = owning.join_column {
            plan.joins.push(PlanJoin {
                kind,
                table: target.table(),
                on: with_extra(target.qualify(TableSlot::Base, column).eq(owner.key())),
            });
            return Ok(());
        }
        if let Some(link) = owning.join_table {
            plan.joins.push(PlanJoin {
                kind,
                table: TableRef::new(link.table, link_alias.clone()),
                on: Expr::qualified(link_alias.clone(), link.target_column).eq(owner.key()),
            });
            plan.joins.push(PlanJoin {
                kind,
                table: target.table(),
                on: with_extra(target.key().eq(Expr::qualified(link_alias, link.owner_column))),
            });
            return Ok(());
        }
        Err(Error::mapping(
            owner.descriptor().name,
            format!("relationship '{}' has no physical mapping", relation.name),
        ))
    }

    fn predicate(&mut self, expr: &Expr) -> Result<Expr> {
        self.expr(expr).map(|(compiled, _)| compiled)
    }

    fn path(&self, alias: &str, path: &str) -> Result<(Expr, Option<SqlType>)> {
        let binding = self.lookup(alias)?;
        let descriptor = binding.descriptor;
        match descriptor.resolve_path(path) {
            Some(PathTarget::Column {
                column,
                sql_type,
                slot,
                ..
            }) => {
                if self.primary_only.as_deref() == Some(alias) && slot != TableSlot::Base {
                    return fail(
                        Kind::UnknownField,
                        format!(
                            "'{}.{}' is not stored in {}'s primary table",
                            alias, path, descriptor.name
                        ),
                    );
                }
                Ok((binding.layout.qualify(slot, column), Some(sql_type)))
            }
            Some(PathTarget::ForeignKey { relation, column }) => {
                let key_type = self.model.get(relation.target).map(|t| t.id.sql_type);
                Ok((Expr::qualified(alias, column), key_type))
            }
            None if descriptor.relationship(path).is_some() => fail(
                Kind::UnknownField,
                format!(
                    "'{}.{}' is a collection or inverse relationship; join it to navigate",
                    alias, path
                ),
            ),
            None => fail(
                Kind::UnknownField,
                format!("{} has no field '{}'", descriptor.name, path),
            ),
        }
    }

    /// Compile an expression, returning it with its logical type when known.
    pub(crate) fn expr(&mut self, expr: &Expr) -> Result<(Expr, Option<SqlType>)> {
        match expr {
            Expr::Path { alias, path } => self.path(alias, path),
            Expr::Column { .. } => Ok((expr.clone(), None)),
            Expr::Literal(value) => Ok((expr.clone(), value_type(value))),
            Expr::Param(name) => {
                let value = self.param(name)?;
                let ty = value_type(&value);
                Ok((Expr::Literal(value), ty))
            }
            Expr::Binary { left, op, right } => {
                let (l, lt) = self.expr(left)?;
                let (r, rt) = self.expr(right)?;
                let ty = match op {
                    op if op.is_comparison() => {
                        check_compatible(&l, lt, &r, rt)?;
                        Some(SqlType::Boolean)
                    }
                    BinaryOp::And | BinaryOp::Or => Some(SqlType::Boolean),
                    BinaryOp::Concat => Some(SqlType::Text),
                    _ => {
                        for (operand, ty) in [(&l, lt), (&r, rt)] {
                            if ty.is_some_and(|t| !t.is_numeric()) {
                                return fail(
                                    Kind::TypeMismatch,
                                    format!("arithmetic on non-numeric operand {}", operand),
                                );
                            }
                        }
                        numeric_result(lt, rt)
                    }
                };
                Ok((
                    Expr::Binary {
                        left: Box::new(l),
                        op: *op,
                        right: Box::new(r),
                    },
                    ty,
                ))
            }
            Expr::Unary { op, expr } => {
                let (inner, ty) = self.expr(expr)?;
                let ty = match op {
                    UnaryOp::Not => Some(SqlType::Boolean),
                    UnaryOp::Neg => ty,
                };
                Ok((
                    Expr::Unary {
                        op: *op,
                        expr: Box::new(inner),
                    },
                    ty,
                ))
            }
            Expr::IsNull { expr, negated } => {
                let (inner, _) = self.expr(expr)?;
                Ok((
                    Expr::IsNull {
                        expr: Box::new(inner),
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                let (inner, ty) = self.expr(expr)?;
                let mut compiled = Vec::with_capacity(values.len());
                for value in values {
                    let (v, vt) = self.expr(value)?;
                    check_compatible(&inner, ty, &v, vt)?;
                    compiled.push(v);
                }
                Ok((
                    Expr::In {
                        expr: Box::new(inner),
                        values: compiled,
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let (inner, ty) = self.expr(expr)?;
                let (lo, lot) = self.expr(low)?;
                let (hi, hit) = self.expr(high)?;
                check_compatible(&inner, ty, &lo, lot)?;
                check_compatible(&inner, ty, &hi, hit)?;
                Ok((
                    Expr::Between {
                        expr: Box::new(inner),
                        low: Box::new(lo),
                        high: Box::new(hi),
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let (inner, ty) = self.expr(expr)?;
                let (pat, pt) = self.expr(pattern)?;
                for (operand, ty) in [(&inner, ty), (&pat, pt)] {
                    if ty.is_some_and(|t| t != SqlType::Text) {
                        return fail(
                            Kind::TypeMismatch,
                            format!("LIKE needs text operands, got {}", operand),
                        );
                    }
                }
                Ok((
                    Expr::Like {
                        expr: Box::new(inner),
                        pattern: Box::new(pat),
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let (arg, arg_type) = match arg {
                    Some(arg) => {
                        let (compiled, ty) = self.expr(arg)?;
                        if compiled.contains_aggregate() {
                            return fail(
                                Kind::AggregatePlacement,
                                format!("nested aggregate in {}", expr),
                            );
                        }
                        (Some(Box::new(compiled)), ty)
                    }
                    None => (None, None),
                };
                let ty = match func {
                    AggregateFunc::Count => Some(SqlType::BigInt),
                    AggregateFunc::Sum | AggregateFunc::Avg
                        if arg_type.is_some_and(|t| !t.is_numeric()) =>
                    {
                        return fail(
                            Kind::TypeMismatch,
                            format!("{} needs a numeric argument", func.as_str()),
                        );
                    }
                    AggregateFunc::Sum => match arg_type {
                        Some(SqlType::Double) => Some(SqlType::Double),
                        _ => Some(SqlType::BigInt),
                    },
                    AggregateFunc::Avg => Some(SqlType::Double),
                    AggregateFunc::Max | AggregateFunc::Min => arg_type,
                };
                Ok((
                    Expr::Aggregate {
                        func: *func,
                        arg,
                        distinct: *distinct,
                    },
                    ty,
                ))
            }
            Expr::Subquery(query) => {
                let (plan, ty) = self.subquery(query, true)?;
                Ok((Expr::Subquery(Box::new(Subquery::Plan(plan))), ty))
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let (inner, ty) = self.expr(expr)?;
                let (plan, sub_ty) = self.subquery(query, true)?;
                if let (Some(a), Some(b)) = (ty, sub_ty) {
                    if !a.is_compatible_with(&b) {
                        return fail(
                            Kind::TypeMismatch,
                            format!(
                                "{} ({}) compared with subquery of {}",
                                inner,
                                a.name(),
                                b.name()
                            ),
                        );
                    }
                }
                Ok((
                    Expr::InSubquery {
                        expr: Box::new(inner),
                        query: Box::new(Subquery::Plan(plan)),
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::Exists { query, negated } => {
                let (plan, _) = self.subquery(query, false)?;
                Ok((
                    Expr::Exists {
                        query: Box::new(Subquery::Plan(plan)),
                        negated: *negated,
                    },
                    Some(SqlType::Boolean),
                ))
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                if branches.is_empty() {
                    return fail(Kind::Incomplete, "CASE without a WHEN branch");
                }
                let operand = match operand {
                    Some(operand) => Some(self.expr(operand)?),
                    None => None,
                };
                let mut ty = None;
                let mut compiled = Vec::with_capacity(branches.len());
                for (condition, result) in branches {
                    let (c, ct) = self.expr(condition)?;
                    match &operand {
                        Some((o, ot)) => check_compatible(o, *ot, &c, ct)?,
                        None if ct.is_some_and(|t| t != SqlType::Boolean) => {
                            return fail(
                                Kind::TypeMismatch,
                                format!("CASE WHEN {} is not a predicate", c),
                            );
                        }
                        None => {}
                    }
                    let (r, rt) = self.expr(result)?;
                    ty = case_result(ty, &r, rt)?;
                    compiled.push((c, r));
                }
                let otherwise = match otherwise {
                    Some(otherwise) => {
                        let (o, ot) = self.expr(otherwise)?;
                        ty = case_result(ty, &o, ot)?;
                        Some(Box::new(o))
                    }
                    None => None,
                };
                Ok((
                    Expr::Case {
                        operand: operand.map(|(o, _)| Box::new(o)),
                        branches: compiled,
                        otherwise,
                    },
                    ty,
                ))
            }
            Expr::Cast { expr, to } => {
                let (inner, ty) = self.expr(expr)?;
                if let Some(from) = ty {
                    let convertible = from.is_compatible_with(to)
                        || from == SqlType::Text
                        || *to == SqlType::Text;
                    if !convertible {
                        return fail(
                            Kind::TypeMismatch,
                            format!("cannot cast {} ({}) to {}", inner, from.name(), to.name()),
                        );
                    }
                }
                Ok((
                    Expr::Cast {
                        expr: Box::new(inner),
                        to: *to,
                    },
                    Some(*to),
                ))
            }
            Expr::Function { func, args } => {
                if args.len() != func.arity() {
                    return fail(
                        Kind::TypeMismatch,
                        format!(
                            "{} takes {} argument(s), got {}",
                            func.as_str(),
                            func.arity(),
                            args.len()
                        ),
                    );
                }
                let mut compiled = Vec::with_capacity(args.len());
                for arg in args {
                    let (a, at) = self.expr(arg)?;
                    if at.is_some_and(|t| t != SqlType::Text) {
                        return fail(
                            Kind::TypeMismatch,
                            format!("{} needs text arguments, got {}", func.as_str(), a),
                        );
                    }
                    compiled.push(a);
                }
                let ty = match func {
                    ScalarFunc::Length => SqlType::Integer,
                    _ => SqlType::Text,
                };
                Ok((
                    Expr::Function {
                        func: *func,
                        args: compiled,
                    },
                    Some(ty),
                ))
            }
        }
    }

    fn subquery(&mut self, query: &Subquery, single: bool) -> Result<(SelectPlan, Option<SqlType>)> {
        let spec = match query {
            Subquery::Spec(spec) => spec,
            Subquery::Plan(plan) => return Ok((plan.clone(), None)),
        };
        let (compiled, types) = self.select(spec, true)?;
        if single && compiled.plan.projections.len() != 1 {
            return fail(
                Kind::InvalidSubquery,
                format!(
                    "subquery must select exactly one column, selects {}",
                    compiled.plan.projections.len()
                ),
            );
        }
        Ok((compiled.plan, types.first().copied().flatten()))
    }
}

fn check_compatible(left: &Expr, lt: Option<SqlType>, right: &Expr, rt: Option<SqlType>) -> Result<()> {
    match (lt, rt) {
        (Some(a), Some(b)) if !a.is_compatible_with(&b) => fail(
            Kind::TypeMismatch,
            format!(
                "cannot compare {} ({}) with {} ({})",
                left,
                a.name(),
                right,
                b.name()
            ),
        ),
        _ => Ok(()),
    }
}

/// Fold a CASE branch result into the type of the results seen so far.
fn case_result(seen: Option<SqlType>, result: &Expr, ty: Option<SqlType>) -> Result<Option<SqlType>> {
    match (seen, ty) {
        (Some(a), Some(b)) if !a.is_compatible_with(&b) => fail(
            Kind::TypeMismatch,
            format!(
                "CASE result {} ({}) does not match earlier {} results",
                result,
                b.name(),
                a.name()
            ),
        ),
        (Some(a), Some(b)) if a.is_numeric() => Ok(numeric_result(Some(a), Some(b))),
        (Some(a), _) => Ok(Some(a)),
        (None, b) => Ok(b),
    }
}

fn numeric_result(lt: Option<SqlType>, rt: Option<SqlType>) -> Option<SqlType> {
    match (lt, rt) {
        (Some(SqlType::Double), _) | (_, Some(SqlType::Double)) => Some(SqlType::Double),
        (Some(t), _) | (None, Some(t)) => Some(t),
        (None, None) => None,
    }
}

/// Columns referenced outside any aggregate call.
fn bare_columns<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Aggregate { .. } => {}
        Expr::Column { .. } => out.push(expr),
        _ => {
            for child in expr.children() {
                bare_columns(child, out);
            }
        }
    }
}

/// In an aggregate query every column outside an aggregate must be a group
/// key (or part of an expression that is one).
fn check_grouped(expr: &Expr, group_by: &[Expr]) -> Result<()> {
    let rendered = expr.to_string();
    if group_by.iter().any(|key| key.to_string() == rendered) {
        return Ok(());
    }
    let mut columns = Vec::new();
    bare_columns(expr, &mut columns);
    for column in columns {
        let name = column.to_string();
        if !group_by.iter().any(|key| key.to_string() == name) {
            return fail(
                Kind::AggregatePlacement,
                format!("{} is neither aggregated nor a GROUP BY key", name),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{case_when, count_all, exists, param, subquery};
    use crate::fixtures::{Member, Team, model};
    use crate::path::EntityPath;
    use crate::select::{Projection, select, select_from, select_one};

    fn kind_of(result: Result<CompiledQuery>) -> Kind {
        match result {
            Err(err) => err.compilation_kind().unwrap_or_else(|| panic!("not a compile error: {err}")),
            Ok(_) => panic!("expected a compilation error"),
        }
    }

    #[test]
    fn test_simple_select_projects_all_columns() {
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&m)
            .filter(m.get("name").eq("member1"))
            .compile(&model())
            .unwrap();
        assert_eq!(compiled.segments.len(), 1);
        assert_eq!(compiled.outputs, vec![Output::Entity(0)]);
        assert_eq!(
            compiled.plan.filter.as_ref().unwrap().to_string(),
            "(m.username = 'member1')"
        );
        assert!(compiled.plan.labels().contains(&"m.team_id".to_string()));
    }

    #[test]
    fn test_unknown_field_and_alias() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("t");
        assert_eq!(
            kind_of(select_from(&m).filter(m.get("nope").eq(1)).compile(&model())),
            Kind::UnknownField
        );
        assert_eq!(
            kind_of(select_from(&m).filter(t.get("name").eq("A")).compile(&model())),
            Kind::UnknownAlias
        );
    }

    #[test]
    fn test_type_mismatch_on_comparison() {
        let m = EntityPath::<Member>::new("m");
        assert_eq!(
            kind_of(select_from(&m).filter(m.get("age").eq("ten")).compile(&model())),
            Kind::TypeMismatch
        );
    }

    #[test]
    fn test_relation_join_condition_and_target_check() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("t");
        let compiled = select_from(&m).join(&m, "team", &t).compile(&model()).unwrap();
        assert_eq!(compiled.plan.joins.len(), 1);
        assert_eq!(compiled.plan.joins[0].on.to_string(), "(t.team_id = m.team_id)");

        let other = EntityPath::<Member>::new("o");
        assert_eq!(
            kind_of(select_from(&m).join(&m, "team", &other).compile(&model())),
            Kind::TypeMismatch
        );
        assert_eq!(
            kind_of(select_from(&m).join(&m, "club", &t).compile(&model())),
            Kind::UnknownRelation
        );
    }

    #[test]
    fn test_inverse_collection_join() {
        let t = EntityPath::<Team>::new("t");
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&t)
            .fetch_join(&t, "members", &m)
            .compile(&model())
            .unwrap();
        assert_eq!(compiled.plan.joins[0].on.to_string(), "(m.team_id = t.team_id)");
        assert_eq!(compiled.segments.len(), 2);
        assert!(compiled.collapse);
        assert!(compiled.fetches[0].is_collection());
    }

    #[test]
    fn test_collection_fetch_pages_in_memory() {
        let t = EntityPath::<Team>::new("t");
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&t)
            .fetch_join(&t, "members", &m)
            .order_by(t.get("name").asc())
            .offset(1)
            .limit(2)
            .compile(&model())
            .unwrap();
        assert_eq!(compiled.plan.limit, None);
        assert_eq!(compiled.plan.offset, None);
        assert_eq!(
            compiled.in_memory_page,
            Some(Page {
                offset: 1,
                limit: Some(2)
            })
        );
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("m");
        assert_eq!(
            kind_of(select_from(&m).join(&m, "team", &t).compile(&model())),
            Kind::DuplicateAlias
        );
    }

    #[test]
    fn test_aggregate_placement_rules() {
        let m = EntityPath::<Member>::new("m");
        let mixed = select(vec![m.get("name").into(), m.get("age").sum().into()]).from(&m);
        assert_eq!(kind_of(mixed.compile(&model())), Kind::AggregatePlacement);

        let grouped = select(vec![m.get("name").into(), m.get("age").sum().into()])
            .from(&m)
            .group_by(m.get("name"));
        assert!(grouped.compile(&model()).is_ok());

        let in_where = select_from(&m).filter(m.get("age").sum().gt(10));
        assert_eq!(kind_of(in_where.compile(&model())), Kind::AggregatePlacement);

        let having_alone = select_from(&m).having(count_all().gt(1));
        assert_eq!(kind_of(having_alone.compile(&model())), Kind::AggregatePlacement);

        let entity_with_count = select(vec![Projection::entity(&m), count_all().into()]).from(&m);
        assert_eq!(
            kind_of(entity_with_count.compile(&model())),
            Kind::AggregatePlacement
        );
    }

    #[test]
    fn test_case_expressions_are_type_checked() {
        let m = EntityPath::<Member>::new("m");
        let simple = m.get("age").when(10).then("ten").otherwise("other");
        let compiled = select(vec![simple.into()]).from(&m).compile(&model()).unwrap();
        assert_eq!(
            compiled.plan.projections[0].expr.to_string(),
            "CASE m.age WHEN 10 THEN 'ten' ELSE 'other' END"
        );

        let mixed = case_when(m.get("age").between(0, 20)).then(2).otherwise("old");
        assert_eq!(
            kind_of(select(vec![mixed.into()]).from(&m).compile(&model())),
            Kind::TypeMismatch
        );

        let not_predicate = case_when(m.get("age")).then(1).end();
        assert_eq!(
            kind_of(select(vec![not_predicate.into()]).from(&m).compile(&model())),
            Kind::TypeMismatch
        );

        let wrong_operand = m.get("name").when(10).then(1).end();
        assert_eq!(
            kind_of(select(vec![wrong_operand.into()]).from(&m).compile(&model())),
            Kind::TypeMismatch
        );
    }

    #[test]
    fn test_functions_need_text() {
        let m = EntityPath::<Member>::new("m");
        let lowered = select_from(&m).filter(m.get("name").eq(m.get("name").lower()));
        assert!(lowered.compile(&model()).is_ok());

        let on_number = select_from(&m).filter(m.get("age").upper().eq("X"));
        assert_eq!(kind_of(on_number.compile(&model())), Kind::TypeMismatch);

        let rendered = select_from(&m).filter(m.get("age").string_value().eq("10"));
        assert!(rendered.compile(&model()).is_ok());
    }

    #[test]
    fn test_parameters_are_substituted() {
        let m = EntityPath::<Member>::new("m");
        let unbound = select_from(&m).filter(m.get("name").eq(param("username")));
        assert_eq!(kind_of(unbound.compile(&model())), Kind::UnboundParameter);

        let bound = unbound.bind("username", "member1").compile(&model()).unwrap();
        assert_eq!(
            bound.plan.filter.unwrap().to_string(),
            "(m.username = 'member1')"
        );
    }

    #[test]
    fn test_correlated_subquery_sees_outer_alias() {
        let m = EntityPath::<Member>::new("m");
        let sub = EntityPath::<Member>::new("s");
        let oldest = select_one(sub.get("age").max()).from(&sub);
        let compiled = select_from(&m)
            .filter(m.get("age").eq(subquery(oldest)))
            .compile(&model())
            .unwrap();
        assert!(compiled.plan.filter.is_some());

        let t = EntityPath::<Team>::new("t");
        let correlated = select_from(&t)
            .filter(exists(
                select_one(sub.id()).from(&sub).filter(sub.get("team").eq(t.id())),
            ))
            .compile(&model());
        assert!(correlated.is_ok());
    }

    #[test]
    fn test_multi_column_scalar_subquery_rejected() {
        let m = EntityPath::<Member>::new("m");
        let sub = EntityPath::<Member>::new("s");
        let two = select(vec![sub.get("age").into(), sub.get("name").into()]).from(&sub);
        assert_eq!(
            kind_of(
                select_from(&m)
                    .filter(m.get("age").in_subquery(two))
                    .compile(&model())
            ),
            Kind::InvalidSubquery
        );
    }

    #[test]
    fn test_theta_left_join_requires_on() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("t");
        assert_eq!(
            kind_of(select_from(&m).left_join_on(&t).compile(&model())),
            Kind::Incomplete
        );
        let compiled = select_from(&m)
            .left_join_on(&t)
            .on(m.get("name").eq(t.get("name")))
            .compile(&model())
            .unwrap();
        assert_eq!(compiled.plan.joins[0].kind, JoinKind::Left);
    }

    #[test]
    fn test_on_without_join_is_incomplete() {
        let m = EntityPath::<Member>::new("m");
        let t = EntityPath::<Team>::new("t");
        assert_eq!(
            kind_of(
                select_from(&m)
                    .on(m.get("name").eq("kim"))
                    .join_on(&t)
                    .compile(&model())
            ),
            Kind::Incomplete
        );
    }

    #[test]
    fn test_unordered_paging_is_pushed_down() {
        let m = EntityPath::<Member>::new("m");
        let compiled = select_from(&m).limit(5).compile(&model()).unwrap();
        assert_eq!(compiled.plan.limit, Some(5));
        assert!(compiled.in_memory_page.is_none());
    }
}
