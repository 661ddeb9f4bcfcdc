//! Query expressions.
//!
//! Expressions are built against entity paths (`m.get("age")`) and compiled
//! into physical column references. The same tree type is used before and
//! after compilation: the compiler replaces [`Expr::Path`] with
//! [`Expr::Column`], parameters with literals, and subquery specs with
//! compiled plans, so executors only ever see the physical forms.

use crate::clause::{NullsOrder, OrderDirection, OrderSpec};
use crate::plan::SelectPlan;
use crate::select::{QuerySpec, Select};
use entkit_core::{SqlType, Value};
use std::fmt;

/// A query expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Logical path on an aliased entity (`m.name`, `m.home.city`, `m.team`)
    Path { alias: String, path: String },

    /// Physical column, optionally qualified by a table alias
    Column { table: Option<String>, name: String },

    /// Literal value
    Literal(Value),

    /// Named parameter, bound with `Select::bind`
    Param(String),

    /// Binary operation (e.g., a = b, a + b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (e.g., NOT a, -a)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// IN (list)
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// BETWEEN low AND high
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },

    /// LIKE with `%` and `_` wildcards
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },

    /// Aggregate call; `arg` is `None` for `count(*)`
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },

    /// Scalar subquery
    Subquery(Box<Subquery>),

    /// expr IN (subquery)
    InSubquery {
        expr: Box<Expr>,
        query: Box<Subquery>,
        negated: bool,
    },

    /// EXISTS (subquery)
    Exists { query: Box<Subquery>, negated: bool },

    /// CASE expression. With an `operand` each branch condition is a value
    /// compared for equality; without one each condition is a predicate.
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },

    /// CAST(expr AS type)
    Cast { expr: Box<Expr>, to: SqlType },

    /// Scalar function call
    Function { func: ScalarFunc, args: Vec<Expr> },
}

/// A nested query, before or after compilation.
#[derive(Debug, Clone)]
pub enum Subquery {
    Spec(QuerySpec),
    Plan(SelectPlan),
}

impl Subquery {
    /// The compiled plan, if this subquery has been compiled.
    pub fn plan(&self) -> Option<&SelectPlan> {
        match self {
            Subquery::Plan(plan) => Some(plan),
            Subquery::Spec(_) => None,
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// String concatenation
    Concat,
}

impl BinaryOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
        }
    }

    /// Whether the operator compares its operands.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub const fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFunc {
    pub const fn as_str(self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
            AggregateFunc::Max => "max",
            AggregateFunc::Min => "min",
        }
    }
}

/// Scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Lower,
    Upper,
    Trim,
    Length,
    /// `replace(text, from, to)`
    Replace,
}

impl ScalarFunc {
    pub const fn as_str(self) -> &'static str {
        match self {
            ScalarFunc::Lower => "lower",
            ScalarFunc::Upper => "upper",
            ScalarFunc::Trim => "trim",
            ScalarFunc::Length => "length",
            ScalarFunc::Replace => "replace",
        }
    }

    /// Number of arguments the function takes.
    pub const fn arity(self) -> usize {
        match self {
            ScalarFunc::Replace => 3,
            _ => 1,
        }
    }
}

/// A CASE expression under construction.
///
/// ```ignore
/// case_when(m.get("age").between(0, 20)).then("0~20")
///     .when(m.get("age").between(21, 30)).then("21~30")
///     .otherwise("other")
/// ```
#[derive(Debug, Clone)]
pub struct CaseBuilder {
    operand: Option<Box<Expr>>,
    branches: Vec<(Expr, Expr)>,
}

/// A WHEN condition waiting for its THEN result.
#[derive(Debug, Clone)]
#[must_use = "a WHEN needs a THEN"]
pub struct CaseWhen {
    case: CaseBuilder,
    condition: Expr,
}

impl CaseWhen {
    pub fn then(self, result: impl Into<Expr>) -> CaseBuilder {
        let mut case = self.case;
        case.branches.push((self.condition, result.into()));
        case
    }
}

impl CaseBuilder {
    pub fn when(self, condition: impl Into<Expr>) -> CaseWhen {
        CaseWhen {
            case: self,
            condition: condition.into(),
        }
    }

    /// Finish with an ELSE result.
    pub fn otherwise(self, result: impl Into<Expr>) -> Expr {
        Expr::Case {
            operand: self.operand,
            branches: self.branches,
            otherwise: Some(Box::new(result.into())),
        }
    }

    /// Finish without ELSE; unmatched rows yield NULL.
    pub fn end(self) -> Expr {
        Expr::Case {
            operand: self.operand,
            branches: self.branches,
            otherwise: None,
        }
    }
}

impl From<CaseBuilder> for Expr {
    fn from(case: CaseBuilder) -> Self {
        case.end()
    }
}

impl Expr {
    // ==================== Constructors ====================

    /// A path on an aliased entity.
    pub fn path(alias: impl Into<String>, path: impl Into<String>) -> Self {
        Expr::Path {
            alias: alias.into(),
            path: path.into(),
        }
    }

    /// An unqualified physical column.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// A physical column qualified by a table alias.
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    /// A literal value.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// The NULL literal.
    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    // ==================== Comparison ====================

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    // ==================== Logical ====================

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    /// AND-combine predicates, skipping `None`s. Returns `None` when nothing
    /// is left.
    pub fn all<I>(predicates: I) -> Option<Expr>
    where
        I: IntoIterator<Item = Option<Expr>>,
    {
        predicates.into_iter().flatten().reduce(Expr::and)
    }

    // ==================== Null checks ====================

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    // ==================== Pattern matching ====================

    /// LIKE with SQL wildcards.
    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: true,
        }
    }

    /// LIKE '%text%', with wildcards in `text` escaped.
    pub fn contains(self, text: impl AsRef<str>) -> Self {
        let pattern = format!("%{}%", escape_like(text.as_ref()));
        self.like(pattern)
    }

    /// LIKE 'text%', with wildcards in `text` escaped.
    pub fn starts_with(self, text: impl AsRef<str>) -> Self {
        let pattern = format!("{}%", escape_like(text.as_ref()));
        self.like(pattern)
    }

    /// LIKE '%text', with wildcards in `text` escaped.
    pub fn ends_with(self, text: impl AsRef<str>) -> Self {
        let pattern = format!("%{}", escape_like(text.as_ref()));
        self.like(pattern)
    }

    // ==================== Sets and ranges ====================

    pub fn in_list<T: Into<Expr>>(self, values: impl IntoIterator<Item = T>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in_list<T: Into<Expr>>(self, values: impl IntoIterator<Item = T>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: false,
        }
    }

    pub fn not_between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
            negated: true,
        }
    }

    /// `self IN (subquery)`.
    pub fn in_subquery<O>(self, query: Select<O>) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            query: Box::new(Subquery::Spec(query.into_spec())),
            negated: false,
        }
    }

    pub fn not_in_subquery<O>(self, query: Select<O>) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            query: Box::new(Subquery::Spec(query.into_spec())),
            negated: true,
        }
    }

    // ==================== Arithmetic ====================

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn modulo(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mod, other)
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    pub fn concat(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Concat, other)
    }

    // ==================== Functions and conversion ====================

    fn function(self, func: ScalarFunc, rest: Vec<Expr>) -> Self {
        let mut args = Vec::with_capacity(rest.len() + 1);
        args.push(self);
        args.extend(rest);
        Expr::Function { func, args }
    }

    pub fn lower(self) -> Self {
        self.function(ScalarFunc::Lower, Vec::new())
    }

    pub fn upper(self) -> Self {
        self.function(ScalarFunc::Upper, Vec::new())
    }

    pub fn trim(self) -> Self {
        self.function(ScalarFunc::Trim, Vec::new())
    }

    pub fn length(self) -> Self {
        self.function(ScalarFunc::Length, Vec::new())
    }

    /// Replace every occurrence of `from` with `to`.
    pub fn replace(self, from: impl Into<Expr>, to: impl Into<Expr>) -> Self {
        self.function(ScalarFunc::Replace, vec![from.into(), to.into()])
    }

    pub fn cast(self, to: SqlType) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            to,
        }
    }

    /// The value rendered as text, e.g. for concatenation.
    pub fn string_value(self) -> Self {
        self.cast(SqlType::Text)
    }

    /// Start a simple CASE on this value: `age.when(10).then("ten")`.
    pub fn when(self, value: impl Into<Expr>) -> CaseWhen {
        CaseBuilder {
            operand: Some(Box::new(self)),
            branches: Vec::new(),
        }
        .when(value)
    }

    // ==================== Aggregates ====================

    fn aggregate(self, func: AggregateFunc, distinct: bool) -> Self {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(self)),
            distinct,
        }
    }

    pub fn count(self) -> Self {
        self.aggregate(AggregateFunc::Count, false)
    }

    pub fn count_distinct(self) -> Self {
        self.aggregate(AggregateFunc::Count, true)
    }

    pub fn sum(self) -> Self {
        self.aggregate(AggregateFunc::Sum, false)
    }

    pub fn avg(self) -> Self {
        self.aggregate(AggregateFunc::Avg, false)
    }

    pub fn max(self) -> Self {
        self.aggregate(AggregateFunc::Max, false)
    }

    pub fn min(self) -> Self {
        self.aggregate(AggregateFunc::Min, false)
    }

    // ==================== Ordering ====================

    pub fn asc(self) -> OrderSpec {
        OrderSpec::new(self, OrderDirection::Asc)
    }

    pub fn desc(self) -> OrderSpec {
        OrderSpec::new(self, OrderDirection::Desc)
    }

    /// Ascending with explicit null placement.
    pub fn asc_nulls(self, nulls: NullsOrder) -> OrderSpec {
        OrderSpec::new(self, OrderDirection::Asc).nulls(nulls)
    }

    /// Descending with explicit null placement.
    pub fn desc_nulls(self, nulls: NullsOrder) -> OrderSpec {
        OrderSpec::new(self, OrderDirection::Desc).nulls(nulls)
    }

    // ==================== Inspection ====================

    /// Whether an aggregate appears anywhere outside nested subqueries.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }

    /// Visit this expression and its children, not descending into
    /// subqueries.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Direct operands of this expression. Subqueries are opaque.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Path { .. }
            | Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Param(_)
            | Expr::Subquery(_)
            | Expr::Exists { .. } => Vec::new(),
            Expr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::InSubquery { expr, .. } => {
                vec![expr.as_ref()]
            }
            Expr::In { expr, values, .. } => {
                let mut children = vec![expr.as_ref()];
                children.extend(values.iter());
                children
            }
            Expr::Between {
                expr, low, high, ..
            } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
            Expr::Like { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
            Expr::Aggregate { arg, .. } => arg.as_deref().into_iter().collect(),
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let mut children: Vec<&Expr> = operand.as_deref().into_iter().collect();
                for (condition, result) in branches {
                    children.push(condition);
                    children.push(result);
                }
                children.extend(otherwise.as_deref());
                children
            }
            Expr::Cast { expr, .. } => vec![expr.as_ref()],
            Expr::Function { args, .. } => args.iter().collect(),
        }
    }
}

/// A named parameter, bound later with `bind`.
pub fn param(name: impl Into<String>) -> Expr {
    Expr::Param(name.into())
}

/// A literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::lit(value)
}

/// `count(*)`.
pub fn count_all() -> Expr {
    Expr::Aggregate {
        func: AggregateFunc::Count,
        arg: None,
        distinct: false,
    }
}

/// Start a searched CASE: `case_when(predicate).then(result)`.
pub fn case_when(condition: impl Into<Expr>) -> CaseWhen {
    CaseBuilder {
        operand: None,
        branches: Vec::new(),
    }
    .when(condition)
}

/// A scalar subquery. It must project exactly one column.
pub fn subquery<O>(query: Select<O>) -> Expr {
    Expr::Subquery(Box::new(Subquery::Spec(query.into_spec())))
}

/// `EXISTS (subquery)`.
pub fn exists<O>(query: Select<O>) -> Expr {
    Expr::Exists {
        query: Box::new(Subquery::Spec(query.into_spec())),
        negated: false,
    }
}

/// `NOT EXISTS (subquery)`.
pub fn not_exists<O>(query: Select<O>) -> Expr {
    Expr::Exists {
        query: Box::new(Subquery::Spec(query.into_spec())),
        negated: true,
    }
}

/// Escape LIKE wildcards so `text` matches literally.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Path { alias, path } => write!(f, "{}.{}", alias, path),
            Expr::Column {
                table: Some(table),
                name,
            } => write!(f, "{}.{}", table, name),
            Expr::Column { table: None, name } => write!(f, "{}", name),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Param(name) => write!(f, ":{}", name),
            Expr::Binary { left, op, right } => write!(f, "({} {} {})", left, op.as_str(), right),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "NOT {}", expr),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-{}", expr),
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str(")")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{} {}LIKE {}",
                expr,
                if *negated { "NOT " } else { "" },
                pattern
            ),
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => {
                let distinct = if *distinct { "DISTINCT " } else { "" };
                match arg {
                    Some(arg) => write!(f, "{}({}{})", func.as_str(), distinct, arg),
                    None => write!(f, "{}(*)", func.as_str()),
                }
            }
            Expr::Subquery(_) => f.write_str("(subquery)"),
            Expr::InSubquery { expr, negated, .. } => write!(
                f,
                "{} {}IN (subquery)",
                expr,
                if *negated { "NOT " } else { "" }
            ),
            Expr::Exists { negated, .. } => {
                write!(f, "{}EXISTS (subquery)", if *negated { "NOT " } else { "" })
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                f.write_str("CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {}", operand)?;
                }
                for (condition, result) in branches {
                    write!(f, " WHEN {} THEN {}", condition, result)?;
                }
                if let Some(otherwise) = otherwise {
                    write!(f, " ELSE {}", otherwise)?;
                }
                f.write_str(" END")
            }
            Expr::Cast { expr, to } => write!(f, "CAST({} AS {})", expr, to.name()),
            Expr::Function { func, args } => {
                write!(f, "{}(", func.as_str())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

impl From<f64> for Expr {
    fn from(n: f64) -> Self {
        Expr::Literal(Value::Double(n))
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self {
        e.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_builds_binary() {
        let expr = Expr::path("m", "age").ge(20);
        match &expr {
            Expr::Binary { op, .. } => assert_eq!(*op, BinaryOp::Ge),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(expr.to_string(), "(m.age >= 20)");
    }

    #[test]
    fn test_all_skips_none() {
        assert!(Expr::all([None, None]).is_none());
        let name: Option<Expr> = Some(Expr::path("m", "name").eq("member1"));
        let age: Option<Expr> = None;
        let combined = Expr::all([name, age]).unwrap();
        assert_eq!(combined.to_string(), "(m.name = 'member1')");
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let expr = Expr::path("m", "name").contains("50%_off");
        match expr {
            Expr::Like { pattern, .. } => match *pattern {
                Expr::Literal(Value::Text(p)) => assert_eq!(p, "%50\\%\\_off%"),
                other => panic!("unexpected pattern: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_case_builders_render() {
        let simple = Expr::path("m", "age")
            .when(10)
            .then("ten")
            .when(20)
            .then("twenty")
            .otherwise("other");
        assert_eq!(
            simple.to_string(),
            "CASE m.age WHEN 10 THEN 'ten' WHEN 20 THEN 'twenty' ELSE 'other' END"
        );

        let searched = case_when(Expr::path("m", "age").between(0, 20)).then(2).end();
        assert_eq!(
            searched.to_string(),
            "CASE WHEN m.age BETWEEN 0 AND 20 THEN 2 END"
        );
        assert_eq!(searched.children().len(), 2);
    }

    #[test]
    fn test_functions_and_cast_render() {
        let expr = Expr::path("m", "name")
            .concat("_")
            .concat(Expr::path("m", "age").string_value());
        assert_eq!(expr.to_string(), "((m.name || '_') || CAST(m.age AS TEXT))");
        assert_eq!(
            Expr::path("m", "name").replace("member", "M").to_string(),
            "replace(m.name, 'member', 'M')"
        );
        assert!(Expr::path("m", "age").max().lower().contains_aggregate());
    }

    #[test]
    fn test_contains_aggregate_ignores_plain_paths() {
        assert!(Expr::path("m", "age").sum().add(1).contains_aggregate());
        assert!(!Expr::path("m", "age").add(1).contains_aggregate());
        assert!(count_all().contains_aggregate());
    }
}
