//! Expression evaluation with SQL three-valued logic.

use crate::store::{Database, Record};
use entkit_core::{Error, Result, SqlType, Value};
use entkit_query::compile::value_type;
use entkit_query::{AggregateFunc, BinaryOp, Expr, ScalarFunc, SelectPlan, Subquery, UnaryOp};
use regex::Regex;
use std::cmp::Ordering;

/// Alias bindings for one joined row; `None` is an unmatched left join.
pub(crate) type Env<'db> = Vec<(String, Option<&'db Record>)>;

/// The current row's bindings plus those of enclosing queries.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    pub env: &'a [(String, Option<&'a Record>)],
    pub outer: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    pub fn new(env: &'a [(String, Option<&'a Record>)], outer: Option<&'a Scope<'a>>) -> Self {
        Self { env, outer }
    }

    fn column(&self, table: Option<&str>, name: &str) -> Result<Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            for (alias, record) in current.env {
                if table.is_some_and(|t| t != alias) {
                    continue;
                }
                match record {
                    Some(record) => {
                        if let Some(value) = record.get(name) {
                            return Ok(value.clone());
                        }
                        if table.is_some() {
                            return Ok(Value::Null);
                        }
                    }
                    None if table.is_some() => return Ok(Value::Null),
                    None => {}
                }
            }
            scope = current.outer;
        }
        match table {
            Some(table) => Err(Error::executor(format!("unknown alias '{}'", table))),
            // Unqualified columns absent from every row read as NULL.
            None => Ok(Value::Null),
        }
    }
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn from_truth(value: Option<bool>) -> Value {
    value.map_or(Value::Null, Value::Bool)
}

/// Whether a predicate value selects the row.
pub(crate) fn is_true(value: &Value) -> bool {
    truth(value) == Some(true)
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (i64::from(*a), i64::from(*b));
        return Ok(match integer_op(op, a, b) {
            Some(n) => i32::try_from(n).map_or(Value::BigInt(n), Value::Int),
            None => Value::Null,
        });
    }
    if let (Some(a), Some(b)) = (int_of(left), int_of(right)) {
        return Ok(integer_op(op, a, b).map_or(Value::Null, Value::BigInt));
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(match op {
            BinaryOp::Add => Value::Double(a + b),
            BinaryOp::Sub => Value::Double(a - b),
            BinaryOp::Mul => Value::Double(a * b),
            BinaryOp::Div if b == 0.0 => Value::Null,
            BinaryOp::Div => Value::Double(a / b),
            BinaryOp::Mod if b == 0.0 => Value::Null,
            _ => Value::Double(a % b),
        }),
        _ => Err(Error::executor(format!(
            "cannot apply {} to {} and {}",
            op.as_str(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(_) | Value::BigInt(_) => value.as_i64(),
        _ => None,
    }
}

fn integer_op(op: BinaryOp, a: i64, b: i64) -> Option<i64> {
    match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => a.checked_div(b),
        _ => a.checked_rem(b),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Value {
    if op == BinaryOp::Eq || op == BinaryOp::Ne {
        let eq = left.sql_eq(right);
        return from_truth(if op == BinaryOp::Eq { eq } else { eq.map(|e| !e) });
    }
    from_truth(left.sql_cmp(right).map(|ord| match op {
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Le => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
    }))
}

/// SQL `x IN (...)`: true on a match, NULL if unmatched with NULLs around.
fn membership(value: &Value, candidates: &[Value], negated: bool) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    let mut saw_null = false;
    for candidate in candidates {
        match value.sql_eq(candidate) {
            Some(true) => return Value::Bool(!negated),
            Some(false) => {}
            None => saw_null = true,
        }
    }
    if saw_null {
        Value::Null
    } else {
        Value::Bool(negated)
    }
}

fn cast(value: &Value, to: SqlType) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let converted = match to {
        SqlType::Text => Some(Value::Text(plain(value))),
        SqlType::Integer => integer_of(value)
            .and_then(|n| i32::try_from(n).ok())
            .map(Value::Int),
        SqlType::BigInt => integer_of(value).map(Value::BigInt),
        SqlType::Double => match value {
            Value::Text(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }
        .map(Value::Double),
        SqlType::Boolean => match value {
            Value::Text(s) => s.trim().parse().ok(),
            other => other.as_bool(),
        }
        .map(Value::Bool),
        _ => value_type(value)
            .filter(|t| t.is_compatible_with(&to))
            .map(|_| value.clone()),
    };
    converted.ok_or_else(|| Error::executor(format!("cannot cast {} to {}", value, to.name())))
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Text(s) => s.trim().parse().ok(),
        Value::Double(d) if d.is_finite() => Some(d.trunc() as i64),
        other => other.as_i64(),
    }
}

fn scalar(func: ScalarFunc, args: &[Value]) -> Result<Value> {
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let texts = args
        .iter()
        .map(|arg| {
            arg.as_str().ok_or_else(|| {
                Error::executor(format!("{} needs text, got {}", func.as_str(), arg.type_name()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(match (func, texts.as_slice()) {
        (ScalarFunc::Lower, [text]) => Value::Text(text.to_lowercase()),
        (ScalarFunc::Upper, [text]) => Value::Text(text.to_uppercase()),
        (ScalarFunc::Trim, [text]) => Value::Text(text.trim().to_string()),
        (ScalarFunc::Length, [text]) => {
            i32::try_from(text.chars().count()).map_or(Value::Null, Value::Int)
        }
        (ScalarFunc::Replace, [text, from, _]) if from.is_empty() => Value::Text(text.to_string()),
        (ScalarFunc::Replace, [text, from, to]) => Value::Text(text.replace(from, to)),
        _ => {
            return Err(Error::executor(format!(
                "{} called with {} argument(s)",
                func.as_str(),
                args.len()
            )));
        }
    })
}

/// Translate a LIKE pattern (`%`, `_`, `\` escapes) into an anchored regex.
pub(crate) fn like_regex(pattern: &str) -> Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    translated.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated).map_err(|e| Error::executor(format!("bad LIKE pattern: {}", e)))
}

/// Rebuild `expr`, letting `replace` substitute any node.
pub(crate) fn rewrite(
    expr: &Expr,
    replace: &mut impl FnMut(&Expr) -> Result<Option<Expr>>,
) -> Result<Expr> {
    if let Some(replacement) = replace(expr)? {
        return Ok(replacement);
    }
    let mut child = |e: &Expr| rewrite(e, replace).map(Box::new);
    Ok(match expr {
        Expr::Binary { left, op, right } => Expr::Binary {
            left: child(left)?,
            op: *op,
            right: child(right)?,
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: child(expr)?,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: child(expr)?,
            negated: *negated,
        },
        Expr::In {
            expr,
            values,
            negated,
        } => {
            let expr = child(expr)?;
            let values = values
                .iter()
                .map(|v| child(v).map(|b| *b))
                .collect::<Result<Vec<_>>>()?;
            Expr::In {
                expr,
                values,
                negated: *negated,
            }
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: child(expr)?,
            low: child(low)?,
            high: child(high)?,
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: child(expr)?,
            pattern: child(pattern)?,
            negated: *negated,
        },
        Expr::InSubquery {
            expr,
            query,
            negated,
        } => Expr::InSubquery {
            expr: child(expr)?,
            query: query.clone(),
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            let operand = operand.as_deref().map(&mut child).transpose()?;
            let mut rewritten = Vec::with_capacity(branches.len());
            for (condition, result) in branches {
                rewritten.push((*child(condition)?, *child(result)?));
            }
            let otherwise = otherwise.as_deref().map(&mut child).transpose()?;
            Expr::Case {
                operand,
                branches: rewritten,
                otherwise,
            }
        }
        Expr::Cast { expr, to } => Expr::Cast {
            expr: child(expr)?,
            to: *to,
        },
        Expr::Function { func, args } => Expr::Function {
            func: *func,
            args: args
                .iter()
                .map(|a| child(a).map(|b| *b))
                .collect::<Result<Vec<_>>>()?,
        },
        other => other.clone(),
    })
}

/// Evaluates plans and expressions against a database snapshot.
pub(crate) struct Interpreter<'db> {
    pub db: &'db Database,
}

impl<'db> Interpreter<'db> {
    pub fn new(db: &'db Database) -> Self {
        Self { db }
    }

    pub fn eval(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value> {
        match expr {
            Expr::Column { table, name } => scope.column(table.as_deref(), name),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path { alias, path } => Err(Error::executor(format!(
                "uncompiled path {}.{} reached the executor",
                alias, path
            ))),
            Expr::Param(name) => Err(Error::executor(format!(
                "unbound parameter :{} reached the executor",
                name
            ))),
            Expr::Binary { left, op, right } => match op {
                BinaryOp::And => {
                    let l = truth(&self.eval(left, scope)?);
                    if l == Some(false) {
                        return Ok(Value::Bool(false));
                    }
                    let r = truth(&self.eval(right, scope)?);
                    Ok(match (l, r) {
                        (_, Some(false)) => Value::Bool(false),
                        (Some(true), Some(true)) => Value::Bool(true),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Or => {
                    let l = truth(&self.eval(left, scope)?);
                    if l == Some(true) {
                        return Ok(Value::Bool(true));
                    }
                    let r = truth(&self.eval(right, scope)?);
                    Ok(match (l, r) {
                        (_, Some(true)) => Value::Bool(true),
                        (Some(false), Some(false)) => Value::Bool(false),
                        _ => Value::Null,
                    })
                }
                BinaryOp::Concat => {
                    let (l, r) = (self.eval(left, scope)?, self.eval(right, scope)?);
                    Ok(match (l.as_str(), r.as_str()) {
                        (Some(a), Some(b)) => Value::Text(format!("{}{}", a, b)),
                        _ if l.is_null() || r.is_null() => Value::Null,
                        _ => Value::Text(format!("{}{}", plain(&l), plain(&r))),
                    })
                }
                op if op.is_comparison() => {
                    Ok(compare(*op, &self.eval(left, scope)?, &self.eval(right, scope)?))
                }
                op => arithmetic(*op, &self.eval(left, scope)?, &self.eval(right, scope)?),
            },
            Expr::Unary { op, expr } => {
                let value = self.eval(expr, scope)?;
                match op {
                    UnaryOp::Not => Ok(from_truth(truth(&value).map(|b| !b))),
                    UnaryOp::Neg => arithmetic(BinaryOp::Sub, &Value::BigInt(0), &value),
                }
            }
            Expr::IsNull { expr, negated } => {
                Ok(Value::Bool(self.eval(expr, scope)?.is_null() != *negated))
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                let value = self.eval(expr, scope)?;
                let candidates = values
                    .iter()
                    .map(|v| self.eval(v, scope))
                    .collect::<Result<Vec<_>>>()?;
                Ok(membership(&value, &candidates, *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = self.eval(expr, scope)?;
                let lo = compare(BinaryOp::Ge, &value, &self.eval(low, scope)?);
                let hi = compare(BinaryOp::Le, &value, &self.eval(high, scope)?);
                let within = match (truth(&lo), truth(&hi)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                };
                Ok(from_truth(within.map(|w| w != *negated)))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let value = self.eval(expr, scope)?;
                let pattern = self.eval(pattern, scope)?;
                match (value.as_str(), pattern.as_str()) {
                    (Some(text), Some(pattern)) => {
                        let matched = like_regex(pattern)?.is_match(text);
                        Ok(Value::Bool(matched != *negated))
                    }
                    _ => Ok(Value::Null),
                }
            }
            Expr::Aggregate { .. } => Err(Error::executor(format!(
                "aggregate {} evaluated outside a group",
                expr
            ))),
            Expr::Subquery(query) => {
                let rows = self.subquery(query, scope)?;
                if rows.len() > 1 {
                    return Err(Error::executor(format!(
                        "scalar subquery returned {} rows",
                        rows.len()
                    )));
                }
                Ok(rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_iter().next())
                    .unwrap_or(Value::Null))
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let value = self.eval(expr, scope)?;
                let candidates: Vec<Value> = self
                    .subquery(query, scope)?
                    .into_iter()
                    .filter_map(|row| row.into_iter().next())
                    .collect();
                Ok(membership(&value, &candidates, *negated))
            }
            Expr::Exists { query, negated } => {
                let found = !self.subquery(query, scope)?.is_empty();
                Ok(Value::Bool(found != *negated))
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let operand = match operand {
                    Some(operand) => Some(self.eval(operand, scope)?),
                    None => None,
                };
                for (condition, result) in branches {
                    let value = self.eval(condition, scope)?;
                    let matched = match &operand {
                        Some(operand) => operand.sql_eq(&value) == Some(true),
                        None => is_true(&value),
                    };
                    if matched {
                        return self.eval(result, scope);
                    }
                }
                match otherwise {
                    Some(otherwise) => self.eval(otherwise, scope),
                    None => Ok(Value::Null),
                }
            }
            Expr::Cast { expr, to } => cast(&self.eval(expr, scope)?, *to),
            Expr::Function { func, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, scope))
                    .collect::<Result<Vec<_>>>()?;
                scalar(*func, &values)
            }
        }
    }

    fn subquery(&self, query: &Subquery, scope: &Scope<'_>) -> Result<Vec<Vec<Value>>> {
        let plan: &SelectPlan = query
            .plan()
            .ok_or_else(|| Error::executor("uncompiled subquery reached the executor"))?;
        self.select_values(plan, Some(scope))
    }

    /// Evaluate `expr` over a group of rows, computing aggregates.
    pub fn eval_group(
        &self,
        expr: &Expr,
        group: &[Env<'db>],
        representative: &Scope<'_>,
    ) -> Result<Value> {
        let folded = rewrite(expr, &mut |node| match node {
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => self
                .aggregate(*func, arg.as_deref(), *distinct, group, representative.outer)
                .map(|v| Some(Expr::Literal(v))),
            _ => Ok(None),
        })?;
        self.eval(&folded, representative)
    }

    fn aggregate(
        &self,
        func: AggregateFunc,
        arg: Option<&Expr>,
        distinct: bool,
        group: &[Env<'db>],
        outer: Option<&Scope<'_>>,
    ) -> Result<Value> {
        let Some(arg) = arg else {
            return Ok(Value::BigInt(group.len() as i64));
        };
        let mut values = Vec::with_capacity(group.len());
        for env in group {
            let value = self.eval(arg, &Scope::new(env, outer))?;
            if value.is_null() {
                continue;
            }
            if distinct && values.iter().any(|v: &Value| v.sql_eq(&value) == Some(true)) {
                continue;
            }
            values.push(value);
        }

        Ok(match func {
            AggregateFunc::Count => Value::BigInt(values.len() as i64),
            AggregateFunc::Max => values
                .into_iter()
                .max_by(Value::sort_cmp)
                .unwrap_or(Value::Null),
            AggregateFunc::Min => values
                .into_iter()
                .min_by(Value::sort_cmp)
                .unwrap_or(Value::Null),
            AggregateFunc::Sum => {
                if values.is_empty() {
                    Value::Null
                } else if values.iter().all(|v| int_of(v).is_some()) {
                    let total = values.iter().filter_map(int_of).try_fold(0i64, i64::checked_add);
                    total.map_or(Value::Null, Value::BigInt)
                } else {
                    Value::Double(values.iter().filter_map(Value::as_f64).sum())
                }
            }
            AggregateFunc::Avg => {
                if values.is_empty() {
                    Value::Null
                } else {
                    let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                    Value::Double(total / values.len() as f64)
                }
            }
        })
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_three_valued_logic() {
        let db = Database::default();
        let it = Interpreter::new(&db);
        let row = record(&[("age", Value::Null), ("name", Value::Text("a".into()))]);
        let env: Env<'_> = vec![("m".into(), Some(&row))];
        let scope = Scope::new(&env, None);

        let unknown = Expr::qualified("m", "age").gt(10);
        assert_eq!(it.eval(&unknown, &scope).unwrap(), Value::Null);
        let or_true = unknown.clone().or(Expr::qualified("m", "name").eq("a"));
        assert_eq!(it.eval(&or_true, &scope).unwrap(), Value::Bool(true));
        let and_false = unknown.and(Expr::lit(false));
        assert_eq!(it.eval(&and_false, &scope).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_case_picks_first_matching_branch() {
        let db = Database::default();
        let it = Interpreter::new(&db);
        let rank = |age: Value| {
            let row = record(&[("age", age)]);
            let env: Env<'_> = vec![("m".into(), Some(&row))];
            let age = Expr::qualified("m", "age");
            let case = entkit_query::case_when(age.clone().between(0, 20))
                .then(2)
                .when(age.between(21, 30))
                .then(1)
                .otherwise(3);
            it.eval(&case, &Scope::new(&env, None)).unwrap()
        };
        assert_eq!(rank(Value::Int(10)), Value::Int(2));
        assert_eq!(rank(Value::Int(30)), Value::Int(1));
        assert_eq!(rank(Value::Int(40)), Value::Int(3));
        // An unknown condition does not match, so NULL falls to ELSE.
        assert_eq!(rank(Value::Null), Value::Int(3));

        let row = record(&[("age", Value::Int(20))]);
        let env: Env<'_> = vec![("m".into(), Some(&row))];
        let simple = Expr::qualified("m", "age")
            .when(10)
            .then("ten")
            .when(20)
            .then("twenty")
            .end();
        assert_eq!(
            it.eval(&simple, &Scope::new(&env, None)).unwrap(),
            Value::Text("twenty".into())
        );
    }

    #[test]
    fn test_cast_and_text_functions() {
        assert_eq!(cast(&Value::Int(10), SqlType::Text).unwrap(), Value::Text("10".into()));
        assert_eq!(cast(&Value::Text(" 42 ".into()), SqlType::BigInt).unwrap(), Value::BigInt(42));
        assert_eq!(cast(&Value::Null, SqlType::Integer).unwrap(), Value::Null);
        assert!(cast(&Value::Text("ten".into()), SqlType::Integer).is_err());

        let name = Value::Text("Member1".into());
        assert_eq!(
            scalar(ScalarFunc::Lower, &[name.clone()]).unwrap(),
            Value::Text("member1".into())
        );
        assert_eq!(
            scalar(
                ScalarFunc::Replace,
                &[name, Value::Text("Member".into()), Value::Text("M".into())]
            )
            .unwrap(),
            Value::Text("M1".into())
        );
        assert_eq!(scalar(ScalarFunc::Upper, &[Value::Null]).unwrap(), Value::Null);
        assert!(scalar(ScalarFunc::Upper, &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_like_escapes() {
        assert!(like_regex("50\\%%").unwrap().is_match("50% off"));
        assert!(!like_regex("50\\%%").unwrap().is_match("500 off"));
        assert!(like_regex("m_mber%").unwrap().is_match("member1"));
    }

    #[test]
    fn test_in_list_with_null_is_unknown() {
        assert_eq!(
            membership(&Value::Int(3), &[Value::Int(1), Value::Null], false),
            Value::Null
        );
        assert_eq!(
            membership(&Value::Int(1), &[Value::Int(1), Value::Null], false),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_integer_arithmetic_keeps_width() {
        assert_eq!(
            arithmetic(BinaryOp::Mul, &Value::Int(4), &Value::Int(5)).unwrap(),
            Value::Int(20)
        );
        assert_eq!(
            arithmetic(BinaryOp::Div, &Value::BigInt(4), &Value::Int(0)).unwrap(),
            Value::Null
        );
        assert_eq!(
            arithmetic(BinaryOp::Add, &Value::Int(1), &Value::Double(0.5)).unwrap(),
            Value::Double(1.5)
        );
    }
}
