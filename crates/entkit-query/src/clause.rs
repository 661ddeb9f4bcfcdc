//! ORDER BY clause types.

use crate::expr::Expr;
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// NULLS FIRST/LAST ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// One ORDER BY key.
///
/// Without an explicit null ordering NULL sorts as the largest value: last
/// when ascending, first when descending.
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub expr: Expr,
    pub direction: OrderDirection,
    pub nulls: Option<NullsOrder>,
}

impl OrderSpec {
    pub fn new(expr: Expr, direction: OrderDirection) -> Self {
        Self {
            expr,
            direction,
            nulls: None,
        }
    }

    /// Set explicit null placement.
    pub fn nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = Some(nulls);
        self
    }

    /// Set NULLS FIRST.
    pub fn nulls_first(self) -> Self {
        self.nulls(NullsOrder::First)
    }

    /// Set NULLS LAST.
    pub fn nulls_last(self) -> Self {
        self.nulls(NullsOrder::Last)
    }

    /// The effective null placement.
    pub fn null_placement(&self) -> NullsOrder {
        match (self.nulls, self.direction) {
            (Some(nulls), _) => nulls,
            (None, OrderDirection::Asc) => NullsOrder::Last,
            (None, OrderDirection::Desc) => NullsOrder::First,
        }
    }

    /// Compare two sort keys under this spec's direction and null placement.
    pub fn compare(&self, a: &entkit_core::Value, b: &entkit_core::Value) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match self.null_placement() {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            },
            (false, true) => match self.null_placement() {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            },
            (false, false) => {
                let ord = a.sort_cmp(b);
                match self.direction {
                    OrderDirection::Asc => ord,
                    OrderDirection::Desc => ord.reverse(),
                }
            }
        }
    }

    /// Apply `f` to the key expression.
    pub fn map_expr(self, f: impl FnOnce(Expr) -> Expr) -> Self {
        Self {
            expr: f(self.expr),
            direction: self.direction,
            nulls: self.nulls,
        }
    }
}

impl From<Expr> for OrderSpec {
    fn from(expr: Expr) -> Self {
        OrderSpec::new(expr, OrderDirection::Asc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entkit_core::Value;

    #[test]
    fn test_default_null_placement_follows_direction() {
        let asc = Expr::col("age").asc();
        let desc = Expr::col("age").desc();
        assert_eq!(asc.null_placement(), NullsOrder::Last);
        assert_eq!(desc.null_placement(), NullsOrder::First);
        assert_eq!(desc.nulls_last().null_placement(), NullsOrder::Last);
    }

    #[test]
    fn test_compare_desc_with_nulls_last() {
        let spec = Expr::col("age").desc().nulls_last();
        let mut values = vec![Value::Int(10), Value::Null, Value::Int(30)];
        values.sort_by(|a, b| spec.compare(a, b));
        assert_eq!(values, vec![Value::Int(30), Value::Int(10), Value::Null]);
    }

    #[test]
    fn test_compare_asc_nulls_first() {
        let spec = Expr::col("name").asc().nulls_first();
        assert_eq!(
            spec.compare(&Value::Null, &Value::Text("a".into())),
            Ordering::Less
        );
    }
}
