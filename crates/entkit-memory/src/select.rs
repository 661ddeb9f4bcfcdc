//! SELECT evaluation: joins, filtering, grouping, ordering and paging.

use crate::eval::{Env, Interpreter, Scope, is_true};
use crate::store::Record;
use entkit_core::{ColumnInfo, Result, Row, Value, hash_values};
use entkit_query::SelectPlan;
use std::collections::HashMap;
use std::sync::Arc;

/// One output row before ordering, with its evaluated sort keys.
struct Output {
    values: Vec<Value>,
    keys: Vec<Value>,
}

fn same(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.sort_cmp(y) == std::cmp::Ordering::Equal)
}

/// Groups in first-seen order, bucketed by key hash.
#[derive(Default)]
struct Groups<'db> {
    buckets: HashMap<u64, Vec<usize>>,
    groups: Vec<(Vec<Value>, Vec<Env<'db>>)>,
}

impl<'db> Groups<'db> {
    fn add(&mut self, key: Vec<Value>, env: Env<'db>) {
        let bucket = self.buckets.entry(hash_values(&key)).or_default();
        for &index in bucket.iter() {
            if same(&self.groups[index].0, &key) {
                self.groups[index].1.push(env);
                return;
            }
        }
        bucket.push(self.groups.len());
        self.groups.push((key, vec![env]));
    }
}

impl<'db> Interpreter<'db> {
    /// Rows produced by FROM and JOIN, before filtering.
    fn joined(&self, plan: &SelectPlan, outer: Option<&Scope<'_>>) -> Result<Vec<Env<'db>>> {
        let mut envs: Vec<Env<'db>> = self
            .db
            .rows(plan.from.table)
            .iter()
            .map(|record| vec![(plan.from.alias.clone(), Some(record))])
            .collect();

        for join in &plan.joins {
            let candidates: &'db [Record] = self.db.rows(join.table.table);
            let mut next = Vec::new();
            for env in envs {
                let mut matched = false;
                for record in candidates {
                    let mut candidate = env.clone();
                    candidate.push((join.table.alias.clone(), Some(record)));
                    if is_true(&self.eval(&join.on, &Scope::new(&candidate, outer))?) {
                        matched = true;
                        next.push(candidate);
                    }
                }
                if !matched && join.kind == entkit_query::JoinKind::Left {
                    let mut padded = env;
                    padded.push((join.table.alias.clone(), None));
                    next.push(padded);
                }
            }
            envs = next;
        }
        Ok(envs)
    }

    fn empty_env(plan: &SelectPlan) -> Env<'db> {
        std::iter::once(&plan.from.alias)
            .chain(plan.joins.iter().map(|j| &j.table.alias))
            .map(|alias| (alias.clone(), None))
            .collect()
    }

    /// Evaluate a plan to raw value rows.
    pub fn select_values(
        &self,
        plan: &SelectPlan,
        outer: Option<&Scope<'_>>,
    ) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        for env in self.joined(plan, outer)? {
            if let Some(filter) = &plan.filter {
                if !is_true(&self.eval(filter, &Scope::new(&env, outer))?) {
                    continue;
                }
            }
            rows.push(env);
        }

        let mut outputs = if plan.is_aggregate() {
            self.aggregate_rows(plan, rows, outer)?
        } else {
            let mut outputs = Vec::with_capacity(rows.len());
            for env in &rows {
                let scope = Scope::new(env, outer);
                let values = plan
                    .projections
                    .iter()
                    .map(|c| self.eval(&c.expr, &scope))
                    .collect::<Result<Vec<_>>>()?;
                let keys = plan
                    .order_by
                    .iter()
                    .map(|o| self.eval(&o.expr, &scope))
                    .collect::<Result<Vec<_>>>()?;
                outputs.push(Output { values, keys });
            }
            outputs
        };

        if plan.distinct {
            let mut seen: Vec<Output> = Vec::with_capacity(outputs.len());
            for output in outputs {
                if !seen.iter().any(|s| same(&s.values, &output.values)) {
                    seen.push(output);
                }
            }
            outputs = seen;
        }

        if !plan.order_by.is_empty() {
            outputs.sort_by(|a, b| {
                plan.order_by
                    .iter()
                    .zip(a.keys.iter().zip(&b.keys))
                    .map(|(spec, (x, y))| spec.compare(x, y))
                    .find(|ord| ord.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let offset = usize::try_from(plan.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = plan
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(outputs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|o| o.values)
            .collect())
    }

    fn aggregate_rows(
        &self,
        plan: &SelectPlan,
        rows: Vec<Env<'db>>,
        outer: Option<&Scope<'_>>,
    ) -> Result<Vec<Output>> {
        let mut groups = Groups::default();
        for env in rows {
            let scope = Scope::new(&env, outer);
            let key = plan
                .group_by
                .iter()
                .map(|e| self.eval(e, &scope))
                .collect::<Result<Vec<_>>>()?;
            groups.add(key, env);
        }
        // Aggregating an empty input without GROUP BY still yields one row.
        if groups.groups.is_empty() && plan.group_by.is_empty() {
            groups.groups.push((Vec::new(), Vec::new()));
        }

        let empty = Self::empty_env(plan);
        let mut outputs = Vec::with_capacity(groups.groups.len());
        for (_, members) in &groups.groups {
            let representative = Scope::new(members.first().unwrap_or(&empty), outer);
            if let Some(having) = &plan.having {
                if !is_true(&self.eval_group(having, members, &representative)?) {
                    continue;
                }
            }
            let values = plan
                .projections
                .iter()
                .map(|c| self.eval_group(&c.expr, members, &representative))
                .collect::<Result<Vec<_>>>()?;
            let keys = plan
                .order_by
                .iter()
                .map(|o| self.eval_group(&o.expr, members, &representative))
                .collect::<Result<Vec<_>>>()?;
            outputs.push(Output { values, keys });
        }
        Ok(outputs)
    }

    /// Evaluate a top-level plan to labelled rows.
    pub fn select(&self, plan: &SelectPlan) -> Result<Vec<Row>> {
        let columns = Arc::new(ColumnInfo::new(plan.labels()));
        Ok(self
            .select_values(plan, None)?
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect())
    }
}
