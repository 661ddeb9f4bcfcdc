//! INSERT, UPDATE and DELETE against the store.

use crate::eval::{Env, Interpreter, Scope, is_true};
use crate::store::{Database, Record};
use entkit_core::{Result, Value};
use entkit_query::{DeleteStatement, Expr, InsertStatement, UpdateStatement};

fn matches(
    interpreter: &Interpreter<'_>,
    alias: &str,
    record: &Record,
    filter: Option<&Expr>,
) -> Result<bool> {
    let Some(filter) = filter else {
        return Ok(true);
    };
    let env: Env<'_> = vec![(alias.to_string(), Some(record))];
    Ok(is_true(&interpreter.eval(filter, &Scope::new(&env, None))?))
}

pub(crate) fn insert(db: &mut Database, statement: &InsertStatement) -> Result<u64> {
    let record: Record = statement
        .values
        .iter()
        .map(|(column, value)| ((*column).to_string(), value.clone()))
        .collect();
    db.insert(statement.table, record)?;
    Ok(1)
}

pub(crate) fn update(db: &mut Database, statement: &UpdateStatement) -> Result<u64> {
    let alias = statement.alias.as_deref().unwrap_or(statement.table);
    let mut changes: Vec<(usize, Record)> = Vec::new();
    {
        let interpreter = Interpreter::new(db);
        for (index, record) in db.rows(statement.table).iter().enumerate() {
            if !matches(&interpreter, alias, record, statement.filter.as_ref())? {
                continue;
            }
            let env: Env<'_> = vec![(alias.to_string(), Some(record))];
            let scope = Scope::new(&env, None);
            let mut updated = record.clone();
            // Every assignment sees the row as it was before the update.
            for (column, expr) in &statement.assignments {
                updated.insert((*column).to_string(), interpreter.eval(expr, &scope)?);
            }
            changes.push((index, updated));
        }
    }

    for (_, record) in &changes {
        db.check_references(statement.table, record)?;
    }
    let table = db.table_mut(statement.table);
    for (index, record) in &changes {
        table.rows[*index] = record.clone();
    }
    Ok(changes.len() as u64)
}

pub(crate) fn delete(db: &mut Database, statement: &DeleteStatement) -> Result<u64> {
    let alias = statement.alias.as_deref().unwrap_or(statement.table);
    let mut doomed = Vec::new();
    {
        let interpreter = Interpreter::new(db);
        for (index, record) in db.rows(statement.table).iter().enumerate() {
            if matches(&interpreter, alias, record, statement.filter.as_ref())? {
                doomed.push(index);
            }
        }
    }
    if doomed.is_empty() {
        return Ok(0);
    }

    let original = db.rows(statement.table).to_vec();
    let mut removed = Vec::with_capacity(doomed.len());
    let mut kept = Vec::with_capacity(original.len() - doomed.len());
    for (index, record) in original.iter().enumerate() {
        if doomed.binary_search(&index).is_ok() {
            removed.push(record.clone());
        } else {
            kept.push(record.clone());
        }
    }
    db.table_mut(statement.table).rows = kept;

    for record in &removed {
        if let Err(e) = db.check_not_referenced(statement.table, record) {
            db.table_mut(statement.table).rows = original;
            return Err(e);
        }
    }
    Ok(removed.len() as u64)
}

/// Read one column of every row, for inspection.
pub(crate) fn column_values(db: &Database, table: &str, column: &str) -> Vec<Value> {
    db.rows(table)
        .iter()
        .map(|r| r.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}
