//! In-memory executor
//!
//! Evaluates [`SelectStatement`]s against tables of rows held in memory. Every
//! executed statement is recorded so callers can assert on query counts and
//! shapes. Used by the test suite and benches, and handy for downstream
//! fixtures that need a store without a database.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SqlExecutor;
use crate::error::{OrmError, OrmResult};
use crate::query::{ColumnRef, JoinType, OrderDirection, SelectStatement};
use crate::value::{DatabaseValue, Row};

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    executed: Vec<SelectStatement>,
    fail_next: Option<String>,
}

/// Table rows bound to the aliases of one statement
type Bindings<'a> = Vec<(&'a str, Option<&'a Row>)>;

/// [`SqlExecutor`] over in-memory tables
#[derive(Debug, Default)]
pub struct InMemoryExecutor {
    state: Mutex<MemoryState>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows to a table, creating it if needed
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn insert(&self, table: &str, row: Row) {
        self.insert_rows(table, vec![row]);
    }

    /// Set one column on every row whose `id` equals `id`; returns rows touched
    pub fn update_column(&self, table: &str, id: &DatabaseValue, column: &str, value: DatabaseValue) -> usize {
        let mut state = self.state.lock();
        let Some(rows) = state.tables.get_mut(table) else {
            return 0;
        };
        let mut touched = 0;
        for row in rows.iter_mut().filter(|row| row.get_or_null("id").sql_eq(id)) {
            row.insert(column, value.clone());
            touched += 1;
        }
        touched
    }

    /// Make the next executed statement fail with a database error
    pub fn fail_next(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Statements executed so far, oldest first
    pub fn executed(&self) -> Vec<SelectStatement> {
        self.state.lock().executed.clone()
    }

    /// Inlined SQL of the statements executed so far
    pub fn executed_sql(&self) -> Vec<String> {
        self.state.lock().executed.iter().map(|s| s.to_sql()).collect()
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().executed.len()
    }

    pub fn clear_log(&self) {
        self.state.lock().executed.clear();
    }

    fn evaluate(state: &MemoryState, statement: &SelectStatement) -> OrmResult<Vec<Row>> {
        let root_rows = table_rows(state, &statement.from.table)?;
        let root_alias = statement.from.alias.as_str();

        let mut tuples: Vec<Bindings<'_>> = root_rows
            .iter()
            .map(|row| vec![(root_alias, Some(row))])
            .collect();

        for join in &statement.joins {
            let candidates = table_rows(state, &join.table.table)?;
            let alias = join.table.alias.as_str();
            let mut joined = Vec::new();

            for tuple in tuples {
                let mut matched = false;
                for candidate in candidates {
                    let mut extended = tuple.clone();
                    extended.push((alias, Some(candidate)));
                    let mut on_matches = true;
                    for (left, right) in &join.on_conditions {
                        if !resolve(&extended, left)?.sql_eq(&resolve(&extended, right)?) {
                            on_matches = false;
                            break;
                        }
                    }
                    if on_matches {
                        matched = true;
                        joined.push(extended);
                    }
                }
                if !matched && join.join_type == JoinType::Left {
                    let mut extended = tuple;
                    extended.push((alias, None));
                    joined.push(extended);
                }
            }
            tuples = joined;
        }

        let mut filtered = Vec::new();
        for tuple in tuples {
            let mut keep = true;
            for condition in &statement.where_conditions {
                let value = resolve(&tuple, &condition.column)?;
                if !condition.operator.matches(&value, &condition.values) {
                    keep = false;
                    break;
                }
            }
            if keep {
                filtered.push(tuple);
            }
        }

        let mut sort_error = None;
        filtered.sort_by(|a, b| {
            for (column, direction) in &statement.order_by {
                let (left, right) = match (resolve(a, column), resolve(b, column)) {
                    (Ok(left), Ok(right)) => (left, right),
                    (Err(e), _) | (_, Err(e)) => {
                        sort_error.get_or_insert(e);
                        return Ordering::Equal;
                    }
                };
                let ordering = compare_nulls_last(&left, &right);
                let ordering = match direction {
                    OrderDirection::Asc => ordering,
                    OrderDirection::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        if let Some(e) = sort_error {
            return Err(e);
        }

        let mut rows: Vec<Row> = Vec::with_capacity(filtered.len());
        for tuple in &filtered {
            if let Some((_, Some(row))) = tuple.first() {
                if statement.distinct && rows.iter().any(|existing| existing == *row) {
                    continue;
                }
                rows.push((*row).clone());
            }
        }
        Ok(rows)
    }
}

fn table_rows<'a>(state: &'a MemoryState, table: &str) -> OrmResult<&'a Vec<Row>> {
    state
        .tables
        .get(table)
        .ok_or_else(|| OrmError::Database(format!("relation \"{}\" does not exist", table)))
}

fn resolve(tuple: &Bindings<'_>, column: &ColumnRef) -> OrmResult<DatabaseValue> {
    match tuple.iter().find(|(alias, _)| *alias == column.alias) {
        Some((_, Some(row))) => Ok(row.get_or_null(&column.column)),
        Some((_, None)) => Ok(DatabaseValue::Null),
        None => Err(OrmError::Database(format!(
            "missing FROM-clause entry for table \"{}\"",
            column.alias
        ))),
    }
}

fn compare_nulls_last(left: &DatabaseValue, right: &DatabaseValue) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
    }
}

#[async_trait]
impl SqlExecutor for InMemoryExecutor {
    async fn execute(&self, statement: &SelectStatement) -> OrmResult<Vec<Row>> {
        // Suspend like a real round trip would
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.executed.push(statement.clone());
        if let Some(message) = state.fail_next.take() {
            return Err(OrmError::Database(message));
        }
        Self::evaluate(&state, statement)
    }
}
