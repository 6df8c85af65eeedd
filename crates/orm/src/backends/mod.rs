//! SQL Execution Adapters
//!
//! The runtime never talks to a database directly. Batched loads and compiled
//! criteria go through a [`SqlExecutor`], which runs a [`SelectStatement`] and
//! returns plain rows.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryExecutor;
pub use postgres::PostgresExecutor;

use async_trait::async_trait;

use crate::error::OrmResult;
use crate::query::SelectStatement;
use crate::value::{DatabaseValue, Row};

/// Runs SELECT statements and returns rows keyed by column name
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute a structured statement
    async fn execute(&self, statement: &SelectStatement) -> OrmResult<Vec<Row>>;

    /// Rows of `table` whose `where_in_column` is one of `keys`, ordered by `order_by`
    async fn query(
        &self,
        table: &str,
        where_in_column: &str,
        keys: &[DatabaseValue],
        order_by: &str,
    ) -> OrmResult<Vec<Row>> {
        let statement = SelectStatement::where_in_query(table, where_in_column, keys.to_vec(), order_by);
        self.execute(&statement).await
    }
}
