//! PostgreSQL Executor
//!
//! Runs statements on a sqlx `PgPool`, binding [`DatabaseValue`] parameters and
//! converting result columns back into [`DatabaseValue`]s.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres};

use super::SqlExecutor;
use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::query::SelectStatement;
use crate::value::{DatabaseValue, Row};

/// PostgreSQL implementation of [`SqlExecutor`]
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: Pool<Postgres>,
}

impl PostgresExecutor {
    /// Create a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> OrmResult<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create PostgreSQL pool: {}", e);
                OrmError::Connection(format!("Failed to create PostgreSQL pool: {}", e))
            })?;

        tracing::debug!(
            "Created PostgreSQL pool with {} max connections",
            config.max_connections
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn execute(&self, statement: &SelectStatement) -> OrmResult<Vec<Row>> {
        let (sql, params) = statement.to_sql_with_params();
        tracing::debug!("Executing: {} ({} params)", sql, params.len());

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_database_value(query, param);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OrmError::Database(format!("Query fetch failed: {}", e)))?;

        rows.iter().map(pg_row_to_row).collect()
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Date(d) => query.bind(*d),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

fn pg_row_to_row(row: &PgRow) -> OrmResult<Row> {
    use sqlx::{Column, Row as _};

    let mut result = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        result.insert(column.name(), postgres_value_to_database_value(row, index)?);
    }
    Ok(result)
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    use sqlx::{Column, Row as _, TypeInfo, ValueRef};

    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let column = &row.columns()[index];
    let type_name = column.type_info().name();
    let fetch_failed = |e: sqlx::Error| {
        OrmError::Hydration(format!(
            "Failed to read column '{}' as {}: {}",
            column.name(),
            type_name,
            e
        ))
    };

    let value = match type_name {
        "BOOL" => DatabaseValue::Bool(row.try_get(index).map_err(fetch_failed)?),
        "INT2" => DatabaseValue::Int32(row.try_get::<i16, _>(index).map_err(fetch_failed)? as i32),
        "INT4" => DatabaseValue::Int32(row.try_get(index).map_err(fetch_failed)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index).map_err(fetch_failed)?),
        "FLOAT4" => DatabaseValue::Float64(row.try_get::<f32, _>(index).map_err(fetch_failed)? as f64),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index).map_err(fetch_failed)?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index).map_err(fetch_failed)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index).map_err(fetch_failed)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index).map_err(fetch_failed)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        "DATE" => DatabaseValue::Date(row.try_get(index).map_err(fetch_failed)?),
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get::<JsonValue, _>(index).map_err(fetch_failed)?),
        _ => DatabaseValue::String(row.try_get(index).map_err(fetch_failed)?),
    };
    Ok(value)
}
