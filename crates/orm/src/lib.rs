//! # elif-orm-runtime: request-scoped ORM runtime for elif.rs
//!
//! The read side of the ORM: an identity-mapped unit of work, batched relation
//! loading that coalesces same-window lookups into one IN-query, and a
//! compiler that turns nested, object-shaped criteria into a joined SELECT.
//!
//! ```no_run
//! use std::sync::Arc;
//! use elif_orm_runtime::{DatabaseConfig, PostgresExecutor, SchemaAdapter, UnitOfWork};
//! # async fn run(tables: Vec<elif_orm_runtime::TableSchema>) -> elif_orm_runtime::OrmResult<()> {
//! let metadata = Arc::new(SchemaAdapter::new(tables).build()?);
//! let executor = Arc::new(PostgresExecutor::connect(&DatabaseConfig::from_env()?).await?);
//!
//! let uow = UnitOfWork::new(metadata, executor);
//! let author = uow.load("Author", "1").await?;
//! let books = uow.load_collection(&author, "books").await?;
//! let adults = uow.find_json("Author", &serde_json::json!({"age": {"$gte": 18}})).await?;
//! # let _ = (books, adults);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod loading;
pub mod metadata;
pub mod query;
pub mod registry;
pub mod unit_of_work;
pub mod value;

#[cfg(test)]
mod tests;

pub use backends::{InMemoryExecutor, PostgresExecutor, SqlExecutor};
pub use config::{BatchConfig, BatchWindow, DatabaseConfig, OrmConfig};
pub use entity::{Entity, FieldValue};
pub use error::{ConfigError, OrmError, OrmResult};
pub use identity::{KeyKind, TaggedId};
pub use loading::{BatchKey, BatchedRelationLoader, LoaderCache, LoaderKind};
pub use metadata::{
    ColumnSchema, EntityMetadata, EnumDescriptor, EnumValue, FieldDescriptor, FieldKind,
    MetadataProvider, MetadataRegistry, RelationDescriptor, RelationKind, SchemaAdapter,
    TableSchema,
};
pub use query::{Criteria, CriteriaCompiler, Criterion, Operator, SelectStatement};
pub use registry::{EntityRegistry, HydrateOptions};
pub use unit_of_work::{UnitOfWork, UnitOfWorkStats};
pub use value::{DatabaseValue, Row};
