//! Query Module - structured SELECT statements, criteria and the criteria compiler

pub mod compiler;
pub mod criteria;
pub mod select;
pub mod sql_generation;
pub mod types;

pub use compiler::CriteriaCompiler;
pub use criteria::{Criteria, Criterion, Operator};
pub use select::SelectStatement;
pub use types::{
    ColumnRef, JoinClause, JoinType, OrderDirection, QueryOperator, TableRef, WhereCondition,
};
