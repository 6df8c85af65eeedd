//! Query Types - operators, column references, joins and ordering

use std::fmt;

use crate::value::DatabaseValue;

/// Query operator types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Equal,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    In,
    IsNull,
}

impl QueryOperator {
    /// Whether a left-hand value satisfies this operator against the right-hand values
    pub fn matches(self, left: &DatabaseValue, right: &[DatabaseValue]) -> bool {
        use std::cmp::Ordering::*;
        let first = right.first();
        match self {
            QueryOperator::IsNull => left.is_null(),
            QueryOperator::In => right.iter().any(|value| left.sql_eq(value)),
            QueryOperator::Equal => first.map_or(false, |value| left.sql_eq(value)),
            QueryOperator::GreaterThan => {
                matches!(first.and_then(|value| left.compare(value)), Some(Greater))
            }
            QueryOperator::GreaterThanOrEqual => {
                matches!(first.and_then(|value| left.compare(value)), Some(Greater | Equal))
            }
            QueryOperator::LessThan => {
                matches!(first.and_then(|value| left.compare(value)), Some(Less))
            }
            QueryOperator::LessThanOrEqual => {
                matches!(first.and_then(|value| left.compare(value)), Some(Less | Equal))
            }
        }
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::Equal => write!(f, "="),
            QueryOperator::GreaterThan => write!(f, ">"),
            QueryOperator::GreaterThanOrEqual => write!(f, ">="),
            QueryOperator::LessThan => write!(f, "<"),
            QueryOperator::LessThanOrEqual => write!(f, "<="),
            QueryOperator::In => write!(f, "IN"),
            QueryOperator::IsNull => write!(f, "IS NULL"),
        }
    }
}

/// A table in the FROM or JOIN list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

impl TableRef {
    /// Unaliased table; columns are qualified with the table name
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: table.to_string(),
        }
    }

    pub fn aliased(table: &str, alias: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
        }
    }

    pub fn column(&self, column: &str) -> ColumnRef {
        ColumnRef::new(&self.alias, column)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alias == self.table {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{} AS {}", self.table, self.alias)
        }
    }
}

/// A column qualified by its table alias
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: &str, column: &str) -> Self {
        Self {
            alias: alias.to_string(),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

/// Where clause condition
#[derive(Debug, Clone, PartialEq)]
pub struct WhereCondition {
    pub column: ColumnRef,
    pub operator: QueryOperator,
    /// One value for comparisons, many for IN, none for IS NULL
    pub values: Vec<DatabaseValue>,
}

/// Join types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
        }
    }
}

/// Join clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: TableRef,
    pub on_conditions: Vec<(ColumnRef, ColumnRef)>,
}

/// Order by direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}
