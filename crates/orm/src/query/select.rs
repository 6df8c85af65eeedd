//! SELECT statements
//!
//! A structured statement the executors can either render to SQL or evaluate
//! directly. Only the root table's columns are selected.

use super::types::*;
use crate::value::DatabaseValue;

/// Structured SELECT over one root table with optional joins
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub from: TableRef,
    pub joins: Vec<JoinClause>,
    pub where_conditions: Vec<WhereCondition>,
    pub order_by: Vec<(ColumnRef, OrderDirection)>,
}

impl SelectStatement {
    /// Select every column of `table`
    pub fn from(table: TableRef) -> Self {
        Self {
            distinct: false,
            from: table,
            joins: Vec::new(),
            where_conditions: Vec::new(),
            order_by: Vec::new(),
        }
    }

    /// Batched lookup: rows of `table` whose `column` is one of `keys`
    pub fn where_in_query(table: &str, column: &str, keys: Vec<DatabaseValue>, order_by: &str) -> Self {
        let table = TableRef::new(table);
        let column = table.column(column);
        let order = table.column(order_by);
        Self::from(table)
            .where_in(column, keys)
            .order_by(order, OrderDirection::Asc)
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn join(mut self, join_type: JoinType, table: TableRef, left: ColumnRef, right: ColumnRef) -> Self {
        self.joins.push(JoinClause {
            join_type,
            table,
            on_conditions: vec![(left, right)],
        });
        self
    }

    pub fn where_condition(mut self, column: ColumnRef, operator: QueryOperator, value: DatabaseValue) -> Self {
        self.where_conditions.push(WhereCondition {
            column,
            operator,
            values: vec![value],
        });
        self
    }

    pub fn where_eq(self, column: ColumnRef, value: DatabaseValue) -> Self {
        self.where_condition(column, QueryOperator::Equal, value)
    }

    pub fn where_in(mut self, column: ColumnRef, values: Vec<DatabaseValue>) -> Self {
        self.where_conditions.push(WhereCondition {
            column,
            operator: QueryOperator::In,
            values,
        });
        self
    }

    pub fn where_null(mut self, column: ColumnRef) -> Self {
        self.where_conditions.push(WhereCondition {
            column,
            operator: QueryOperator::IsNull,
            values: Vec::new(),
        });
        self
    }

    pub fn order_by(mut self, column: ColumnRef, direction: OrderDirection) -> Self {
        self.order_by.push((column, direction));
        self
    }

    /// Whether an alias is the root table or one of the joined tables
    pub fn has_alias(&self, alias: &str) -> bool {
        self.from.alias == alias || self.joins.iter().any(|join| join.table.alias == alias)
    }
}
