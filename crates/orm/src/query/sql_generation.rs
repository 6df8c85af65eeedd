//! SQL generation for SELECT statements

use super::select::SelectStatement;
use super::types::*;
use crate::value::DatabaseValue;

impl SelectStatement {
    /// Generate SQL with `$n` placeholders and return the parameters in order
    pub fn to_sql_with_params(&self) -> (String, Vec<DatabaseValue>) {
        let mut sql = String::new();
        let mut params = Vec::new();

        self.build_select_from(&mut sql);
        self.build_where_clause(&mut sql, &mut |value: &DatabaseValue| {
            params.push(value.clone());
            format!("${}", params.len())
        });
        self.build_order_clause(&mut sql);

        (sql, params)
    }

    /// SQL with values inlined, for logging and assertions
    pub fn to_sql(&self) -> String {
        let mut sql = String::new();
        self.build_select_from(&mut sql);
        self.build_where_clause(&mut sql, &mut format_value);
        self.build_order_clause(&mut sql);
        sql
    }

    fn build_select_from(&self, sql: &mut String) {
        if self.distinct {
            sql.push_str("SELECT DISTINCT ");
        } else {
            sql.push_str("SELECT ");
        }

        if self.joins.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&format!("{}.*", self.from.alias));
        }

        sql.push_str(" FROM ");
        sql.push_str(&self.from.to_string());

        for join in &self.joins {
            sql.push_str(&format!(" {} {}", join.join_type, join.table));
            if !join.on_conditions.is_empty() {
                sql.push_str(" ON ");
                let conditions: Vec<String> = join
                    .on_conditions
                    .iter()
                    .map(|(left, right)| format!("{} = {}", left, right))
                    .collect();
                sql.push_str(&conditions.join(" AND "));
            }
        }
    }

    fn build_where_clause<F>(&self, sql: &mut String, placeholder: &mut F)
    where
        F: FnMut(&DatabaseValue) -> String,
    {
        if self.where_conditions.is_empty() {
            return;
        }

        sql.push_str(" WHERE ");
        for (i, condition) in self.where_conditions.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }

            sql.push_str(&condition.column.to_string());
            sql.push(' ');
            sql.push_str(&condition.operator.to_string());

            match condition.operator {
                QueryOperator::IsNull => {}
                QueryOperator::In => {
                    let values: Vec<String> = condition.values.iter().map(|v| placeholder(v)).collect();
                    sql.push_str(&format!(" ({})", values.join(", ")));
                }
                _ => {
                    let value = condition.values.first().unwrap_or(&DatabaseValue::Null);
                    sql.push(' ');
                    sql.push_str(&placeholder(value));
                }
            }
        }
    }

    fn build_order_clause(&self, sql: &mut String) {
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            let order_clauses: Vec<String> = self
                .order_by
                .iter()
                .map(|(column, direction)| format!("{} {}", column, direction))
                .collect();
            sql.push_str(&order_clauses.join(", "));
        }
    }
}

/// Format a value as a SQL literal
pub(crate) fn format_value(value: &DatabaseValue) -> String {
    match value {
        DatabaseValue::Null => "NULL".to_string(),
        DatabaseValue::Bool(b) => b.to_string(),
        DatabaseValue::Int32(i) => i.to_string(),
        DatabaseValue::Int64(i) => i.to_string(),
        DatabaseValue::Float64(f) => f.to_string(),
        DatabaseValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        DatabaseValue::Uuid(u) => format!("'{}'", u),
        DatabaseValue::DateTime(dt) => format!("'{}'", dt.to_rfc3339()),
        DatabaseValue::Date(d) => format!("'{}'", d),
        DatabaseValue::Json(j) => format!("'{}'", j.to_string().replace('\'', "''")),
    }
}
