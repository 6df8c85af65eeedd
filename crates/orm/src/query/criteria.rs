//! Search criteria
//!
//! An ordered, object-shaped filter: each entry maps a field name to an
//! equality value, a comparison operator, a nested criteria for relation
//! traversal, or an entity reference.

use std::fmt;

use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde_json::{Map, Value as JsonValue};

use super::types::QueryOperator;
use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::identity::TaggedId;
use crate::value::DatabaseValue;

/// Comparison operators accepted in operator leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Parse an operator key such as `$gte`
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "$gt" => Some(Operator::Gt),
            "$gte" => Some(Operator::Gte),
            "$lt" => Some(Operator::Lt),
            "$lte" => Some(Operator::Lte),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
        }
    }

    pub fn to_query_operator(self) -> QueryOperator {
        match self {
            Operator::Gt => QueryOperator::GreaterThan,
            Operator::Gte => QueryOperator::GreaterThanOrEqual,
            Operator::Lt => QueryOperator::LessThan,
            Operator::Lte => QueryOperator::LessThanOrEqual,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Right-hand side of one criteria entry
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    Eq(DatabaseValue),
    Op(Operator, DatabaseValue),
    Nested(Criteria),
    Entity(TaggedId),
}

/// Ordered list of field criteria, conjoined when compiled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    entries: Vec<(String, Criterion)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, criterion: Criterion) -> Self {
        self.entries.push((field.to_string(), criterion));
        self
    }

    pub fn eq(self, field: &str, value: impl Into<DatabaseValue>) -> Self {
        self.with(field, Criterion::Eq(value.into()))
    }

    pub fn op(self, field: &str, operator: Operator, value: impl Into<DatabaseValue>) -> Self {
        self.with(field, Criterion::Op(operator, value.into()))
    }

    pub fn gt(self, field: &str, value: impl Into<DatabaseValue>) -> Self {
        self.op(field, Operator::Gt, value)
    }

    pub fn gte(self, field: &str, value: impl Into<DatabaseValue>) -> Self {
        self.op(field, Operator::Gte, value)
    }

    pub fn lt(self, field: &str, value: impl Into<DatabaseValue>) -> Self {
        self.op(field, Operator::Lt, value)
    }

    pub fn lte(self, field: &str, value: impl Into<DatabaseValue>) -> Self {
        self.op(field, Operator::Lte, value)
    }

    pub fn nested(self, field: &str, criteria: Criteria) -> Self {
        self.with(field, Criterion::Nested(criteria))
    }

    /// Match a ManyToOne field against an instance
    pub fn entity(self, field: &str, entity: &Entity) -> Self {
        self.with(field, Criterion::Entity(entity.id().clone()))
    }

    /// Match a ManyToOne field against a tagged id
    pub fn id(self, field: &str, id: TaggedId) -> Self {
        self.with(field, Criterion::Entity(id))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Criterion)> {
        self.entries.iter().map(|(field, criterion)| (field.as_str(), criterion))
    }

    /// The single criterion on `field` when that is the only entry
    pub fn only(&self, field: &str) -> Option<&Criterion> {
        match self.entries.as_slice() {
            [(name, criterion)] if name == field => Some(criterion),
            _ => None,
        }
    }

    /// Parse the JSON criteria shape, e.g. `{"age": {"$gt": 1}}`
    pub fn from_json(json: &JsonValue) -> OrmResult<Self> {
        match json {
            JsonValue::Object(map) => Self::from_map(map),
            other => Err(OrmError::UnsupportedCriteria(format!(
                "criteria must be an object, got {}",
                other
            ))),
        }
    }

    fn from_map(map: &Map<String, JsonValue>) -> OrmResult<Self> {
        let mut criteria = Self::new();
        for (field, value) in map {
            criteria.entries.push((field.clone(), parse_criterion(field, value)?));
        }
        Ok(criteria)
    }
}

fn parse_criterion(field: &str, value: &JsonValue) -> OrmResult<Criterion> {
    match value {
        JsonValue::Array(_) => Err(OrmError::UnsupportedCriteria(format!(
            "'{}': arrays are not supported",
            field
        ))),
        JsonValue::Object(map) => {
            let operator_keys = map.keys().filter(|key| key.starts_with('$')).count();
            if operator_keys == 0 {
                return Criteria::from_map(map).map(Criterion::Nested);
            }
            if operator_keys != map.len() {
                return Err(OrmError::UnsupportedCriteria(format!(
                    "'{}' mixes operators and fields",
                    field
                )));
            }
            let (key, operand) = match map.iter().next() {
                Some(entry) if map.len() == 1 => entry,
                _ => {
                    return Err(OrmError::UnsupportedCriteria(format!(
                        "'{}' must have exactly one operator",
                        field
                    )))
                }
            };
            if operand.is_object() || operand.is_array() {
                return Err(OrmError::UnsupportedCriteria(format!(
                    "'{}': operand of {} must be a scalar",
                    field, key
                )));
            }
            let operand = DatabaseValue::from_json(operand.clone());
            if key == "$eq" {
                return Ok(Criterion::Eq(operand));
            }
            Operator::from_key(key)
                .map(|operator| Criterion::Op(operator, operand))
                .ok_or_else(|| {
                    OrmError::UnsupportedCriteria(format!("'{}': unknown operator {}", field, key))
                })
        }
        scalar => Ok(Criterion::Eq(DatabaseValue::from_json(scalar.clone()))),
    }
}

impl<'de> Deserialize<'de> for Criteria {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = JsonValue::deserialize(deserializer)?;
        Criteria::from_json(&json).map_err(D::Error::custom)
    }
}
