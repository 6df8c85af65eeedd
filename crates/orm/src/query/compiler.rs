//! Criteria Compiler - lowers object-shaped criteria into a joined SELECT
//!
//! Every table gets an alias made of its first letter and a per-letter counter
//! (`books` -> `b0`). Each distinct relation path gets one join, reused when
//! the same path is visited again. ManyToOne leaves that only name an entity
//! become a foreign-key predicate instead of a join.

use std::collections::HashMap;

use super::criteria::{Criteria, Criterion};
use super::select::SelectStatement;
use super::types::*;
use crate::error::{OrmError, OrmResult};
use crate::identity::TaggedId;
use crate::metadata::{EntityMetadata, FieldKind, MetadataProvider, RelationDescriptor, RelationKind, SlotRef};
use crate::value::DatabaseValue;

/// Compiles [`Criteria`] against entity metadata
pub struct CriteriaCompiler<'a> {
    provider: &'a dyn MetadataProvider,
}

impl<'a> CriteriaCompiler<'a> {
    pub fn new(provider: &'a dyn MetadataProvider) -> Self {
        Self { provider }
    }

    /// Build the statement selecting root rows that match `criteria`,
    /// ordered by the root primary key
    pub fn compile(&self, metadata: &EntityMetadata, criteria: &Criteria) -> OrmResult<SelectStatement> {
        let mut state = CompileState::default();
        let root = state.allocate(&metadata.table_name);
        let root_table = TableRef::aliased(&metadata.table_name, &root);

        self.walk(&mut state, metadata, &root, "", criteria)?;

        let mut statement = SelectStatement::from(root_table.clone());
        statement.distinct = state.distinct;
        statement.joins = state.joins;
        statement.where_conditions = state.conditions;
        let statement = statement.order_by(root_table.column(&metadata.primary_key), OrderDirection::Asc);

        tracing::debug!(
            "Compiled {} criteria on {}: {}",
            criteria.len(),
            metadata.entity_name,
            statement.to_sql()
        );
        Ok(statement)
    }

    fn walk(
        &self,
        state: &mut CompileState,
        metadata: &EntityMetadata,
        alias: &str,
        path: &str,
        criteria: &Criteria,
    ) -> OrmResult<()> {
        for (field, criterion) in criteria.iter() {
            if metadata.is_primary_key(field) {
                self.primary_key_predicate(state, metadata, alias, criterion)?;
                continue;
            }

            let slot = metadata.slot(field).ok_or_else(|| {
                unsupported(format!("{} has no field '{}'", metadata.entity_name, field))
            })?;

            match slot {
                SlotRef::Field { field: index, .. } => {
                    let descriptor = &metadata.fields[index];
                    let column = ColumnRef::new(alias, &descriptor.column_name);
                    match &descriptor.kind {
                        FieldKind::Primitive => state.value_predicate(column, criterion, field)?,
                        FieldKind::Enum(enum_descriptor) => {
                            let resolved = match criterion {
                                Criterion::Eq(value) if value.is_null() => Criterion::Eq(DatabaseValue::Null),
                                Criterion::Eq(value) => {
                                    let id = enum_descriptor.resolve(value).ok_or_else(|| {
                                        unsupported(format!(
                                            "{:?} is not a {} value",
                                            value, enum_descriptor.enum_name
                                        ))
                                    })?;
                                    Criterion::Eq(DatabaseValue::Int64(id))
                                }
                                _ => {
                                    return Err(unsupported(format!(
                                        "enum field '{}' only supports equality",
                                        field
                                    )))
                                }
                            };
                            state.value_predicate(column, &resolved, field)?;
                        }
                    }
                }
                SlotRef::Reference { relation, .. } => {
                    let relation = &metadata.relations[relation];
                    self.many_to_one(state, alias, path, relation, criterion)?;
                }
                SlotRef::Collection { relation, .. } => {
                    let relation = &metadata.relations[relation];
                    let nested = match criterion {
                        Criterion::Nested(nested) => nested,
                        _ => {
                            return Err(unsupported(format!(
                                "collection '{}' requires nested criteria",
                                field
                            )))
                        }
                    };
                    self.collection(state, metadata, alias, path, relation, nested)?;
                }
            }
        }
        Ok(())
    }

    fn primary_key_predicate(
        &self,
        state: &mut CompileState,
        metadata: &EntityMetadata,
        alias: &str,
        criterion: &Criterion,
    ) -> OrmResult<()> {
        let column = ColumnRef::new(alias, &metadata.primary_key);
        match criterion {
            Criterion::Nested(_) => Err(unsupported(format!(
                "'{}' of {} cannot take nested criteria",
                metadata.primary_key, metadata.entity_name
            ))),
            Criterion::Op(operator, value) => {
                let id = id_value(&metadata.tag, &Criterion::Eq(value.clone()))?;
                state.condition(column, operator.to_query_operator(), key_value(metadata, &id)?);
                Ok(())
            }
            Criterion::Eq(value) if value.is_null() => {
                state.conditions.push(WhereCondition {
                    column,
                    operator: QueryOperator::IsNull,
                    values: Vec::new(),
                });
                Ok(())
            }
            other => {
                let id = id_value(&metadata.tag, other)?;
                state.condition(column, QueryOperator::Equal, key_value(metadata, &id)?);
                Ok(())
            }
        }
    }

    fn many_to_one(
        &self,
        state: &mut CompileState,
        alias: &str,
        path: &str,
        relation: &RelationDescriptor,
        criterion: &Criterion,
    ) -> OrmResult<()> {
        let fk = ColumnRef::new(alias, relation.require_column()?);
        let other = self.provider.other_metadata(relation)?;

        let nested = match criterion {
            Criterion::Op(..) => {
                return Err(unsupported(format!(
                    "relation '{}' does not support operators",
                    relation.field_name
                )))
            }
            Criterion::Eq(value) if value.is_null() => {
                state.conditions.push(WhereCondition {
                    column: fk,
                    operator: QueryOperator::IsNull,
                    values: Vec::new(),
                });
                return Ok(());
            }
            Criterion::Eq(_) | Criterion::Entity(_) => {
                let id = id_value(&relation.other_tag, criterion)?;
                state.condition(fk, QueryOperator::Equal, key_value(&other, &id)?);
                return Ok(());
            }
            Criterion::Nested(nested) => nested,
        };

        if let Some(id_criterion) = nested.only(&other.primary_key) {
            if !matches!(id_criterion, Criterion::Nested(_) | Criterion::Op(..)) {
                let id = id_value(&relation.other_tag, id_criterion)?;
                state.condition(fk, QueryOperator::Equal, key_value(&other, &id)?);
                return Ok(());
            }
        }

        let join_path = join_path(path, &relation.field_name);
        let other_alias = match state.joined(&join_path) {
            Some(existing) => existing,
            None => {
                let other_alias = state.allocate(&other.table_name);
                state.join(
                    &join_path,
                    TableRef::aliased(&other.table_name, &other_alias),
                    fk,
                    ColumnRef::new(&other_alias, &other.primary_key),
                );
                other_alias
            }
        };
        self.walk(state, &other, &other_alias, &join_path, nested)
    }

    fn collection(
        &self,
        state: &mut CompileState,
        metadata: &EntityMetadata,
        alias: &str,
        path: &str,
        relation: &RelationDescriptor,
        nested: &Criteria,
    ) -> OrmResult<()> {
        let other = self.provider.other_metadata(relation)?;
        let join_path = join_path(path, &relation.field_name);
        state.distinct = true;

        let other_alias = match state.joined(&join_path) {
            Some(existing) => existing,
            None => match relation.kind {
                RelationKind::ManyToMany => {
                    let join_table = relation.require_join_table()?;
                    let link_path = format!("{}#link", join_path);
                    let link_alias = state.allocate(join_table);
                    state.join(
                        &link_path,
                        TableRef::aliased(join_table, &link_alias),
                        ColumnRef::new(&link_alias, relation.require_column()?),
                        ColumnRef::new(alias, &metadata.primary_key),
                    );
                    let other_alias = state.allocate(&other.table_name);
                    state.join(
                        &join_path,
                        TableRef::aliased(&other.table_name, &other_alias),
                        ColumnRef::new(&other_alias, &other.primary_key),
                        ColumnRef::new(&link_alias, relation.require_other_column()?),
                    );
                    other_alias
                }
                _ => {
                    let other_alias = state.allocate(&other.table_name);
                    state.join(
                        &join_path,
                        TableRef::aliased(&other.table_name, &other_alias),
                        ColumnRef::new(&other_alias, relation.require_other_column()?),
                        ColumnRef::new(alias, &metadata.primary_key),
                    );
                    other_alias
                }
            },
        };
        self.walk(state, &other, &other_alias, &join_path, nested)
    }
}

#[derive(Default)]
struct CompileState {
    alias_counts: HashMap<char, usize>,
    join_aliases: HashMap<String, String>,
    joins: Vec<JoinClause>,
    conditions: Vec<WhereCondition>,
    distinct: bool,
}

impl CompileState {
    fn allocate(&mut self, table: &str) -> String {
        let letter = table
            .chars()
            .next()
            .map(|c| c.to_ascii_lowercase())
            .unwrap_or('t');
        let count = self.alias_counts.entry(letter).or_insert(0);
        let alias = format!("{}{}", letter, count);
        *count += 1;
        alias
    }

    fn joined(&self, path: &str) -> Option<String> {
        self.join_aliases.get(path).cloned()
    }

    fn join(&mut self, path: &str, table: TableRef, left: ColumnRef, right: ColumnRef) {
        self.join_aliases.insert(path.to_string(), table.alias.clone());
        self.joins.push(JoinClause {
            join_type: JoinType::Inner,
            table,
            on_conditions: vec![(left, right)],
        });
    }

    fn condition(&mut self, column: ColumnRef, operator: QueryOperator, value: DatabaseValue) {
        self.conditions.push(WhereCondition {
            column,
            operator,
            values: vec![value],
        });
    }

    fn value_predicate(&mut self, column: ColumnRef, criterion: &Criterion, field: &str) -> OrmResult<()> {
        match criterion {
            Criterion::Eq(value) if value.is_null() => {
                self.conditions.push(WhereCondition {
                    column,
                    operator: QueryOperator::IsNull,
                    values: Vec::new(),
                });
            }
            Criterion::Eq(value) => self.condition(column, QueryOperator::Equal, value.clone()),
            Criterion::Op(operator, value) => {
                self.condition(column, operator.to_query_operator(), value.clone())
            }
            Criterion::Nested(_) => {
                return Err(unsupported(format!("field '{}' cannot take nested criteria", field)))
            }
            Criterion::Entity(id) => {
                return Err(unsupported(format!(
                    "field '{}' is not a relation but was given {}",
                    field, id
                )))
            }
        }
        Ok(())
    }
}

fn join_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

/// Turn an id-shaped criterion into a tagged id of the expected entity
fn id_value(tag: &str, criterion: &Criterion) -> OrmResult<TaggedId> {
    let id = match criterion {
        Criterion::Entity(id) => id.clone(),
        Criterion::Eq(DatabaseValue::String(s)) => {
            TaggedId::parse_for(tag, s).map_err(|e| unsupported(e.to_string()))?
        }
        Criterion::Eq(value) => {
            TaggedId::from_value(tag, value).map_err(|e| unsupported(e.to_string()))?
        }
        _ => return Err(unsupported(format!("expected an id for '{}'", tag))),
    };
    if !id.has_tag(tag) {
        return Err(unsupported(format!("{} is not a '{}' id", id, tag)));
    }
    Ok(id)
}

/// Stored form of an id in `target`'s key column
fn key_value(target: &EntityMetadata, id: &TaggedId) -> OrmResult<DatabaseValue> {
    target.key_value(id).map_err(|e| unsupported(e.to_string()))
}

fn unsupported(message: String) -> OrmError {
    OrmError::UnsupportedCriteria(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{metadata, text};
    use serde_json::json;

    fn compile(entity: &str, criteria: Criteria) -> OrmResult<SelectStatement> {
        let provider = metadata();
        let meta = provider.metadata(entity)?;
        CriteriaCompiler::new(provider.as_ref()).compile(&meta, &criteria)
    }

    #[test]
    fn test_empty_criteria_selects_everything() {
        let statement = compile("Author", Criteria::new()).unwrap();
        assert_eq!(statement.to_sql(), "SELECT * FROM authors AS a0 ORDER BY a0.id ASC");
    }

    #[test]
    fn test_join_through_many_to_one() {
        let criteria = Criteria::from_json(&json!({"author": {"firstName": "a2"}})).unwrap();
        let statement = compile("Book", criteria).unwrap();
        let (sql, params) = statement.to_sql_with_params();
        assert_eq!(
            sql,
            "SELECT b0.* FROM books AS b0 INNER JOIN authors AS a0 ON b0.author_id = a0.id \
             WHERE a0.first_name = $1 ORDER BY b0.id ASC"
        );
        assert_eq!(params, vec![text("a2")]);
    }

    #[test]
    fn test_two_joins_and_alias_reuse() {
        let criteria = Criteria::new()
            .nested("author", Criteria::new().nested("publisher", Criteria::new().eq("name", "p2")))
            .nested("author", Criteria::new().gt("age", 1));
        let statement = compile("Book", criteria).unwrap();
        assert_eq!(statement.joins.len(), 2);
        assert_eq!(
            statement.to_sql(),
            "SELECT b0.* FROM books AS b0 \
             INNER JOIN authors AS a0 ON b0.author_id = a0.id \
             INNER JOIN publishers AS p0 ON a0.publisher_id = p0.id \
             WHERE p0.name = 'p2' AND a0.age > 1 ORDER BY b0.id ASC"
        );
    }

    #[test]
    fn test_entity_leaf_is_foreign_key_equality() {
        let by_entity = compile("Book", Criteria::new().id("author", TaggedId::new("a", "2"))).unwrap();
        assert!(by_entity.joins.is_empty());
        assert_eq!(
            by_entity.to_sql(),
            "SELECT * FROM books AS b0 WHERE b0.author_id = 2 ORDER BY b0.id ASC"
        );

        let by_nested_id = compile(
            "Book",
            Criteria::from_json(&json!({"author": {"id": "4"}})).unwrap(),
        )
        .unwrap();
        assert_eq!(
            by_nested_id.to_sql(),
            "SELECT * FROM books AS b0 WHERE b0.author_id = 4 ORDER BY b0.id ASC"
        );

        let by_tagged = compile("Book", Criteria::new().eq("author", "a:3")).unwrap();
        assert_eq!(by_tagged.where_conditions[0].values, vec![DatabaseValue::Int64(3)]);
    }

    #[test]
    fn test_operator_on_primary_key_takes_an_id() {
        let criteria = Criteria::from_json(&json!({"id": {"$gt": "a:1"}})).unwrap();
        let statement = compile("Author", criteria).unwrap();
        assert_eq!(
            statement.to_sql(),
            "SELECT * FROM authors AS a0 WHERE a0.id > 1 ORDER BY a0.id ASC"
        );

        let bare = compile("Author", Criteria::new().lte("id", 2i64)).unwrap();
        assert_eq!(bare.where_conditions[0].values, vec![DatabaseValue::Int64(2)]);

        let foreign = compile("Author", Criteria::new().gt("id", "b:1"));
        assert!(matches!(foreign, Err(OrmError::UnsupportedCriteria(_))));
    }

    #[test]
    fn test_entity_leaf_inside_join() {
        let criteria = Criteria::new().nested(
            "author",
            Criteria::new().id("publisher", TaggedId::new("p", "2")),
        );
        let statement = compile("Book", criteria).unwrap();
        assert_eq!(
            statement.to_sql(),
            "SELECT b0.* FROM books AS b0 INNER JOIN authors AS a0 ON b0.author_id = a0.id \
             WHERE a0.publisher_id = 2 ORDER BY b0.id ASC"
        );
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let result = compile("Book", Criteria::new().id("author", TaggedId::new("p", "2")));
        assert!(matches!(result, Err(OrmError::UnsupportedCriteria(_))));
        let result = compile("Book", Criteria::new().eq("author", "p:2"));
        assert!(matches!(result, Err(OrmError::UnsupportedCriteria(_))));
    }

    #[test]
    fn test_operator_leaf() {
        let criteria = Criteria::from_json(&json!({"age": {"$gte": 1}})).unwrap();
        let (sql, params) = compile("Author", criteria).unwrap().to_sql_with_params();
        assert_eq!(sql, "SELECT * FROM authors AS a0 WHERE a0.age >= $1 ORDER BY a0.id ASC");
        assert_eq!(params, vec![DatabaseValue::Int64(1)]);
    }

    #[test]
    fn test_null_equality() {
        let statement = compile("Author", Criteria::new().eq("publisher", DatabaseValue::Null)).unwrap();
        assert_eq!(
            statement.to_sql(),
            "SELECT * FROM authors AS a0 WHERE a0.publisher_id IS NULL ORDER BY a0.id ASC"
        );
    }

    #[test]
    fn test_enum_by_code() {
        let statement = compile("Publisher", Criteria::new().eq("size", "LARGE")).unwrap();
        assert_eq!(
            statement.to_sql(),
            "SELECT * FROM publishers AS p0 WHERE p0.size_id = 2 ORDER BY p0.id ASC"
        );
        let result = compile("Publisher", Criteria::new().eq("size", "HUGE"));
        assert!(matches!(result, Err(OrmError::UnsupportedCriteria(_))));
    }

    #[test]
    fn test_one_to_many_join_is_distinct() {
        let criteria = Criteria::new().nested("books", Criteria::new().eq("title", "b2"));
        let statement = compile("Author", criteria).unwrap();
        assert!(statement.distinct);
        assert_eq!(
            statement.to_sql(),
            "SELECT DISTINCT a0.* FROM authors AS a0 INNER JOIN books AS b0 ON b0.author_id = a0.id \
             WHERE b0.title = 'b2' ORDER BY a0.id ASC"
        );
    }

    #[test]
    fn test_many_to_many_join_goes_through_join_table() {
        let criteria = Criteria::new().nested("tags", Criteria::new().eq("name", "t1"));
        let statement = compile("Book", criteria).unwrap();
        assert_eq!(
            statement.to_sql(),
            "SELECT DISTINCT b0.* FROM books AS b0 \
             INNER JOIN books_to_tags AS b1 ON b1.book_id = b0.id \
             INNER JOIN tags AS t0 ON t0.id = b1.tag_id \
             WHERE t0.name = 't1' ORDER BY b0.id ASC"
        );
    }

    #[test]
    fn test_unsupported_shapes() {
        let cases = vec![
            Criteria::new().eq("nope", 1),
            Criteria::new().nested("title", Criteria::new().eq("x", 1)),
            Criteria::new().gt("author", 1),
            Criteria::new().eq("books", 1),
            Criteria::new().id("title", TaggedId::new("a", "1")),
            Criteria::new().nested("author", Criteria::new().eq("missing", 1)),
        ];
        for criteria in cases {
            let result = compile("Book", criteria.clone());
            assert!(
                matches!(result, Err(OrmError::UnsupportedCriteria(_))),
                "compiled {:?}",
                criteria
            );
        }
    }
}
