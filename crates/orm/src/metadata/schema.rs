//! Schema adapter - derives entity metadata from relational table descriptions
//!
//! Conventions:
//! - entity names are the singular PascalCase of the table (`book_reviews` -> `BookReview`)
//! - a table with exactly `id`, `code` and `name` columns is an enum table
//! - a table whose only non-key columns are two foreign keys (plus an optional
//!   `created_at`) is a many-to-many join table
//! - `author_id` pointing at `authors` becomes the ManyToOne field `author`, and
//!   `authors` gets the OneToMany field `books` whose inverse is `author`

use std::collections::{HashMap, HashSet};

use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};

use super::{EntityMetadata, EnumDescriptor, EnumValue, MetadataRegistry};
use crate::error::{OrmError, OrmResult};
use crate::identity::KeyKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

impl ColumnSchema {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            not_null: false,
            primary_key: false,
            foreign_key: None,
        }
    }

    pub fn primary_key(name: &str) -> Self {
        Self {
            not_null: true,
            primary_key: true,
            ..Self::new(name, "int")
        }
    }

    pub fn references(name: &str, table: &str) -> Self {
        Self {
            foreign_key: Some(ForeignKeyRef {
                table: table.to_string(),
                column: "id".to_string(),
            }),
            ..Self::new(name, "int")
        }
    }

    /// Override the column type, e.g. a `varchar` primary key
    pub fn with_type(mut self, data_type: &str) -> Self {
        self.data_type = data_type.to_string();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: &str, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    fn primary_key(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.primary_key)
    }

    fn foreign_keys(&self) -> impl Iterator<Item = (&ColumnSchema, &ForeignKeyRef)> {
        self.columns
            .iter()
            .filter_map(|c| c.foreign_key.as_ref().map(|fk| (c, fk)))
    }

    pub fn is_enum_table(&self) -> bool {
        let names: HashSet<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        self.columns.len() == 3 && ["id", "code", "name"].iter().all(|n| names.contains(n))
    }

    pub fn is_join_table(&self) -> bool {
        let others: Vec<_> = self
            .columns
            .iter()
            .filter(|c| !c.primary_key && c.name != "created_at")
            .collect();
        others.len() == 2 && others.iter().all(|c| c.foreign_key.is_some())
    }
}

/// Builds a [`MetadataRegistry`] from table descriptions
#[derive(Debug, Default)]
pub struct SchemaAdapter {
    tables: Vec<TableSchema>,
    enum_rows: HashMap<String, Vec<EnumValue>>,
    tags: HashMap<String, String>,
}

impl SchemaAdapter {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    /// Rows of an enum table, read separately from the schema
    pub fn with_enum_rows(mut self, table: &str, rows: Vec<EnumValue>) -> Self {
        self.enum_rows.insert(table.to_string(), rows);
        self
    }

    /// Override the generated tag of an entity
    pub fn with_tag(mut self, entity_name: &str, tag: &str) -> Self {
        self.tags.insert(entity_name.to_string(), tag.to_string());
        self
    }

    pub fn build(self) -> OrmResult<MetadataRegistry> {
        let tables: HashMap<&str, &TableSchema> =
            self.tables.iter().map(|t| (t.name.as_str(), t)).collect();
        let entity_tables: Vec<&TableSchema> = self
            .tables
            .iter()
            .filter(|t| !t.is_enum_table() && !t.is_join_table())
            .collect();

        let mut used_tags: HashSet<String> = self.tags.values().cloned().collect();
        let mut entities = Vec::new();

        for table in &entity_tables {
            let entity_name = table_to_entity_name(&table.name);
            let tag = match self.tags.get(&entity_name) {
                Some(tag) => tag.clone(),
                None => default_tag(&entity_name, &used_tags),
            };
            used_tags.insert(tag.clone());

            let pk = table.primary_key().ok_or_else(|| {
                OrmError::Metadata(format!("Table '{}' has no primary key", table.name))
            })?;

            let mut builder = EntityMetadata::builder(&entity_name, &tag, &table.name)
                .primary_key(&pk.name)
                .key_kind(KeyKind::from_data_type(&pk.data_type));

            for column in table.columns.iter().filter(|c| !c.primary_key && c.foreign_key.is_none()) {
                builder = builder.field(&column.name.to_case(Case::Camel), &column.name);
            }

            for (column, fk) in table.foreign_keys() {
                let target = tables.get(fk.table.as_str()).ok_or_else(|| {
                    OrmError::Metadata(format!(
                        "{}.{} references unknown table '{}'",
                        table.name, column.name, fk.table
                    ))
                })?;
                let field_name = strip_id(&column.name).to_case(Case::Camel);
                if target.is_enum_table() {
                    let descriptor = EnumDescriptor {
                        enum_name: table_to_entity_name(&target.name),
                        table_name: target.name.clone(),
                        values: self.enum_rows.get(&target.name).cloned().unwrap_or_default(),
                    };
                    builder = builder.enum_field(&field_name, &column.name, descriptor);
                } else {
                    builder = builder.many_to_one(
                        &field_name,
                        &table_to_entity_name(&target.name),
                        &column.name,
                        &pluralize(&entity_name).to_case(Case::Camel),
                    );
                }
            }

            for other in &entity_tables {
                for (column, _) in other.foreign_keys().filter(|(_, fk)| fk.table == table.name) {
                    let other_entity = table_to_entity_name(&other.name);
                    builder = builder.one_to_many(
                        &pluralize(&other_entity).to_case(Case::Camel),
                        &other_entity,
                        &column.name,
                        &strip_id(&column.name).to_case(Case::Camel),
                    );
                }
            }

            for join in self.tables.iter().filter(|t| t.is_join_table()) {
                let fks: Vec<_> = join.foreign_keys().collect();
                for (mine, theirs) in [(0, 1), (1, 0)] {
                    let (my_column, my_fk) = fks[mine];
                    let (their_column, their_fk) = fks[theirs];
                    if my_fk.table != table.name {
                        continue;
                    }
                    builder = builder.many_to_many(
                        &pluralize(strip_id(&their_column.name)).to_case(Case::Camel),
                        &table_to_entity_name(&their_fk.table),
                        &join.name,
                        &my_column.name,
                        &their_column.name,
                        &pluralize(strip_id(&my_column.name)).to_case(Case::Camel),
                    );
                }
            }

            entities.push(builder.build()?);
        }

        tracing::debug!("Derived metadata for {} entities from schema", entities.len());
        MetadataRegistry::new(entities)
    }
}

fn strip_id(column: &str) -> &str {
    column.strip_suffix("_id").unwrap_or(column)
}

/// `book_reviews` -> `BookReview`
pub fn table_to_entity_name(table: &str) -> String {
    singularize(table).to_case(Case::Pascal)
}

pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("sses") || word.ends_with("xes") || word.ends_with("ches") || word.ends_with("shes") {
        word[..word.len() - 2].to_string()
    } else if let Some(stem) = word.strip_suffix('s').filter(|_| !word.ends_with("ss")) {
        stem.to_string()
    } else {
        word.to_string()
    }
}

pub fn pluralize(word: &str) -> String {
    let consonant_y = word.ends_with('y')
        && !word
            .chars()
            .rev()
            .nth(1)
            .map(|c| "aeiouAEIOU".contains(c))
            .unwrap_or(false);
    if consonant_y {
        format!("{}ies", &word[..word.len() - 1])
    } else if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}

/// Initials of the words in the entity name, lengthened until unique
fn default_tag(entity_name: &str, used: &HashSet<String>) -> String {
    let snake = entity_name.to_case(Case::Snake);
    let initials: String = snake.split('_').filter_map(|w| w.chars().next()).collect();
    if !used.contains(&initials) {
        return initials;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{}{}", initials, counter);
        if !used.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
