//! Entity Metadata - table, field and relation descriptors for each entity type
//!
//! Metadata is built once at startup (by hand or through [`schema::SchemaAdapter`])
//! and shared immutably. Each entity's fields are laid out in a slot table so
//! instances store their values in a `Vec` indexed by slot instead of a map keyed
//! by field name.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::identity::{KeyKind, TaggedId};
use crate::value::DatabaseValue;

pub mod schema;

pub use schema::{ColumnSchema, ForeignKeyRef, SchemaAdapter, TableSchema};

/// Defines the type of relationship between entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// This entity holds the foreign key (belongsTo)
    ManyToOne,
    /// The other entity holds a foreign key back to this one (hasMany)
    OneToMany,
    /// Linked through a join table
    ManyToMany,
}

impl RelationKind {
    /// Returns true if this relation resolves to a collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }
}

/// One row of an enum table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub id: i64,
    pub code: String,
    pub name: String,
}

impl EnumValue {
    pub fn new(id: i64, code: &str, name: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}

/// Enum table backing an enum-valued field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDescriptor {
    pub enum_name: String,
    pub table_name: String,
    pub values: Vec<EnumValue>,
}

impl EnumDescriptor {
    /// Resolve an id, code or name to the backing id
    pub fn resolve(&self, value: &DatabaseValue) -> Option<i64> {
        if let Some(id) = value.as_i64() {
            return self.values.iter().find(|v| v.id == id).map(|v| v.id);
        }
        let text = value.as_str()?;
        self.values
            .iter()
            .find(|v| v.code == text || v.name == text)
            .map(|v| v.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Primitive,
    Enum(EnumDescriptor),
}

/// A column-backed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub field_name: String,
    pub column_name: String,
    pub kind: FieldKind,
}

/// A relation to another entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub kind: RelationKind,
    pub field_name: String,
    pub other_entity: String,
    /// Filled in when the metadata is registered
    pub other_tag: String,
    /// Filled in when the metadata is registered
    pub other_table: String,
    /// ManyToOne: FK column on this table. ManyToMany: join-table column pointing here.
    pub column_name: Option<String>,
    /// Name of the inverse field on the other entity
    pub other_field_name: String,
    /// OneToMany: FK column on the other table. ManyToMany: join-table column pointing there.
    pub other_column_name: Option<String>,
    pub join_table: Option<String>,
}

impl RelationDescriptor {
    pub fn many_to_one(field_name: &str, other_entity: &str, column_name: &str, other_field_name: &str) -> Self {
        Self {
            kind: RelationKind::ManyToOne,
            field_name: field_name.to_string(),
            other_entity: other_entity.to_string(),
            other_tag: String::new(),
            other_table: String::new(),
            column_name: Some(column_name.to_string()),
            other_field_name: other_field_name.to_string(),
            other_column_name: None,
            join_table: None,
        }
    }

    pub fn one_to_many(
        field_name: &str,
        other_entity: &str,
        other_column_name: &str,
        other_field_name: &str,
    ) -> Self {
        Self {
            kind: RelationKind::OneToMany,
            field_name: field_name.to_string(),
            other_entity: other_entity.to_string(),
            other_tag: String::new(),
            other_table: String::new(),
            column_name: None,
            other_field_name: other_field_name.to_string(),
            other_column_name: Some(other_column_name.to_string()),
            join_table: None,
        }
    }

    pub fn many_to_many(
        field_name: &str,
        other_entity: &str,
        join_table: &str,
        column_name: &str,
        other_column_name: &str,
        other_field_name: &str,
    ) -> Self {
        Self {
            kind: RelationKind::ManyToMany,
            field_name: field_name.to_string(),
            other_entity: other_entity.to_string(),
            other_tag: String::new(),
            other_table: String::new(),
            column_name: Some(column_name.to_string()),
            other_field_name: other_field_name.to_string(),
            other_column_name: Some(other_column_name.to_string()),
            join_table: Some(join_table.to_string()),
        }
    }

    /// Column on the owner side; errors with context when absent
    pub fn require_column(&self) -> OrmResult<&str> {
        self.column_name.as_deref().ok_or_else(|| {
            OrmError::Metadata(format!("Relation '{}' has no owner column", self.field_name))
        })
    }

    /// Column on the other side; errors with context when absent
    pub fn require_other_column(&self) -> OrmResult<&str> {
        self.other_column_name.as_deref().ok_or_else(|| {
            OrmError::Metadata(format!("Relation '{}' has no other column", self.field_name))
        })
    }

    pub fn require_join_table(&self) -> OrmResult<&str> {
        self.join_table.as_deref().ok_or_else(|| {
            OrmError::Metadata(format!("Relation '{}' has no join table", self.field_name))
        })
    }
}

/// Where a named field lives inside an entity instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    /// Primitive or enum value: (slot, index into `fields`)
    Field { slot: usize, field: usize },
    /// ManyToOne reference: (slot, index into `relations`)
    Reference { slot: usize, relation: usize },
    /// OneToMany/ManyToMany collection: (collection index, index into `relations`)
    Collection { collection: usize, relation: usize },
}

/// Everything the runtime knows about one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub entity_name: String,
    pub tag: String,
    pub table_name: String,
    pub primary_key: String,
    pub key_kind: KeyKind,
    pub fields: Vec<FieldDescriptor>,
    pub relations: Vec<RelationDescriptor>,
    slots: HashMap<String, SlotRef>,
    slot_count: usize,
    collection_count: usize,
}

impl EntityMetadata {
    pub fn builder(entity_name: &str, tag: &str, table_name: &str) -> EntityMetadataBuilder {
        EntityMetadataBuilder {
            entity_name: entity_name.to_string(),
            tag: tag.to_string(),
            table_name: table_name.to_string(),
            primary_key: "id".to_string(),
            key_kind: KeyKind::default(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn slot(&self, field_name: &str) -> Option<SlotRef> {
        self.slots.get(field_name).copied()
    }

    pub fn require_slot(&self, field_name: &str) -> OrmResult<SlotRef> {
        self.slot(field_name).ok_or_else(|| self.unknown_field(field_name))
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn collection_count(&self) -> usize {
        self.collection_count
    }

    pub fn field(&self, field_name: &str) -> Option<&FieldDescriptor> {
        match self.slot(field_name)? {
            SlotRef::Field { field, .. } => self.fields.get(field),
            _ => None,
        }
    }

    pub fn relation(&self, field_name: &str) -> Option<&RelationDescriptor> {
        match self.slot(field_name)? {
            SlotRef::Reference { relation, .. } | SlotRef::Collection { relation, .. } => {
                self.relations.get(relation)
            }
            SlotRef::Field { .. } => None,
        }
    }

    pub fn require_relation(&self, field_name: &str) -> OrmResult<&RelationDescriptor> {
        self.relation(field_name).ok_or_else(|| self.unknown_field(field_name))
    }

    /// Whether a column name belongs to the primary key
    pub fn is_primary_key(&self, field_name: &str) -> bool {
        field_name == self.primary_key
    }

    /// Parse a bare or tagged id of this entity into its canonical form
    pub fn parse_id(&self, input: &str) -> OrmResult<TaggedId> {
        self.key_kind.canonical(TaggedId::parse_for(&self.tag, input)?)
    }

    /// Primary-key value of `id` as stored in this entity's table
    pub fn key_value(&self, id: &TaggedId) -> OrmResult<DatabaseValue> {
        if !id.has_tag(&self.tag) {
            return Err(OrmError::InvalidId(format!("{} is not a {} id", id, self.entity_name)));
        }
        self.key_kind.value_of(id)
    }

    pub fn unknown_field(&self, field_name: &str) -> OrmError {
        OrmError::UnknownField {
            entity: self.entity_name.clone(),
            field: field_name.to_string(),
        }
    }
}

/// Builder for [`EntityMetadata`]; slots are assigned in declaration order
#[derive(Debug, Clone)]
pub struct EntityMetadataBuilder {
    entity_name: String,
    tag: String,
    table_name: String,
    primary_key: String,
    key_kind: KeyKind,
    fields: Vec<FieldDescriptor>,
    relations: Vec<RelationDescriptor>,
}

impl EntityMetadataBuilder {
    pub fn primary_key(mut self, column: &str) -> Self {
        self.primary_key = column.to_string();
        self
    }

    /// Column type of the primary key; integer unless set
    pub fn key_kind(mut self, kind: KeyKind) -> Self {
        self.key_kind = kind;
        self
    }

    pub fn field(mut self, field_name: &str, column_name: &str) -> Self {
        self.fields.push(FieldDescriptor {
            field_name: field_name.to_string(),
            column_name: column_name.to_string(),
            kind: FieldKind::Primitive,
        });
        self
    }

    pub fn enum_field(mut self, field_name: &str, column_name: &str, descriptor: EnumDescriptor) -> Self {
        self.fields.push(FieldDescriptor {
            field_name: field_name.to_string(),
            column_name: column_name.to_string(),
            kind: FieldKind::Enum(descriptor),
        });
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn many_to_one(self, field_name: &str, other_entity: &str, column_name: &str, other_field_name: &str) -> Self {
        self.relation(RelationDescriptor::many_to_one(
            field_name,
            other_entity,
            column_name,
            other_field_name,
        ))
    }

    pub fn one_to_many(
        self,
        field_name: &str,
        other_entity: &str,
        other_column_name: &str,
        other_field_name: &str,
    ) -> Self {
        self.relation(RelationDescriptor::one_to_many(
            field_name,
            other_entity,
            other_column_name,
            other_field_name,
        ))
    }

    pub fn many_to_many(
        self,
        field_name: &str,
        other_entity: &str,
        join_table: &str,
        column_name: &str,
        other_column_name: &str,
        other_field_name: &str,
    ) -> Self {
        self.relation(RelationDescriptor::many_to_many(
            field_name,
            other_entity,
            join_table,
            column_name,
            other_column_name,
            other_field_name,
        ))
    }

    pub fn build(self) -> OrmResult<EntityMetadata> {
        let mut slots = HashMap::new();
        let mut slot_count = 0;
        let mut collection_count = 0;

        for (index, field) in self.fields.iter().enumerate() {
            let slot = SlotRef::Field {
                slot: slot_count,
                field: index,
            };
            if slots.insert(field.field_name.clone(), slot).is_some() {
                return Err(duplicate(&self.entity_name, &field.field_name));
            }
            slot_count += 1;
        }

        for (index, relation) in self.relations.iter().enumerate() {
            let slot = if relation.kind.is_collection() {
                collection_count += 1;
                SlotRef::Collection {
                    collection: collection_count - 1,
                    relation: index,
                }
            } else {
                slot_count += 1;
                SlotRef::Reference {
                    slot: slot_count - 1,
                    relation: index,
                }
            };
            if slots.insert(relation.field_name.clone(), slot).is_some() {
                return Err(duplicate(&self.entity_name, &relation.field_name));
            }
        }

        if slots.contains_key(&self.primary_key) {
            return Err(duplicate(&self.entity_name, &self.primary_key));
        }

        Ok(EntityMetadata {
            entity_name: self.entity_name,
            tag: self.tag,
            table_name: self.table_name,
            primary_key: self.primary_key,
            key_kind: self.key_kind,
            fields: self.fields,
            relations: self.relations,
            slots,
            slot_count,
            collection_count,
        })
    }
}

fn duplicate(entity: &str, field: &str) -> OrmError {
    OrmError::Metadata(format!("{} declares '{}' more than once", entity, field))
}

/// Supplies metadata per entity type
pub trait MetadataProvider: Send + Sync {
    fn metadata(&self, entity_name: &str) -> OrmResult<Arc<EntityMetadata>>;

    fn metadata_by_tag(&self, tag: &str) -> OrmResult<Arc<EntityMetadata>>;

    fn metadata_by_table(&self, table_name: &str) -> OrmResult<Arc<EntityMetadata>>;

    /// Metadata for the far side of a relation
    fn other_metadata(&self, relation: &RelationDescriptor) -> OrmResult<Arc<EntityMetadata>> {
        self.metadata(&relation.other_entity)
    }
}

/// In-process metadata provider
///
/// Registration resolves each relation's `other_tag`/`other_table` and checks
/// that both sides of every relation agree.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    by_name: HashMap<String, Arc<EntityMetadata>>,
    tags: HashMap<String, String>,
    tables: HashMap<String, String>,
}

impl MetadataRegistry {
    pub fn new(entities: Vec<EntityMetadata>) -> OrmResult<Self> {
        let mut tags = HashMap::new();
        let mut tables = HashMap::new();
        let mut lookup: HashMap<String, (String, String)> = HashMap::new();

        for meta in &entities {
            if lookup
                .insert(
                    meta.entity_name.clone(),
                    (meta.tag.clone(), meta.table_name.clone()),
                )
                .is_some()
            {
                return Err(OrmError::Metadata(format!(
                    "Entity '{}' registered twice",
                    meta.entity_name
                )));
            }
            if let Some(existing) = tags.insert(meta.tag.clone(), meta.entity_name.clone()) {
                return Err(OrmError::Metadata(format!(
                    "Tag '{}' is used by both {} and {}",
                    meta.tag, existing, meta.entity_name
                )));
            }
            tables.insert(meta.table_name.clone(), meta.entity_name.clone());
        }

        let mut by_name = HashMap::new();
        for mut meta in entities {
            for relation in &mut meta.relations {
                let (tag, table) = lookup.get(&relation.other_entity).ok_or_else(|| {
                    OrmError::Metadata(format!(
                        "{}.{} points at unknown entity '{}'",
                        meta.entity_name, relation.field_name, relation.other_entity
                    ))
                })?;
                relation.other_tag = tag.clone();
                relation.other_table = table.clone();
            }
            by_name.insert(meta.entity_name.clone(), Arc::new(meta));
        }

        let registry = Self {
            by_name,
            tags,
            tables,
        };
        registry.validate()?;
        Ok(registry)
    }

    /// Check that OneToMany relations point at a matching ManyToOne on the other side
    fn validate(&self) -> OrmResult<()> {
        for meta in self.by_name.values() {
            for relation in meta.relations.iter().filter(|r| r.kind == RelationKind::OneToMany) {
                let other = self.metadata(&relation.other_entity)?;
                let inverse = other.relation(&relation.other_field_name).ok_or_else(|| {
                    OrmError::Metadata(format!(
                        "{}.{} expects {}.{} to exist",
                        meta.entity_name, relation.field_name, other.entity_name, relation.other_field_name
                    ))
                })?;
                if inverse.kind != RelationKind::ManyToOne
                    || inverse.column_name != relation.other_column_name
                    || inverse.other_entity != meta.entity_name
                {
                    return Err(OrmError::Metadata(format!(
                        "{}.{} does not match its inverse {}.{}",
                        meta.entity_name, relation.field_name, other.entity_name, relation.other_field_name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl MetadataProvider for MetadataRegistry {
    fn metadata(&self, entity_name: &str) -> OrmResult<Arc<EntityMetadata>> {
        self.by_name
            .get(entity_name)
            .cloned()
            .ok_or_else(|| OrmError::UnknownEntity(entity_name.to_string()))
    }

    fn metadata_by_tag(&self, tag: &str) -> OrmResult<Arc<EntityMetadata>> {
        let name = self
            .tags
            .get(tag)
            .ok_or_else(|| OrmError::UnknownEntity(format!("tag '{}'", tag)))?;
        self.metadata(name)
    }

    fn metadata_by_table(&self, table_name: &str) -> OrmResult<Arc<EntityMetadata>> {
        let name = self
            .tables
            .get(table_name)
            .ok_or_else(|| OrmError::UnknownEntity(format!("table '{}'", table_name)))?;
        self.metadata(name)
    }
}
