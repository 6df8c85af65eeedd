//! Entity instances
//!
//! An [`Entity`] is a cheap handle to one in-memory instance. Values live in a
//! slot vector laid out by the entity's metadata. ManyToOne slots and loaded
//! collections hold [`TaggedId`]s that resolve through the unit of work's
//! registry, so instances never point at each other directly.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value as JsonValue};

use crate::error::{OrmError, OrmResult};
use crate::identity::TaggedId;
use crate::metadata::{EntityMetadata, FieldKind, RelationKind, SlotRef};
use crate::value::{DatabaseValue, Row};

/// Value held in one slot
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(DatabaseValue),
    Reference(Option<TaggedId>),
}

#[derive(Debug)]
struct EntityState {
    slots: Vec<FieldValue>,
    collections: Vec<Option<Vec<TaggedId>>>,
    dirty: bool,
}

struct EntityInner {
    id: TaggedId,
    metadata: Arc<EntityMetadata>,
    state: RwLock<EntityState>,
}

/// Handle to an in-memory entity instance; clones share the instance
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    /// Construct an empty instance; the id must carry the entity's tag and is
    /// stored in its canonical spelling
    pub fn new(metadata: Arc<EntityMetadata>, id: TaggedId) -> OrmResult<Self> {
        if !id.has_tag(&metadata.tag) {
            return Err(OrmError::InvalidId(format!(
                "{} is not a {} id",
                id, metadata.entity_name
            )));
        }
        let id = metadata.key_kind.canonical(id)?;

        let mut slots = vec![FieldValue::Value(DatabaseValue::Null); metadata.slot_count()];
        for relation in metadata.relations.iter().filter(|r| r.kind == RelationKind::ManyToOne) {
            if let Some(SlotRef::Reference { slot, .. }) = metadata.slot(&relation.field_name) {
                slots[slot] = FieldValue::Reference(None);
            }
        }

        let state = EntityState {
            slots,
            collections: vec![None; metadata.collection_count()],
            dirty: false,
        };

        Ok(Self {
            inner: Arc::new(EntityInner {
                id,
                metadata,
                state: RwLock::new(state),
            }),
        })
    }

    /// Build an instance from a row
    pub fn from_row(metadata: Arc<EntityMetadata>, row: &Row) -> OrmResult<Self> {
        let id = Self::row_id(&metadata, row)?;
        let entity = Self::new(metadata, id)?;
        entity.apply_row(row)?;
        Ok(entity)
    }

    /// Primary key of a row, tagged for the given entity type
    pub fn row_id(metadata: &EntityMetadata, row: &Row) -> OrmResult<TaggedId> {
        let value = row.get(&metadata.primary_key).ok_or_else(|| {
            OrmError::Hydration(format!(
                "Row for {} has no '{}' column",
                metadata.entity_name, metadata.primary_key
            ))
        })?;
        TaggedId::from_value(&metadata.tag, value)
    }

    /// Replace every slot with the row's values and clear the dirty flag
    pub(crate) fn apply_row(&self, row: &Row) -> OrmResult<()> {
        let metadata = &self.inner.metadata;
        let mut slots = Vec::with_capacity(metadata.slot_count());
        slots.resize(metadata.slot_count(), FieldValue::Value(DatabaseValue::Null));

        for field in &metadata.fields {
            if let Some(SlotRef::Field { slot, .. }) = metadata.slot(&field.field_name) {
                slots[slot] = FieldValue::Value(row.get_or_null(&field.column_name));
            }
        }

        for relation in metadata.relations.iter().filter(|r| r.kind == RelationKind::ManyToOne) {
            if let Some(SlotRef::Reference { slot, .. }) = metadata.slot(&relation.field_name) {
                let value = row.get_or_null(relation.require_column()?);
                let reference = if value.is_null() {
                    None
                } else {
                    Some(TaggedId::from_value(&relation.other_tag, &value)?)
                };
                slots[slot] = FieldValue::Reference(reference);
            }
        }

        let mut state = self.inner.state.write();
        state.slots = slots;
        state.dirty = false;
        Ok(())
    }

    pub fn id(&self) -> &TaggedId {
        &self.inner.id
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.inner.metadata
    }

    pub fn entity_name(&self) -> &str {
        &self.inner.metadata.entity_name
    }

    /// Reference equality
    pub fn same_instance(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a primitive or enum field; the primary key reads as its raw value
    pub fn get(&self, field: &str) -> OrmResult<DatabaseValue> {
        let metadata = &self.inner.metadata;
        if metadata.is_primary_key(field) {
            return metadata.key_value(&self.inner.id);
        }
        match metadata.require_slot(field)? {
            SlotRef::Field { slot, .. } => match &self.inner.state.read().slots[slot] {
                FieldValue::Value(value) => Ok(value.clone()),
                FieldValue::Reference(_) => Err(metadata.unknown_field(field)),
            },
            _ => Err(metadata.unknown_field(field)),
        }
    }

    /// Write a primitive or enum field and mark the instance dirty. Enum
    /// fields accept the backing id, the code or the name.
    pub fn set(&self, field: &str, value: impl Into<DatabaseValue>) -> OrmResult<()> {
        let metadata = &self.inner.metadata;
        let (slot, index) = match metadata.require_slot(field)? {
            SlotRef::Field { slot, field } => (slot, field),
            _ => return Err(metadata.unknown_field(field)),
        };

        let mut value = value.into();
        if let FieldKind::Enum(descriptor) = &metadata.fields[index].kind {
            if !value.is_null() {
                let id = descriptor.resolve(&value).ok_or_else(|| {
                    OrmError::InvalidId(format!("{:?} is not a {} value", value, descriptor.enum_name))
                })?;
                value = DatabaseValue::Int64(id);
            }
        }

        let mut state = self.inner.state.write();
        state.slots[slot] = FieldValue::Value(value);
        state.dirty = true;
        Ok(())
    }

    /// Current owner id held by a ManyToOne field
    pub fn reference(&self, field: &str) -> OrmResult<Option<TaggedId>> {
        let metadata = &self.inner.metadata;
        match metadata.require_slot(field)? {
            SlotRef::Reference { slot, .. } => match &self.inner.state.read().slots[slot] {
                FieldValue::Reference(id) => Ok(id.clone()),
                FieldValue::Value(_) => Err(metadata.unknown_field(field)),
            },
            _ => Err(metadata.unknown_field(field)),
        }
    }

    /// Point a ManyToOne field elsewhere; returns the previous target.
    /// Inverse collections are kept in sync by `UnitOfWork::set_reference`.
    pub(crate) fn replace_reference(&self, field: &str, target: Option<TaggedId>) -> OrmResult<Option<TaggedId>> {
        let metadata = &self.inner.metadata;
        let (slot, relation) = match metadata.require_slot(field)? {
            SlotRef::Reference { slot, relation } => (slot, relation),
            _ => return Err(metadata.unknown_field(field)),
        };
        if let Some(id) = &target {
            let expected = &metadata.relations[relation].other_tag;
            if !id.has_tag(expected) {
                return Err(OrmError::InvalidId(format!(
                    "{}.{} expects a '{}' id, got {}",
                    metadata.entity_name, field, expected, id
                )));
            }
        }

        let mut state = self.inner.state.write();
        let previous = match std::mem::replace(&mut state.slots[slot], FieldValue::Reference(target)) {
            FieldValue::Reference(previous) => previous,
            FieldValue::Value(_) => None,
        };
        state.dirty = true;
        Ok(previous)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.read().dirty
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.state.write().dirty = true;
    }

    /// Whether a collection relation has been loaded on this instance
    pub fn is_loaded(&self, field: &str) -> OrmResult<bool> {
        let index = self.collection_index(field)?;
        Ok(self.inner.state.read().collections[index].is_some())
    }

    /// Ids of a loaded collection, `None` while unloaded
    pub fn loaded_ids(&self, field: &str) -> OrmResult<Option<Vec<TaggedId>>> {
        let index = self.collection_index(field)?;
        Ok(self.inner.state.read().collections[index].clone())
    }

    /// Store a collection's ids unless another load got there first.
    /// Returns the ids that are now held.
    pub(crate) fn fill_collection(&self, field: &str, ids: Vec<TaggedId>) -> OrmResult<Vec<TaggedId>> {
        let index = self.collection_index(field)?;
        let mut state = self.inner.state.write();
        Ok(state.collections[index].get_or_insert(ids).clone())
    }

    /// Edit a loaded collection in place; no-op while unloaded
    pub(crate) fn update_loaded_collection<F>(&self, field: &str, update: F) -> OrmResult<bool>
    where
        F: FnOnce(&mut Vec<TaggedId>),
    {
        let index = self.collection_index(field)?;
        let mut state = self.inner.state.write();
        match state.collections[index].as_mut() {
            Some(ids) => {
                update(ids);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn collection_index(&self, field: &str) -> OrmResult<usize> {
        let metadata = &self.inner.metadata;
        match metadata.require_slot(field)? {
            SlotRef::Collection { collection, .. } => Ok(collection),
            _ => Err(metadata.unknown_field(field)),
        }
    }

    /// Field values keyed by field name; references render as tagged ids
    pub fn to_json(&self) -> JsonValue {
        let metadata = &self.inner.metadata;
        let state = self.inner.state.read();
        let mut map = Map::new();
        map.insert("id".to_string(), JsonValue::String(self.inner.id.to_string()));

        for field in &metadata.fields {
            if let Some(SlotRef::Field { slot, .. }) = metadata.slot(&field.field_name) {
                if let FieldValue::Value(value) = &state.slots[slot] {
                    map.insert(field.field_name.clone(), value.to_json());
                }
            }
        }
        for relation in metadata.relations.iter().filter(|r| r.kind == RelationKind::ManyToOne) {
            if let Some(SlotRef::Reference { slot, .. }) = metadata.slot(&relation.field_name) {
                if let FieldValue::Reference(id) = &state.slots[slot] {
                    let value = id
                        .as_ref()
                        .map(|id| JsonValue::String(id.to_string()))
                        .unwrap_or(JsonValue::Null);
                    map.insert(relation.field_name.clone(), value);
                }
            }
        }
        JsonValue::Object(map)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name(), self.inner.id.raw())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EnumDescriptor, EnumValue, MetadataProvider, MetadataRegistry};
    use serde_json::json;

    fn registry() -> MetadataRegistry {
        let sizes = EnumDescriptor {
            enum_name: "PublisherSize".into(),
            table_name: "publisher_size".into(),
            values: vec![EnumValue::new(1, "SMALL", "Small"), EnumValue::new(2, "LARGE", "Large")],
        };
        MetadataRegistry::new(vec![
            EntityMetadata::builder("Publisher", "p", "publishers")
                .field("name", "name")
                .enum_field("size", "size_id", sizes)
                .build()
                .unwrap(),
            EntityMetadata::builder("Author", "a", "authors")
                .field("firstName", "first_name")
                .many_to_one("publisher", "Publisher", "publisher_id", "authors")
                .one_to_many("books", "Book", "author_id", "author")
                .build()
                .unwrap(),
            EntityMetadata::builder("Book", "b", "books")
                .field("title", "title")
                .many_to_one("author", "Author", "author_id", "books")
                .build()
                .unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_row_reads_fields_and_references() {
        let meta = registry().metadata("Book").unwrap();
        let row = Row::new()
            .with_column("id", 1)
            .with_column("title", "b1")
            .with_column("author_id", 2);
        let book = Entity::from_row(meta, &row).unwrap();

        assert_eq!(book.id(), &TaggedId::new("b", "1"));
        assert_eq!(book.get("title").unwrap(), DatabaseValue::from("b1"));
        assert_eq!(book.get("id").unwrap(), DatabaseValue::Int64(1));
        assert_eq!(book.reference("author").unwrap(), Some(TaggedId::new("a", "2")));
        assert!(!book.is_dirty());
        assert_eq!(book.to_string(), "Book#1");
    }

    #[test]
    fn test_null_foreign_key_is_no_reference() {
        let meta = registry().metadata("Author").unwrap();
        let row = Row::new()
            .with_column("id", 1)
            .with_column("first_name", "a1")
            .with_column("publisher_id", DatabaseValue::Null);
        let author = Entity::from_row(meta, &row).unwrap();
        assert_eq!(author.reference("publisher").unwrap(), None);
    }

    #[test]
    fn test_row_without_primary_key_fails() {
        let meta = registry().metadata("Book").unwrap();
        let result = Entity::from_row(meta, &Row::new().with_column("title", "b1"));
        assert!(matches!(result, Err(OrmError::Hydration(_))));
    }

    #[test]
    fn test_set_marks_dirty() {
        let meta = registry().metadata("Author").unwrap();
        let author = Entity::new(meta, TaggedId::new("a", "1")).unwrap();
        assert!(!author.is_dirty());
        author.set("firstName", "changed").unwrap();
        assert!(author.is_dirty());
        assert_eq!(author.get("firstName").unwrap(), DatabaseValue::from("changed"));
        assert!(matches!(author.set("books", 1), Err(OrmError::UnknownField { .. })));
        assert!(matches!(author.get("nope"), Err(OrmError::UnknownField { .. })));
    }

    #[test]
    fn test_enum_set_resolves_codes() {
        let meta = registry().metadata("Publisher").unwrap();
        let publisher = Entity::new(meta, TaggedId::new("p", "1")).unwrap();
        publisher.set("size", "LARGE").unwrap();
        assert_eq!(publisher.get("size").unwrap(), DatabaseValue::Int64(2));
        assert!(publisher.set("size", "HUGE").is_err());
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let meta = registry().metadata("Author").unwrap();
        assert!(Entity::new(meta.clone(), TaggedId::new("b", "1")).is_err());
        let author = Entity::new(meta, TaggedId::new("a", "1")).unwrap();
        assert!(author
            .replace_reference("publisher", Some(TaggedId::new("a", "2")))
            .is_err());
    }

    #[test]
    fn test_replace_reference_returns_previous() {
        let meta = registry().metadata("Book").unwrap();
        let row = Row::new().with_column("id", 1).with_column("author_id", 2);
        let book = Entity::from_row(meta, &row).unwrap();
        let previous = book
            .replace_reference("author", Some(TaggedId::new("a", "3")))
            .unwrap();
        assert_eq!(previous, Some(TaggedId::new("a", "2")));
        assert_eq!(book.reference("author").unwrap(), Some(TaggedId::new("a", "3")));
        assert!(book.is_dirty());
    }

    #[test]
    fn test_collection_fills_once() {
        let meta = registry().metadata("Author").unwrap();
        let author = Entity::new(meta, TaggedId::new("a", "1")).unwrap();
        assert!(!author.is_loaded("books").unwrap());
        assert!(!author
            .update_loaded_collection("books", |ids| ids.clear())
            .unwrap());

        let first = author.fill_collection("books", vec![TaggedId::new("b", "1")]).unwrap();
        let second = author.fill_collection("books", vec![TaggedId::new("b", "2")]).unwrap();
        assert_eq!(first, second);
        assert_eq!(author.loaded_ids("books").unwrap(), Some(vec![TaggedId::new("b", "1")]));
    }

    #[test]
    fn test_clones_share_the_instance() {
        let meta = registry().metadata("Author").unwrap();
        let author = Entity::new(meta.clone(), TaggedId::new("a", "1")).unwrap();
        let handle = author.clone();
        handle.set("firstName", "shared").unwrap();
        assert!(author.same_instance(&handle));
        assert_eq!(author.get("firstName").unwrap(), DatabaseValue::from("shared"));

        let twin = Entity::new(meta, TaggedId::new("a", "1")).unwrap();
        assert!(!author.same_instance(&twin));
    }

    #[test]
    fn test_to_json() {
        let meta = registry().metadata("Book").unwrap();
        let row = Row::new()
            .with_column("id", 1)
            .with_column("title", "b1")
            .with_column("author_id", 2);
        let book = Entity::from_row(meta, &row).unwrap();
        assert_eq!(
            book.to_json(),
            json!({"id": "b:1", "title": "b1", "author": "a:2"})
        );
    }
}
