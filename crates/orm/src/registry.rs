//! Entity Registry - the identity map behind a unit of work
//!
//! Holds at most one live instance per [`TaggedId`]. Hydration consults the
//! registry first so a row that is fetched twice resolves to the same object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::identity::TaggedId;
use crate::metadata::EntityMetadata;
use crate::value::Row;

/// How hydration treats an instance that is already registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HydrateOptions {
    /// Replace the existing instance's values with the row's
    pub overwrite_existing: bool,
}

impl HydrateOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite_existing: true,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entities: HashMap<TaggedId, Entity>,
    order: Vec<TaggedId>,
}

/// Identity map keyed by tagged id
#[derive(Default)]
pub struct EntityRegistry {
    state: RwLock<RegistryState>,
    hydrated: AtomicU64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance; fails if its id is already present
    pub fn register(&self, entity: Entity) -> OrmResult<Entity> {
        let mut state = self.state.write();
        if state.entities.contains_key(entity.id()) {
            return Err(OrmError::DuplicateRegistration {
                id: entity.id().clone(),
            });
        }
        state.order.push(entity.id().clone());
        state.entities.insert(entity.id().clone(), entity.clone());
        Ok(entity)
    }

    /// Resolve a row to its registered instance, creating it on first sight
    pub fn hydrate(&self, metadata: &Arc<EntityMetadata>, row: &Row, options: HydrateOptions) -> OrmResult<Entity> {
        let id = Entity::row_id(metadata, row)?;

        let mut state = self.state.write();
        if let Some(existing) = state.entities.get(&id) {
            if options.overwrite_existing {
                tracing::trace!("Refreshing {} from row", id);
                existing.apply_row(row)?;
            } else {
                tracing::trace!("Hydration hit for {}", id);
            }
            return Ok(existing.clone());
        }

        tracing::trace!("Hydrating new instance {}", id);
        let entity = Entity::from_row(Arc::clone(metadata), row)?;
        state.order.push(id.clone());
        state.entities.insert(id, entity.clone());
        self.hydrated.fetch_add(1, Ordering::Relaxed);
        Ok(entity)
    }

    /// Hydrate every row in order
    pub fn hydrate_all(&self, metadata: &Arc<EntityMetadata>, rows: &[Row], options: HydrateOptions) -> OrmResult<Vec<Entity>> {
        rows.iter().map(|row| self.hydrate(metadata, row, options)).collect()
    }

    /// Flag an instance as modified; idempotent
    pub fn mark_dirty(&self, entity: &Entity) {
        entity.mark_dirty();
    }

    pub fn get(&self, id: &TaggedId) -> Option<Entity> {
        self.state.read().entities.get(id).cloned()
    }

    pub fn contains(&self, id: &TaggedId) -> bool {
        self.state.read().entities.contains_key(id)
    }

    /// Resolve ids that are all expected to be registered
    pub fn resolve_all(&self, ids: &[TaggedId]) -> OrmResult<Vec<Entity>> {
        let state = self.state.read();
        ids.iter()
            .map(|id| {
                state.entities.get(id).cloned().ok_or_else(|| {
                    OrmError::Hydration(format!("{} is referenced but not registered", id))
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entities.is_empty()
    }

    /// Modified instances in registration order
    pub fn dirty_entities(&self) -> Vec<Entity> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.entities.get(id))
            .filter(|entity| entity.is_dirty())
            .cloned()
            .collect()
    }

    /// Registered instances of one entity type, in registration order
    pub fn entities_of(&self, entity_name: &str) -> Vec<Entity> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.entities.get(id))
            .filter(|entity| entity.entity_name() == entity_name)
            .cloned()
            .collect()
    }

    /// Number of instances created by hydration
    pub fn hydrated_count(&self) -> u64 {
        self.hydrated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("len", &self.len())
            .field("hydrated", &self.hydrated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DatabaseValue;

    fn author_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::builder("Author", "a", "authors")
                .field("firstName", "first_name")
                .build()
                .unwrap(),
        )
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new().with_column("id", id).with_column("first_name", name)
    }

    #[test]
    fn test_hydrate_returns_same_instance() {
        let registry = EntityRegistry::new();
        let meta = author_meta();
        let first = registry.hydrate(&meta, &row(1, "a1"), HydrateOptions::default()).unwrap();
        let second = registry.hydrate(&meta, &row(1, "a1"), HydrateOptions::default()).unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.hydrated_count(), 1);
    }

    #[test]
    fn test_existing_instance_wins_without_overwrite() {
        let registry = EntityRegistry::new();
        let meta = author_meta();
        let author = registry.hydrate(&meta, &row(1, "a1"), HydrateOptions::default()).unwrap();
        author.set("firstName", "local").unwrap();

        registry.hydrate(&meta, &row(1, "from db"), HydrateOptions::default()).unwrap();
        assert_eq!(author.get("firstName").unwrap(), DatabaseValue::from("local"));
        assert!(author.is_dirty());

        let refreshed = registry.hydrate(&meta, &row(1, "from db"), HydrateOptions::overwrite()).unwrap();
        assert!(refreshed.same_instance(&author));
        assert_eq!(author.get("firstName").unwrap(), DatabaseValue::from("from db"));
        assert!(!author.is_dirty());
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = EntityRegistry::new();
        let meta = author_meta();
        registry
            .register(Entity::new(meta.clone(), TaggedId::new("a", "1")).unwrap())
            .unwrap();
        let result = registry.register(Entity::new(meta, TaggedId::new("a", "1")).unwrap());
        assert!(matches!(
            result,
            Err(OrmError::DuplicateRegistration { id }) if id == TaggedId::new("a", "1")
        ));
    }

    #[test]
    fn test_dirty_entities_in_registration_order() {
        let registry = EntityRegistry::new();
        let meta = author_meta();
        let a1 = registry.hydrate(&meta, &row(1, "a1"), HydrateOptions::default()).unwrap();
        let a2 = registry.hydrate(&meta, &row(2, "a2"), HydrateOptions::default()).unwrap();
        let a3 = registry.hydrate(&meta, &row(3, "a3"), HydrateOptions::default()).unwrap();

        registry.mark_dirty(&a3);
        registry.mark_dirty(&a1);
        registry.mark_dirty(&a1);

        let dirty = registry.dirty_entities();
        assert_eq!(dirty.len(), 2);
        assert!(dirty[0].same_instance(&a1));
        assert!(dirty[1].same_instance(&a3));
        assert!(!a2.is_dirty());
    }

    #[test]
    fn test_resolve_all_requires_registration() {
        let registry = EntityRegistry::new();
        let meta = author_meta();
        registry.hydrate(&meta, &row(1, "a1"), HydrateOptions::default()).unwrap();
        assert_eq!(registry.resolve_all(&[TaggedId::new("a", "1")]).unwrap().len(), 1);
        assert!(registry.resolve_all(&[TaggedId::new("a", "2")]).is_err());
        assert_eq!(registry.entities_of("Author").len(), 1);
        assert!(registry.entities_of("Book").is_empty());
    }
}
