//! Unit of Work - the request-scoped context
//!
//! Owns the identity map and the loader cache for one logical request. Create
//! one at request start and drop it at request end; nothing in it is shared
//! with other requests. All of its futures are meant to be driven from one
//! task (combine them with `join!`/`join_all` rather than spawning).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::backends::SqlExecutor;
use crate::config::BatchConfig;
use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::identity::TaggedId;
use crate::loading::{BatchKey, BatchedRelationLoader, LoaderCache};
use crate::metadata::{EntityMetadata, MetadataProvider, RelationKind};
use crate::query::{Criteria, CriteriaCompiler, SelectStatement};
use crate::registry::{EntityRegistry, HydrateOptions};
use crate::value::{DatabaseValue, Row};

/// Counters for one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitOfWorkStats {
    pub queries_executed: u64,
    pub batches_dispatched: u64,
    pub entities_hydrated: u64,
}

/// Request-scoped identity map, loader cache and query entry point
pub struct UnitOfWork {
    metadata: Arc<dyn MetadataProvider>,
    executor: Arc<dyn SqlExecutor>,
    config: BatchConfig,
    registry: EntityRegistry,
    loaders: LoaderCache,
    queries_executed: AtomicU64,
    batches_dispatched: AtomicU64,
}

impl UnitOfWork {
    pub fn new(metadata: Arc<dyn MetadataProvider>, executor: Arc<dyn SqlExecutor>) -> Self {
        Self::with_config(metadata, executor, BatchConfig::default())
    }

    pub fn with_config(
        metadata: Arc<dyn MetadataProvider>,
        executor: Arc<dyn SqlExecutor>,
        config: BatchConfig,
    ) -> Self {
        Self {
            metadata,
            executor,
            config,
            registry: EntityRegistry::new(),
            loaders: LoaderCache::new(),
            queries_executed: AtomicU64::new(0),
            batches_dispatched: AtomicU64::new(0),
        }
    }

    pub fn metadata(&self, entity_name: &str) -> OrmResult<Arc<EntityMetadata>> {
        self.metadata.metadata(entity_name)
    }

    pub fn metadata_provider(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn loaders(&self) -> &LoaderCache {
        &self.loaders
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Add a freshly constructed entity to the working set
    pub fn register(&self, entity: Entity) -> OrmResult<Entity> {
        self.registry.register(entity)
    }

    /// Construct and register a new, not yet persisted entity
    pub fn create(&self, entity_name: &str, raw_id: &str) -> OrmResult<Entity> {
        let metadata = self.metadata(entity_name)?;
        let id = metadata.parse_id(raw_id)?;
        self.register(Entity::new(metadata, id)?)
    }

    pub fn hydrate(&self, metadata: &Arc<EntityMetadata>, row: &Row, options: HydrateOptions) -> OrmResult<Entity> {
        self.registry.hydrate(metadata, row, options)
    }

    pub fn mark_dirty(&self, entity: &Entity) {
        self.registry.mark_dirty(entity);
    }

    pub fn dirty_entities(&self) -> Vec<Entity> {
        self.registry.dirty_entities()
    }

    /// Load one entity by its untagged (or tagged) id
    pub async fn load(&self, entity_name: &str, raw_id: &str) -> OrmResult<Entity> {
        let metadata = self.metadata(entity_name)?;
        let id = metadata.parse_id(raw_id)?;
        self.load_by_id(&id).await
    }

    /// Load one entity; registered instances are returned without I/O
    pub async fn load_by_id(&self, id: &TaggedId) -> OrmResult<Entity> {
        let metadata = self.metadata.metadata_by_tag(id.tag())?;
        let canonical = metadata.key_kind.canonical(id.clone())?;
        let id = &canonical;
        if let Some(entity) = self.registry.get(id) {
            tracing::trace!("Identity map hit for {}", id);
            return Ok(entity);
        }

        let loader = self.primary_key_loader(&metadata)?;
        loader
            .load(self, id.clone())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrmError::NotFound {
                entity: metadata.entity_name.clone(),
                id: id.raw().to_string(),
            })
    }

    /// Load several entities of possibly different types in one window per table
    pub async fn load_all(&self, ids: &[TaggedId]) -> OrmResult<Vec<Entity>> {
        futures::future::join_all(ids.iter().map(|id| self.load_by_id(id)))
            .await
            .into_iter()
            .collect()
    }

    /// Entities matching `criteria`, ordered by primary key
    pub async fn find(&self, entity_name: &str, criteria: &Criteria) -> OrmResult<Vec<Entity>> {
        let metadata = self.metadata(entity_name)?;
        let statement = CriteriaCompiler::new(self.metadata.as_ref()).compile(&metadata, criteria)?;
        let rows = self.run_statement(&statement).await?;
        self.registry.hydrate_all(&metadata, &rows, HydrateOptions::default())
    }

    /// `find` with criteria in their JSON shape, e.g. `{"age": {"$gt": 1}}`
    pub async fn find_json(&self, entity_name: &str, criteria: &JsonValue) -> OrmResult<Vec<Entity>> {
        let criteria = Criteria::from_json(criteria)?;
        self.find(entity_name, &criteria).await
    }

    /// Members of a collection relation, loading it on first access
    pub async fn load_collection(&self, entity: &Entity, field: &str) -> OrmResult<Vec<Entity>> {
        if let Some(ids) = entity.loaded_ids(field)? {
            return self.registry.resolve_all(&ids);
        }

        let loader = self.loader_for(entity.metadata(), field)?;
        let members = loader.load(self, entity.id().clone()).await?;
        let ids = members.iter().map(|member| member.id().clone()).collect();
        let held = entity.fill_collection(field, ids)?;
        self.registry.resolve_all(&held)
    }

    /// Target of a ManyToOne field, `None` when the field is empty
    pub async fn load_reference(&self, entity: &Entity, field: &str) -> OrmResult<Option<Entity>> {
        match entity.reference(field)? {
            Some(id) => self.load_by_id(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Point a ManyToOne field at another entity (or clear it). Inverse
    /// collections that are already loaded are kept in step.
    pub fn set_reference(&self, entity: &Entity, field: &str, target: Option<&TaggedId>) -> OrmResult<()> {
        let relation = entity.metadata().require_relation(field)?;
        if relation.kind != RelationKind::ManyToOne {
            return Err(entity.metadata().unknown_field(field));
        }

        let previous = entity.replace_reference(field, target.cloned())?;
        if previous.as_ref() == target {
            return Ok(());
        }

        let other = self.metadata.other_metadata(relation)?;
        let inverse = &relation.other_field_name;
        let has_inverse = other
            .relation(inverse)
            .map_or(false, |inverse| inverse.kind == RelationKind::OneToMany);
        if !has_inverse {
            return Ok(());
        }

        if let Some(old_owner) = previous.and_then(|id| self.registry.get(&id)) {
            old_owner.update_loaded_collection(inverse, |ids| ids.retain(|id| id != entity.id()))?;
        }
        if let Some(new_owner) = target.and_then(|id| self.registry.get(id)) {
            new_owner.update_loaded_collection(inverse, |ids| {
                if !ids.contains(entity.id()) {
                    ids.push(entity.id().clone());
                }
            })?;
        }
        Ok(())
    }

    /// Cached loader for a relation field of `metadata`
    pub fn loader_for(&self, metadata: &Arc<EntityMetadata>, field: &str) -> OrmResult<Arc<BatchedRelationLoader>> {
        let relation = metadata.require_relation(field)?;
        if relation.kind == RelationKind::ManyToOne {
            let other = self.metadata.other_metadata(relation)?;
            return self.primary_key_loader(&other);
        }

        let key = BatchKey::new(&metadata.table_name, field);
        self.loaders.get_or_create(&key, || {
            BatchedRelationLoader::for_relation(self.metadata.as_ref(), metadata, field, &self.config)
        })
    }

    /// Cached loader for rows of `metadata`'s table by id
    pub fn primary_key_loader(&self, metadata: &Arc<EntityMetadata>) -> OrmResult<Arc<BatchedRelationLoader>> {
        let key = BatchKey::new(&metadata.table_name, &metadata.primary_key);
        self.loaders
            .get_or_create(&key, || Ok(BatchedRelationLoader::primary_key(metadata, &self.config)))
    }

    pub fn stats(&self) -> UnitOfWorkStats {
        UnitOfWorkStats {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            entities_hydrated: self.registry.hydrated_count(),
        }
    }

    pub(crate) fn record_batch(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) async fn run_query(
        &self,
        table: &str,
        column: &str,
        keys: &[DatabaseValue],
        order_by: &str,
    ) -> OrmResult<Vec<Row>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.executor.query(table, column, keys, order_by).await
    }

    async fn run_statement(&self, statement: &SelectStatement) -> OrmResult<Vec<Row>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.executor.execute(statement).await
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("loaders", &self.loaders)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryExecutor;
    use crate::tests::fixtures::{metadata, seeded_store, text};

    fn unit_of_work() -> (UnitOfWork, Arc<InMemoryExecutor>) {
        let store = Arc::new(seeded_store());
        (UnitOfWork::new(metadata(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_load_hits_identity_map() {
        let (uow, store) = unit_of_work();
        let first = uow.load("Author", "1").await.unwrap();
        let second = uow.load("Author", "a:1").await.unwrap();
        assert!(first.same_instance(&second));
        assert_eq!(store.query_count(), 1);
        assert_eq!(first.get("firstName").unwrap(), text("a1"));
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let (uow, _) = unit_of_work();
        let err = uow.load("Author", "99").await.unwrap_err();
        assert!(matches!(err, OrmError::NotFound { ref entity, ref id } if entity == "Author" && id == "99"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_tag() {
        let (uow, store) = unit_of_work();
        assert!(matches!(uow.load("Author", "b:1").await, Err(OrmError::InvalidId(_))));
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn test_create_then_load_skips_database() {
        let (uow, store) = unit_of_work();
        let fresh = uow.create("Author", "10").unwrap();
        fresh.set("firstName", "new").unwrap();
        let loaded = uow.load("Author", "10").await.unwrap();
        assert!(loaded.same_instance(&fresh));
        assert_eq!(store.query_count(), 0);
        assert!(matches!(
            uow.create("Author", "10"),
            Err(OrmError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_hydrates_through_registry() {
        let (uow, _) = unit_of_work();
        let a2 = uow.load("Author", "2").await.unwrap();
        a2.set("firstName", "edited").unwrap();

        let found = uow.find("Author", &Criteria::new()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[1].same_instance(&a2));
        assert_eq!(found[1].get("firstName").unwrap(), text("edited"));
        assert_eq!(uow.stats().entities_hydrated, 2);
    }

    #[tokio::test]
    async fn test_load_reference_and_collection() {
        let (uow, store) = unit_of_work();
        let book = uow.load("Book", "2").await.unwrap();
        let author = uow.load_reference(&book, "author").await.unwrap().unwrap();
        assert_eq!(author.id(), &TaggedId::new("a", "2"));

        let books = uow.load_collection(&author, "books").await.unwrap();
        assert_eq!(books.len(), 2);
        assert!(books[0].same_instance(&book));
        assert!(author.is_loaded("books").unwrap());

        let queries = store.query_count();
        let again = uow.load_collection(&author, "books").await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn test_set_reference_moves_between_loaded_collections() {
        let (uow, _) = unit_of_work();
        let a1 = uow.load("Author", "1").await.unwrap();
        let a2 = uow.load("Author", "2").await.unwrap();
        assert_eq!(uow.load_collection(&a1, "books").await.unwrap().len(), 1);
        let a2_books = uow.load_collection(&a2, "books").await.unwrap();
        let b2 = a2_books[0].clone();

        uow.set_reference(&b2, "author", Some(a1.id())).unwrap();

        let a1_books = uow.load_collection(&a1, "books").await.unwrap();
        let a2_books = uow.load_collection(&a2, "books").await.unwrap();
        assert_eq!(a1_books.len(), 2);
        assert!(a1_books[1].same_instance(&b2));
        assert_eq!(a2_books.len(), 1);
        assert!(b2.is_dirty());
        assert_eq!(uow.dirty_entities().len(), 1);
    }

    #[tokio::test]
    async fn test_move_to_unloaded_owner_is_visible() {
        let (uow, _) = unit_of_work();
        let a1 = uow.load("Author", "1").await.unwrap();
        let a2 = uow.load("Author", "2").await.unwrap();
        let b1 = uow.load_collection(&a1, "books").await.unwrap().remove(0);
        assert!(!a2.is_loaded("books").unwrap());

        uow.set_reference(&b1, "author", Some(a2.id())).unwrap();

        let a2_books = uow.load_collection(&a2, "books").await.unwrap();
        let ids: Vec<_> = a2_books.iter().map(|b| b.id().to_string()).collect();
        assert_eq!(ids, vec!["b:2", "b:3", "b:1"]);
        assert!(a2_books[2].same_instance(&b1));
        assert!(uow.load_collection(&a1, "books").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_child_joins_unloaded_owner() {
        let (uow, _) = unit_of_work();
        let a1 = uow.load("Author", "1").await.unwrap();
        let fresh = uow.create("Book", "10").unwrap();
        uow.set_reference(&fresh, "author", Some(a1.id())).unwrap();

        let books = uow.load_collection(&a1, "books").await.unwrap();
        assert_eq!(books.len(), 2);
        assert!(books[1].same_instance(&fresh));
    }

    #[tokio::test]
    async fn test_non_canonical_id_finds_the_same_instance() {
        let (uow, store) = unit_of_work();
        let padded = uow.load("Author", "01").await.unwrap();
        assert_eq!(padded.id(), &TaggedId::new("a", "1"));
        let plain = uow.load("Author", "1").await.unwrap();
        assert!(padded.same_instance(&plain));
        let tagged = uow.load_by_id(&TaggedId::new("a", "001")).await.unwrap();
        assert!(tagged.same_instance(&plain));
        assert_eq!(store.query_count(), 1);
        assert!(uow.create("Author", "001").is_err());
    }

    #[tokio::test]
    async fn test_set_reference_rejects_collections() {
        let (uow, _) = unit_of_work();
        let a1 = uow.load("Author", "1").await.unwrap();
        assert!(uow.set_reference(&a1, "books", None).is_err());
    }

    #[tokio::test]
    async fn test_loader_for_shares_primary_key_loader() {
        let (uow, _) = unit_of_work();
        let book = uow.metadata("Book").unwrap();
        let author = uow.metadata("Author").unwrap();
        let via_reference = uow.loader_for(&book, "author").unwrap();
        let direct = uow.primary_key_loader(&author).unwrap();
        assert!(Arc::ptr_eq(&via_reference, &direct));
        assert!(uow.loader_for(&book, "title").is_err());
    }
}
