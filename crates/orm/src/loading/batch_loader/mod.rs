//! Batched Relation Loader
//!
//! Coalesces independent single-key lookups into one IN-query. Each `load`
//! enqueues its key with a oneshot result slot and waits out the coalescing
//! window; the first waiter to resume takes the whole pending batch, runs it
//! and answers every slot in call order. Loads issued while a batch is in
//! flight start a new batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::loader_cache::BatchKey;
use crate::config::{BatchConfig, BatchWindow};
use crate::entity::Entity;
use crate::error::{OrmError, OrmResult};
use crate::identity::{untag_all, KeyKind, TaggedId};
use crate::metadata::{EntityMetadata, MetadataProvider, RelationDescriptor, RelationKind};
use crate::registry::HydrateOptions;
use crate::unit_of_work::UnitOfWork;
use crate::value::Row;


/// What a loader fetches for each key
#[derive(Debug, Clone)]
pub enum LoaderKind {
    /// Rows of a table by primary key
    PrimaryKey { metadata: Arc<EntityMetadata> },
    /// Rows of the other table whose foreign key points at the owner
    OneToMany {
        relation: RelationDescriptor,
        other: Arc<EntityMetadata>,
    },
    /// Rows reached through a join table
    ManyToMany {
        owner: Arc<EntityMetadata>,
        relation: RelationDescriptor,
        other: Arc<EntityMetadata>,
    },
}

struct PendingLoad {
    key: TaggedId,
    slot: oneshot::Sender<OrmResult<Vec<Entity>>>,
}

/// Loader that merges same-window requests into batched queries
pub struct BatchedRelationLoader {
    batch_key: BatchKey,
    kind: LoaderKind,
    key_tag: String,
    key_kind: KeyKind,
    max_batch_size: usize,
    window: BatchWindow,
    pending: Mutex<Vec<PendingLoad>>,
}

impl BatchedRelationLoader {
    /// Loader for rows of `metadata`'s table by id
    pub fn primary_key(metadata: &Arc<EntityMetadata>, config: &BatchConfig) -> Self {
        Self::new(
            BatchKey::new(&metadata.table_name, &metadata.primary_key),
            metadata,
            LoaderKind::PrimaryKey {
                metadata: Arc::clone(metadata),
            },
            config,
        )
    }

    /// Loader for a relation field of `owner`. ManyToOne fields resolve to the
    /// primary-key loader of the other table.
    pub fn for_relation(
        provider: &dyn MetadataProvider,
        owner: &Arc<EntityMetadata>,
        field: &str,
        config: &BatchConfig,
    ) -> OrmResult<Self> {
        let relation = owner.require_relation(field)?;
        let other = provider.other_metadata(relation)?;

        let loader = match relation.kind {
            RelationKind::ManyToOne => Self::primary_key(&other, config),
            RelationKind::OneToMany => {
                relation.require_other_column()?;
                Self::new(
                    BatchKey::new(&owner.table_name, field),
                    owner,
                    LoaderKind::OneToMany {
                        relation: relation.clone(),
                        other,
                    },
                    config,
                )
            }
            RelationKind::ManyToMany => {
                relation.require_join_table()?;
                relation.require_column()?;
                relation.require_other_column()?;
                Self::new(
                    BatchKey::new(&owner.table_name, field),
                    owner,
                    LoaderKind::ManyToMany {
                        owner: Arc::clone(owner),
                        relation: relation.clone(),
                        other,
                    },
                    config,
                )
            }
        };
        Ok(loader)
    }

    fn new(batch_key: BatchKey, keyed_by: &EntityMetadata, kind: LoaderKind, config: &BatchConfig) -> Self {
        Self {
            batch_key,
            kind,
            key_tag: keyed_by.tag.clone(),
            key_kind: keyed_by.key_kind,
            max_batch_size: config.max_batch_size.max(1),
            window: config.window,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_key(&self) -> &BatchKey {
        &self.batch_key
    }

    pub fn kind(&self) -> &LoaderKind {
        &self.kind
    }

    /// Number of keys waiting for the current window to close
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Entities for one key. Loads issued in the same window share one query.
    pub async fn load(&self, uow: &UnitOfWork, key: TaggedId) -> OrmResult<Vec<Entity>> {
        if !key.has_tag(&self.key_tag) {
            return Err(OrmError::InvalidId(format!(
                "{} cannot be loaded through {}",
                key, self.batch_key
            )));
        }
        let key = self.key_kind.canonical(key)?;

        let (slot, result) = oneshot::channel();
        let full_batch = {
            let mut pending = self.pending.lock();
            pending.push(PendingLoad { key, slot });
            if pending.len() >= self.max_batch_size {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };

        match full_batch {
            Some(batch) => self.dispatch(uow, batch).await,
            None => {
                match self.window {
                    BatchWindow::Yield => tokio::task::yield_now().await,
                    BatchWindow::Delay(duration) => tokio::time::sleep(duration).await,
                }
                let batch = std::mem::take(&mut *self.pending.lock());
                if !batch.is_empty() {
                    self.dispatch(uow, batch).await;
                }
            }
        }

        result.await.map_err(|_| {
            OrmError::batch(
                self.batch_key.to_string(),
                OrmError::Database("batch was dropped before it completed".to_string()),
            )
        })?
    }

    /// Load several keys in one window; results follow `keys`
    pub async fn load_many(&self, uow: &UnitOfWork, keys: Vec<TaggedId>) -> OrmResult<Vec<Vec<Entity>>> {
        join_all(keys.into_iter().map(|key| self.load(uow, key)))
            .await
            .into_iter()
            .collect()
    }

    /// Boxed `load`, used where loaders call back into loaders
    pub fn load_boxed<'a>(&'a self, uow: &'a UnitOfWork, key: TaggedId) -> BoxFuture<'a, OrmResult<Vec<Entity>>> {
        Box::pin(self.load(uow, key))
    }

    async fn dispatch(&self, uow: &UnitOfWork, batch: Vec<PendingLoad>) {
        let mut seen = HashSet::new();
        let distinct: Vec<TaggedId> = batch
            .iter()
            .filter(|pending| seen.insert(pending.key.clone()))
            .map(|pending| pending.key.clone())
            .collect();

        tracing::debug!(
            "Dispatching batch {} with {} requested / {} distinct keys",
            self.batch_key,
            batch.len(),
            distinct.len()
        );
        uow.record_batch();

        match self.fetch_groups(uow, &distinct).await {
            Ok(groups) => {
                for pending in batch {
                    let entities = groups.get(&pending.key).cloned().unwrap_or_default();
                    let _ = pending.slot.send(Ok(entities));
                }
            }
            Err(error) => {
                tracing::warn!("Batch {} failed: {}", self.batch_key, error);
                let error = OrmError::batch(self.batch_key.to_string(), error);
                for pending in batch {
                    let _ = pending.slot.send(Err(error.clone()));
                }
            }
        }
    }

    async fn fetch_groups(&self, uow: &UnitOfWork, keys: &[TaggedId]) -> OrmResult<HashMap<TaggedId, Vec<Entity>>> {
        match &self.kind {
            LoaderKind::PrimaryKey { metadata } => {
                let rows = self
                    .fetch_rows(uow, &metadata.table_name, &metadata.primary_key, &metadata.primary_key, keys)
                    .await?;
                let mut groups: HashMap<TaggedId, Vec<Entity>> = HashMap::new();
                for entity in uow.registry().hydrate_all(metadata, &rows, HydrateOptions::default())? {
                    groups.entry(entity.id().clone()).or_default().push(entity);
                }
                Ok(groups)
            }
            LoaderKind::OneToMany { relation, other } => {
                let rows = self
                    .fetch_rows(
                        uow,
                        &other.table_name,
                        relation.require_other_column()?,
                        &other.primary_key,
                        keys,
                    )
                    .await?;
                let requested: HashSet<&TaggedId> = keys.iter().collect();
                let mut groups: HashMap<TaggedId, Vec<Entity>> = HashMap::new();
                let mut unresolved = 0usize;

                for entity in uow.registry().hydrate_all(other, &rows, HydrateOptions::default())? {
                    // Group by the in-memory owner, which may differ from the row
                    match entity.reference(&relation.other_field_name)? {
                        Some(owner) if requested.contains(&owner) => {
                            groups.entry(owner).or_default().push(entity);
                        }
                        _ => unresolved += 1,
                    }
                }
                if unresolved > 0 {
                    tracing::debug!(
                        "{} rows in batch {} no longer belong to a requested owner",
                        unresolved,
                        self.batch_key
                    );
                }

                // Children moved to a requested owner in memory are not in the
                // rows, which still carry the stored foreign key
                let grouped: HashSet<TaggedId> =
                    groups.values().flatten().map(|entity| entity.id().clone()).collect();
                for entity in uow.registry().entities_of(&other.entity_name) {
                    if grouped.contains(entity.id()) {
                        continue;
                    }
                    if let Some(owner) = entity.reference(&relation.other_field_name)? {
                        if requested.contains(&owner) {
                            groups.entry(owner).or_default().push(entity);
                        }
                    }
                }
                Ok(groups)
            }
            LoaderKind::ManyToMany { owner, relation, other } => {
                let join_table = relation.require_join_table()?;
                let owner_column = relation.require_column()?;
                let other_column = relation.require_other_column()?;
                let links = self.fetch_rows(uow, join_table, owner_column, "id", keys).await?;

                let mut pairs = Vec::with_capacity(links.len());
                let mut targets = Vec::new();
                let mut seen = HashSet::new();
                for link in &links {
                    let owner_id = TaggedId::from_value(&owner.tag, &link.get_or_null(owner_column))?;
                    let target_id = TaggedId::from_value(&other.tag, &link.get_or_null(other_column))?;
                    if seen.insert(target_id.clone()) {
                        targets.push(target_id.clone());
                    }
                    pairs.push((owner_id, target_id));
                }

                let target_loader = uow.primary_key_loader(other)?;
                let loaded = join_all(targets.iter().map(|id| target_loader.load_boxed(uow, id.clone()))).await;
                let mut resolved: HashMap<TaggedId, Entity> = HashMap::new();
                for (id, entities) in targets.into_iter().zip(loaded) {
                    if let Some(entity) = entities?.into_iter().next() {
                        resolved.insert(id, entity);
                    }
                }

                let mut groups: HashMap<TaggedId, Vec<Entity>> = HashMap::new();
                for (owner_id, target_id) in pairs {
                    if let Some(entity) = resolved.get(&target_id) {
                        groups.entry(owner_id).or_default().push(entity.clone());
                    }
                }
                Ok(groups)
            }
        }
    }

    /// Run the IN-query for `keys`, split into chunks of `max_batch_size`
    async fn fetch_rows(
        &self,
        uow: &UnitOfWork,
        table: &str,
        column: &str,
        order_by: &str,
        keys: &[TaggedId],
    ) -> OrmResult<Vec<Row>> {
        let mut rows = Vec::new();
        for chunk in keys.chunks(self.max_batch_size) {
            let values = untag_all(&self.key_tag, self.key_kind, chunk)?;
            rows.extend(uow.run_query(table, column, &values, order_by).await?);
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for BatchedRelationLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedRelationLoader")
            .field("batch_key", &self.batch_key)
            .field("max_batch_size", &self.max_batch_size)
            .field("window", &self.window)
            .field("pending", &self.pending_len())
            .finish()
    }
}
