//! Loader Cache - one batched loader per relation per unit of work
//!
//! Two call sites asking for the same relation get the same loader and so
//! share its coalescing window.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::batch_loader::BatchedRelationLoader;
use crate::error::OrmResult;

/// Cache key for loaders: owner table plus relation field
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BatchKey {
    pub owner_table: String,
    pub relation_field: String,
}

impl BatchKey {
    pub fn new(owner_table: &str, relation_field: &str) -> Self {
        Self {
            owner_table: owner_table.to_string(),
            relation_field: relation_field.to_string(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner_table, self.relation_field)
    }
}

/// Memoizes loaders by their rendered batch key
#[derive(Default)]
pub struct LoaderCache {
    loaders: DashMap<String, Arc<BatchedRelationLoader>>,
}

impl LoaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached loader for `key`, building it with `make` on first use
    pub fn get_or_create<F>(&self, key: &BatchKey, make: F) -> OrmResult<Arc<BatchedRelationLoader>>
    where
        F: FnOnce() -> OrmResult<BatchedRelationLoader>,
    {
        match self.loaders.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                tracing::trace!("Creating loader for {}", entry.key());
                let loader = Arc::new(make()?);
                entry.insert(Arc::clone(&loader));
                Ok(loader)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Rendered keys of every cached loader, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.loaders.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for LoaderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderCache").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::metadata::MetadataProvider;
    use crate::tests::fixtures::metadata;

    #[test]
    fn test_key_rendering() {
        assert_eq!(BatchKey::new("authors", "books").to_string(), "authors.books");
    }

    #[test]
    fn test_same_key_shares_loader() {
        let provider = metadata();
        let author = provider.metadata("Author").unwrap();
        let cache = LoaderCache::new();
        let key = BatchKey::new("authors", "books");

        let first = cache
            .get_or_create(&key, || {
                BatchedRelationLoader::for_relation(provider.as_ref(), &author, "books", &BatchConfig::default())
            })
            .unwrap();
        let second = cache
            .get_or_create(&key, || panic!("loader should be cached"))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys(), vec!["authors.books".to_string()]);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let cache = LoaderCache::new();
        let key = BatchKey::new("authors", "nope");
        let result = cache.get_or_create(&key, || {
            Err(crate::error::OrmError::Metadata("no such relation".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
