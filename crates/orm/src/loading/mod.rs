/// Relation loading for the ORM runtime
/// Provides the coalescing batch loader and the per-request loader cache

pub mod batch_loader;
pub mod loader_cache;

pub use batch_loader::{BatchedRelationLoader, LoaderKind};
pub use loader_cache::{BatchKey, LoaderCache};
