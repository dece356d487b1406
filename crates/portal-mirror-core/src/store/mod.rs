//! Blob storage abstraction for Portal Mirror.
//!
//! The [`BlobStore`] trait covers every object-store operation the
//! reconciler needs, enabling pluggable backends (SQLite, in-memory, cloud
//! buckets). One instance addresses one bucket; the engine holds a primary
//! store for fetched artifacts and a separate one for backups.
//!
//! Single-object operations are assumed atomic. Nothing spans objects: a
//! backup followed by a delete may stop half way, so callers keep every step
//! idempotent.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ObjectMeta, WriteAttrs};

/// Abstract bucket of versioned objects.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_attributes`](BlobStore::get_attributes) | Metadata of one object, `None` if absent |
/// | [`read`](BlobStore::read) | Stored bytes of one object |
/// | [`write`](BlobStore::write) | Create or replace an object |
/// | [`touch`](BlobStore::touch) | Refresh the update time without rewriting the body |
/// | [`delete`](BlobStore::delete) | Remove an object |
/// | [`list`](BlobStore::list) | Metadata of every object under a prefix |
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket name, used in log lines and error context.
    fn bucket(&self) -> &str;

    /// Metadata of the object at `path`, or `None` if it does not exist.
    async fn get_attributes(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Stored bytes of the object at `path`, exactly as written.
    ///
    /// Fails if the object does not exist.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace the object at `path`, returning its new metadata.
    async fn write(&self, path: &str, body: &[u8], attrs: WriteAttrs) -> Result<ObjectMeta>;

    /// Set the update time of an existing object to now.
    async fn touch(&self, path: &str) -> Result<ObjectMeta>;

    /// Remove the object at `path`. Fails if it does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Metadata of every object whose path starts with `prefix`, ordered by path.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}
