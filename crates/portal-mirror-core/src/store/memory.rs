//! In-memory [`BlobStore`] implementation for testing.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`, so listings come back
//! ordered by path. Besides the trait operations it counts writes and
//! touches per path, can be told to fail deletes for chosen paths, and can
//! record every mutation into a journal shared between several stores.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ObjectMeta, WriteAttrs};

use super::BlobStore;

/// Ordered log of mutations (`"<bucket>:<op>:<path>"`) shared by stores.
pub type Journal = Arc<Mutex<Vec<String>>>;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct StoredObject {
    meta: ObjectMeta,
    body: Vec<u8>,
}

/// In-memory bucket for tests.
pub struct InMemoryBlobStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    writes: RwLock<HashMap<String, usize>>,
    touches: RwLock<HashMap<String, usize>>,
    failing_deletes: RwLock<HashSet<String>>,
    journal: Option<Journal>,
    clock: Clock,
}

impl InMemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            writes: RwLock::new(HashMap::new()),
            touches: RwLock::new(HashMap::new()),
            failing_deletes: RwLock::new(HashSet::new()),
            journal: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Record every mutation into `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Stamp `updated` from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Make every later `delete(path)` fail.
    pub fn fail_delete(&self, path: &str) {
        self.failing_deletes
            .write()
            .unwrap()
            .insert(path.to_string());
    }

    /// Number of `write` calls that targeted `path`.
    pub fn write_count(&self, path: &str) -> usize {
        self.writes.read().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Number of `touch` calls that targeted `path`.
    pub fn touch_count(&self, path: &str) -> usize {
        self.touches.read().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Paths of all stored objects, ordered.
    pub fn paths(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().unwrap().contains_key(path)
    }

    /// Insert an object directly, bypassing counters and journal.
    pub fn seed(&self, meta: ObjectMeta, body: Vec<u8>) {
        self.objects
            .write()
            .unwrap()
            .insert(meta.path.clone(), StoredObject { meta, body });
    }

    fn record(&self, op: &str, path: &str) {
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.bucket, op, path));
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get_attributes(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(path).map(|o| o.meta.clone()))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let objects = self.objects.read().unwrap();
        objects
            .get(path)
            .map(|o| o.body.clone())
            .ok_or_else(|| anyhow!("object not found: {}/{}", self.bucket, path))
    }

    async fn write(&self, path: &str, body: &[u8], attrs: WriteAttrs) -> Result<ObjectMeta> {
        let meta = ObjectMeta {
            path: path.to_string(),
            content_type: attrs.content_type,
            content_encoding: attrs.content_encoding,
            content_language: attrs.content_language,
            custom_time: attrs.custom_time,
            updated: (self.clock)(),
            size: body.len() as u64,
            metadata: attrs.metadata,
        };
        self.objects.write().unwrap().insert(
            path.to_string(),
            StoredObject {
                meta: meta.clone(),
                body: body.to_vec(),
            },
        );
        *self
            .writes
            .write()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;
        self.record("write", path);
        Ok(meta)
    }

    async fn touch(&self, path: &str) -> Result<ObjectMeta> {
        let now = (self.clock)();
        let meta = {
            let mut objects = self.objects.write().unwrap();
            let stored = objects
                .get_mut(path)
                .ok_or_else(|| anyhow!("object not found: {}/{}", self.bucket, path))?;
            stored.meta.updated = now;
            stored.meta.clone()
        };
        *self
            .touches
            .write()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;
        self.record("touch", path);
        Ok(meta)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.failing_deletes.read().unwrap().contains(path) {
            bail!("injected delete failure: {}/{}", self.bucket, path);
        }
        if self.objects.write().unwrap().remove(path).is_none() {
            bail!("object not found: {}/{}", self.bucket, path);
        }
        self.record("delete", path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().unwrap();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(_, o)| o.meta.clone())
            .collect())
    }
}
