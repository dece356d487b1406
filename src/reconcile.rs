//! Store reconciliation.
//!
//! The [`Reconciler`] keeps the primary bucket in step with the portal:
//!
//! - [`fetch_if_stale`](Reconciler::fetch_if_stale) serves an artifact from
//!   the store while it is younger than `min_age_before_download` (or when
//!   no re-download was asked for), otherwise fetches it through the
//!   [`Transport`];
//! - [`write_if_changed`](Reconciler::write_if_changed) compares content
//!   hashes and either leaves the stored copy alone, touches it, creates
//!   it, or backs up the old version and overwrites it;
//! - [`reconcile_missing`](Reconciler::reconcile_missing) backs up and
//!   deletes stored artifacts that disappeared upstream, cascading to their
//!   children in dependent folders.
//!
//! Orphan removal is best effort: a failing item is recorded in the
//! [`ReconcileReport`] and processing carries on with the rest.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use portal_mirror_core::models::FetchRequest;
use portal_mirror_core::store::BlobStore;

use crate::artifact::Artifact;
use crate::error::ArtifactError;
use crate::transport::Transport;

// ============ Clock ============

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.now.lock() {
            *current += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ============ Outcomes ============

/// What [`Reconciler::write_if_changed`] did to the primary bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The previous version was copied to `backup_path` first.
    Updated { backup_path: String },
    /// Same content, update time refreshed.
    Touched,
    /// Same content, nothing written.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Removed { backup_path: String },
    Failed { error: String },
}

/// Result of removing one orphan or one of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub path: String,
    pub status: ItemStatus,
    /// Children removed along with a parent; always empty for children.
    pub children: Vec<ItemOutcome>,
}

impl ItemOutcome {
    fn removed(path: String, backup_path: String) -> Self {
        Self {
            path,
            status: ItemStatus::Removed { backup_path },
            children: Vec::new(),
        }
    }

    fn failed(path: String, error: impl ToString) -> Self {
        Self {
            path,
            status: ItemStatus::Failed {
                error: error.to_string(),
            },
            children: Vec::new(),
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self.status, ItemStatus::Removed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Objects listed under the prefix.
    pub scanned: usize,
    /// Objects still present upstream.
    pub kept: usize,
    /// Objects whose source time is not after the cut-off.
    pub skipped: usize,
    /// One entry per orphan, children nested.
    pub items: Vec<ItemOutcome>,
}

impl ReconcileReport {
    /// Every outcome, parents followed by their children.
    pub fn outcomes(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items
            .iter()
            .flat_map(|item| std::iter::once(item).chain(item.children.iter()))
    }

    pub fn removed_paths(&self) -> Vec<&str> {
        self.outcomes()
            .filter(|o| o.is_removed())
            .map(|o| o.path.as_str())
            .collect()
    }

    pub fn failures(&self) -> Vec<&ItemOutcome> {
        self.outcomes().filter(|o| !o.is_removed()).collect()
    }
}

// ============ Reconciler ============

pub struct Reconciler {
    primary: Arc<dyn BlobStore>,
    backup: Arc<dyn BlobStore>,
    transport: Transport,
    min_age: Duration,
    content_language: String,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        primary: Arc<dyn BlobStore>,
        backup: Arc<dyn BlobStore>,
        transport: Transport,
        min_age: Duration,
    ) -> Self {
        Self {
            primary,
            backup,
            transport,
            min_age,
            content_language: "de".to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_content_language(mut self, language: impl Into<String>) -> Self {
        self.content_language = language.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn primary(&self) -> &dyn BlobStore {
        self.primary.as_ref()
    }

    pub fn backup(&self) -> &dyn BlobStore {
        self.backup.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Serve `artifact` from the store or fetch it anew.
    ///
    /// Returns `true` if the body was fetched from the portal, `false` if it
    /// came from the store.
    pub async fn fetch_if_stale(
        &mut self,
        artifact: &mut Artifact,
        request: &FetchRequest,
        force: bool,
    ) -> Result<bool, ArtifactError> {
        artifact.load_metadata(self.primary.as_ref()).await?;
        artifact.recorded = false;

        let now = self.clock.now();
        // An update time too close to the end of the calendar never ages out.
        let too_new = artifact.updated_at.is_some_and(|updated| {
            updated
                .checked_add_signed(self.min_age)
                .map_or(true, |until| now < until)
        });
        let use_stored = !force && artifact.exists_in_store && (!request.redownload || too_new);

        if use_stored {
            tracing::debug!(path = %artifact.path(), too_new, "Reading from store");
            artifact.read_body(self.primary.as_ref()).await?;
            artifact.adopt_stored();
            artifact.loaded_from_cache = true;
            return Ok(false);
        }

        tracing::info!(
            method = %request.method,
            path = %artifact.path(),
            url = %request.url,
            "Fetching"
        );
        let download = self.transport.fetch(request).await?;
        if !request.accepts(&download.content_type) {
            return Err(ArtifactError::UnexpectedMime {
                url: request.url.clone(),
                expected: request.expected_mime.clone(),
                actual: download.content_type,
            });
        }

        artifact.content_type = Some(download.content_type);
        artifact.body = download.body;
        artifact.content_hash = None;
        artifact.fetched_at = Some(now);
        artifact.loaded_from_cache = false;
        if artifact.source_time.is_none() {
            artifact.source_time = Some(request.created);
        }
        Ok(true)
    }

    /// Persist `artifact` under `new_hash` unless the store already holds it.
    pub async fn write_if_changed(
        &self,
        artifact: &mut Artifact,
        new_hash: &str,
    ) -> Result<WriteOutcome, ArtifactError> {
        artifact.load_metadata(self.primary.as_ref()).await?;
        artifact.content_hash = Some(new_hash.to_string());
        let path = artifact.path();

        if artifact.exists_in_store && artifact.stored_hash() == Some(new_hash) {
            tracing::debug!(path = %path, hash = new_hash, "Same hash");
            if artifact.loaded_from_cache || artifact.recorded {
                return Ok(WriteOutcome::Unchanged);
            }
            artifact.touch(self.primary.as_ref()).await?;
            return Ok(WriteOutcome::Touched);
        }

        artifact.ensure_writable()?;
        let now = self.clock.now();

        if artifact.exists_in_store {
            tracing::debug!(
                path = %path,
                old = artifact.stored_hash().unwrap_or(""),
                new = new_hash,
                "Hash changed"
            );
            let backup_path = artifact
                .backup(self.primary.as_ref(), self.backup.as_ref(), false)
                .await?;
            artifact
                .write(self.primary.as_ref(), &self.content_language, now)
                .await?;
            return Ok(WriteOutcome::Updated { backup_path });
        }

        artifact
            .write(self.primary.as_ref(), &self.content_language, now)
            .await?;
        Ok(WriteOutcome::Created)
    }

    /// Every stored artifact under `prefix`.
    pub async fn list_artifacts(&self, prefix: &str) -> Result<Vec<Artifact>, ArtifactError> {
        list_artifacts(self.primary.as_ref(), prefix).await
    }

    /// Back up and delete every artifact under `prefix` whose source time is
    /// after `min_time` and whose path is not in `live`, together with the
    /// artifacts in `child_folders` whose names start with its stem.
    ///
    /// Only a failing listing of `prefix` is an error; everything else ends
    /// up in the report.
    pub async fn reconcile_missing(
        &self,
        prefix: &str,
        live: &HashSet<String>,
        child_folders: &[String],
        min_time: DateTime<Utc>,
    ) -> Result<ReconcileReport, ArtifactError> {
        let listed = self
            .primary
            .list(prefix)
            .await
            .map_err(|e| ArtifactError::store("list", prefix, e))?;

        let mut report = ReconcileReport {
            scanned: listed.len(),
            ..Default::default()
        };
        let mut orphans = Vec::new();
        for meta in listed {
            if !meta.custom_time.is_some_and(|t| t > min_time) {
                report.skipped += 1;
            } else if live.contains(&meta.path) {
                report.kept += 1;
            } else {
                tracing::info!(path = %meta.path, "No longer upstream, removing");
                orphans.push(meta);
            }
        }

        for meta in orphans {
            let path = meta.path.clone();
            let mut artifact = match Artifact::from_meta(meta) {
                Ok(artifact) => artifact,
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Cannot remove orphan");
                    report.items.push(ItemOutcome::failed(path, e));
                    continue;
                }
            };

            let mut outcome = match self.remove(&mut artifact).await {
                Ok(backup_path) => ItemOutcome::removed(path, backup_path),
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Failed to remove orphan");
                    report.items.push(ItemOutcome::failed(path, e));
                    continue;
                }
            };

            for folder in child_folders {
                let child_prefix = format!("{}{}", folder, artifact.stem());
                outcome.children.extend(self.remove_children(&child_prefix).await);
            }
            report.items.push(outcome);
        }

        Ok(report)
    }

    async fn remove(&self, artifact: &mut Artifact) -> Result<String, ArtifactError> {
        artifact
            .backup(self.primary.as_ref(), self.backup.as_ref(), true)
            .await
    }

    async fn remove_children(&self, child_prefix: &str) -> Vec<ItemOutcome> {
        let children = match self.list_artifacts(child_prefix).await {
            Ok(children) => children,
            Err(e) => {
                tracing::error!(prefix = %child_prefix, error = %e, "Failed to list children");
                return vec![ItemOutcome::failed(child_prefix.to_string(), e)];
            }
        };

        let mut outcomes = Vec::with_capacity(children.len());
        for mut child in children {
            let path = child.path();
            tracing::info!(path = %path, "Removing child of orphan");
            match self.remove(&mut child).await {
                Ok(backup_path) => outcomes.push(ItemOutcome::removed(path, backup_path)),
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Failed to remove child");
                    outcomes.push(ItemOutcome::failed(path, e));
                }
            }
        }
        outcomes
    }
}

/// Every stored artifact under `prefix`, metadata loaded.
pub async fn list_artifacts(
    store: &dyn BlobStore,
    prefix: &str,
) -> Result<Vec<Artifact>, ArtifactError> {
    store
        .list(prefix)
        .await
        .map_err(|e| ArtifactError::store("list", prefix, e))?
        .into_iter()
        .map(Artifact::from_meta)
        .collect()
}
