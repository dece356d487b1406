//! Versioned artifacts.
//!
//! An [`Artifact`] is one logical document or page, addressed by
//! `folder + name` in the primary bucket. Its stored metadata is loaded
//! lazily and at most once; fields already set on the working copy (a
//! freshly fetched content type, the source time from the request) are
//! never overwritten by that load.
//!
//! Bodies are written gzip-compressed. A backup copies the stored object
//! byte for byte, attributes included, to the backup bucket under a name
//! embedding the superseded version's update time, so repeating a backup
//! after a partial failure rewrites the same object.

use std::io::{Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use portal_mirror_core::models::{
    ChangedBy, FetchRequest, ObjectMeta, WriteAttrs, GZIP_ENCODING, META_CHANGED_BY,
    META_FETCHED_AT, META_HASH,
};
use portal_mirror_core::path;
use portal_mirror_core::store::BlobStore;

use crate::error::ArtifactError;

#[derive(Debug, Clone, Default)]
pub struct Artifact {
    pub folder: String,
    pub name: String,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    /// Last write or touch in the primary bucket.
    pub updated_at: Option<DateTime<Utc>>,
    /// Creation time of the source resource; stored as the object's custom time.
    pub source_time: Option<DateTime<Utc>>,
    /// When the current bytes were obtained from the portal.
    pub fetched_at: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
    pub exists_in_store: bool,
    pub metadata_loaded: bool,
    pub loaded_from_cache: bool,
    /// Set once this cycle's state has been persisted by a write or touch.
    pub(crate) recorded: bool,
    stored: Option<ObjectMeta>,
}

impl Artifact {
    pub fn new(folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Working artifact for a request: `folder + name + ending`, source time
    /// taken from the request.
    pub fn from_request(request: &FetchRequest) -> Self {
        Self {
            source_time: Some(request.created),
            ..Self::new(request.folder.clone(), request.file_name())
        }
    }

    /// Artifact for a listed object, with its metadata already loaded.
    ///
    /// Fails with [`ArtifactError::InvalidMetadata`] if the object carries no
    /// RFC 3339 `fetchedAt`.
    pub fn from_meta(meta: ObjectMeta) -> Result<Self, ArtifactError> {
        let fetched_at = meta.fetched_at().ok_or_else(|| ArtifactError::InvalidMetadata {
            path: meta.path.clone(),
            reason: format!(
                "{} is missing or not RFC 3339: {:?}",
                META_FETCHED_AT,
                meta.fetched_at_raw()
            ),
        })?;
        let (folder, name) = path::split(&meta.path);
        Ok(Self {
            folder: folder.to_string(),
            name: name.to_string(),
            content_type: Some(meta.content_type.clone()),
            content_hash: meta.hash().map(str::to_string),
            updated_at: Some(meta.updated),
            source_time: meta.custom_time,
            fetched_at: Some(fetched_at),
            exists_in_store: true,
            metadata_loaded: true,
            stored: Some(meta),
            ..Default::default()
        })
    }

    pub fn path(&self) -> String {
        path::join(&self.folder, &self.name)
    }

    pub fn stem(&self) -> &str {
        path::stem(&self.name)
    }

    pub fn extension(&self) -> &str {
        path::extension(&self.name)
    }

    /// Metadata of the stored version, once loaded.
    pub fn stored(&self) -> Option<&ObjectMeta> {
        self.stored.as_ref()
    }

    /// Hash of the stored version, as opposed to the working [`content_hash`](Self::content_hash).
    pub fn stored_hash(&self) -> Option<&str> {
        self.stored.as_ref().and_then(ObjectMeta::hash)
    }

    /// Path of the backup copy of the stored version.
    pub fn backup_path(&self) -> Option<String> {
        self.stored
            .as_ref()
            .map(|meta| path::join(&self.folder, &path::backup_name(&self.name, meta.updated)))
    }

    /// Load stored metadata. Only the first call queries the store.
    pub async fn load_metadata(&mut self, store: &dyn BlobStore) -> Result<(), ArtifactError> {
        if self.metadata_loaded {
            return Ok(());
        }
        let path = self.path();
        let meta = store
            .get_attributes(&path)
            .await
            .map_err(|e| ArtifactError::store("get attributes of", &path, e))?;
        self.metadata_loaded = true;

        let Some(meta) = meta else {
            return Ok(());
        };
        if meta.fetched_at().is_none() {
            tracing::warn!(path = %path, "Stored object has no valid fetchedAt");
        }

        self.exists_in_store = true;
        self.updated_at = Some(meta.updated);
        if self.content_type.is_none() {
            self.content_type = Some(meta.content_type.clone());
        }
        if self.content_hash.is_none() {
            self.content_hash = meta.hash().map(str::to_string);
        }
        if self.source_time.is_none() {
            self.source_time = meta.custom_time;
        }
        if self.fetched_at.is_none() {
            self.fetched_at = meta.fetched_at();
        }
        self.stored = Some(meta);
        Ok(())
    }

    /// Replace every working field with the stored version's.
    pub(crate) fn adopt_stored(&mut self) {
        if let Some(meta) = &self.stored {
            self.content_type = Some(meta.content_type.clone());
            self.content_hash = meta.hash().map(str::to_string);
            self.updated_at = Some(meta.updated);
            self.source_time = meta.custom_time;
            self.fetched_at = meta.fetched_at();
            self.exists_in_store = true;
        }
    }

    /// Load the stored body, decompressing it if needed.
    pub async fn read_body(&mut self, store: &dyn BlobStore) -> Result<(), ArtifactError> {
        let path = self.path();
        let raw = store
            .read(&path)
            .await
            .map_err(|e| ArtifactError::store("read", &path, e))?;
        let gzipped = match &self.stored {
            Some(meta) => meta.is_gzip(),
            None => false,
        };
        self.body = if gzipped {
            gunzip(&raw).map_err(|e| ArtifactError::store("decompress", &path, e.into()))?
        } else {
            raw
        };
        Ok(())
    }

    /// Fail unless the artifact may be written.
    pub fn ensure_writable(&self) -> Result<(), ArtifactError> {
        let path = self.path();
        if self.content_hash.as_deref().map_or(true, str::is_empty) {
            return Err(ArtifactError::MissingHash { path });
        }
        if self.content_type.as_deref().map_or(true, str::is_empty) {
            return Err(ArtifactError::MissingContentType { path });
        }
        if self.body.is_empty() {
            return Err(ArtifactError::EmptyContent { path });
        }
        Ok(())
    }

    /// Write the working body compressed, with hash, fetch time and source
    /// time as object attributes.
    ///
    /// `now` stands in for a missing fetch time.
    pub async fn write(
        &mut self,
        store: &dyn BlobStore,
        content_language: &str,
        now: DateTime<Utc>,
    ) -> Result<ObjectMeta, ArtifactError> {
        self.ensure_writable()?;
        let path = self.path();

        let changed_by = if self.exists_in_store {
            ChangedBy::Update
        } else {
            ChangedBy::Create
        };
        let fetched_at = *self.fetched_at.get_or_insert(now);

        let mut attrs = WriteAttrs {
            content_type: self.content_type.clone().unwrap_or_default(),
            content_encoding: Some(GZIP_ENCODING.to_string()),
            content_language: Some(content_language.to_string()),
            custom_time: self.source_time,
            ..Default::default()
        };
        attrs.metadata.insert(
            META_HASH.to_string(),
            self.content_hash.clone().unwrap_or_default(),
        );
        attrs.metadata.insert(
            META_FETCHED_AT.to_string(),
            fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        attrs
            .metadata
            .insert(META_CHANGED_BY.to_string(), changed_by.as_str().to_string());

        let compressed =
            gzip(&self.body).map_err(|e| ArtifactError::store("compress", &path, e.into()))?;
        let meta = store
            .write(&path, &compressed, attrs)
            .await
            .map_err(|e| ArtifactError::store("write", &path, e))?;

        tracing::info!(path = %path, changed_by = changed_by.as_str(), "Wrote artifact");
        self.remember(meta.clone());
        Ok(meta)
    }

    /// Refresh the stored update time without rewriting the body.
    pub async fn touch(&mut self, store: &dyn BlobStore) -> Result<ObjectMeta, ArtifactError> {
        let path = self.path();
        let meta = store
            .touch(&path)
            .await
            .map_err(|e| ArtifactError::store("touch", &path, e))?;
        tracing::info!(path = %path, "Touched artifact");
        self.remember(meta.clone());
        Ok(meta)
    }

    /// Copy the stored version to the backup bucket and optionally delete
    /// it from the primary one. Returns the backup path.
    pub async fn backup(
        &mut self,
        primary: &dyn BlobStore,
        backup: &dyn BlobStore,
        delete_original: bool,
    ) -> Result<String, ArtifactError> {
        let path = self.path();
        self.load_metadata(primary).await?;
        let (meta, backup_path) = match (&self.stored, self.backup_path()) {
            (Some(meta), Some(backup_path)) => (meta.clone(), backup_path),
            _ => {
                return Err(ArtifactError::store(
                    "back up",
                    &path,
                    anyhow::anyhow!("object does not exist in {}", primary.bucket()),
                ))
            }
        };

        let stored_bytes = primary
            .read(&path)
            .await
            .map_err(|e| ArtifactError::store("read", &path, e))?;
        let attrs = WriteAttrs {
            content_type: meta.content_type.clone(),
            content_encoding: meta.content_encoding.clone(),
            content_language: meta.content_language.clone(),
            custom_time: meta.custom_time,
            metadata: meta.metadata.clone(),
        };
        backup
            .write(&backup_path, &stored_bytes, attrs)
            .await
            .map_err(|e| ArtifactError::store("write backup", &backup_path, e))?;
        tracing::info!(path = %path, backup = %backup_path, "Backed up artifact");

        if delete_original {
            primary
                .delete(&path)
                .await
                .map_err(|e| ArtifactError::store("delete", &path, e))?;
            tracing::info!(path = %path, "Deleted artifact");
            self.exists_in_store = false;
            self.stored = None;
        }
        Ok(backup_path)
    }

    fn remember(&mut self, meta: ObjectMeta) {
        self.exists_in_store = true;
        self.metadata_loaded = true;
        self.recorded = true;
        self.updated_at = Some(meta.updated);
        self.stored = Some(meta);
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
