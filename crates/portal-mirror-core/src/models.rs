//! Core data models shared by the fetch engine and the blob stores.
//!
//! These types describe what is requested from the remote portal
//! ([`FetchRequest`]), what one transport call returned ([`Download`]),
//! and what a blob store knows about a stored object ([`ObjectMeta`],
//! [`WriteAttrs`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::path::sanitize_name;

/// Metadata key carrying the content fingerprint of a stored object.
pub const META_HASH: &str = "hash";
/// Metadata key carrying the RFC 3339 moment the bytes were fetched.
pub const META_FETCHED_AT: &str = "fetchedAt";
/// Metadata key recording whether the last write created or updated the object.
pub const META_CHANGED_BY: &str = "changedBy";

/// Expected-MIME wildcard: accept any content type.
pub const ANY_MIME: &str = "*";

/// Content encoding of every body written by the engine.
pub const GZIP_ENCODING: &str = "gzip";

/// HTTP method used to fetch a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who last changed a stored object, recorded in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedBy {
    Create,
    Update,
}

impl ChangedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangedBy::Create => "Create",
            ChangedBy::Update => "Update",
        }
    }
}

/// Attributes of one stored object, as reported by a blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Full object path (`folder + name`), unique within a bucket.
    pub path: String,
    pub content_type: String,
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub content_language: Option<String>,
    /// Creation time of the source resource this object was fetched from.
    #[serde(default)]
    pub custom_time: Option<DateTime<Utc>>,
    /// Last write or touch performed by the store.
    pub updated: DateTime<Utc>,
    /// Stored (possibly compressed) size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Content fingerprint recorded at write time, if any.
    pub fn hash(&self) -> Option<&str> {
        self.metadata
            .get(META_HASH)
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Raw `fetchedAt` metadata value.
    pub fn fetched_at_raw(&self) -> Option<&str> {
        self.metadata.get(META_FETCHED_AT).map(String::as_str)
    }

    /// Parsed `fetchedAt` metadata value. `None` if absent or not RFC 3339.
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at_raw()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn is_gzip(&self) -> bool {
        self.content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case(GZIP_ENCODING))
    }
}

/// Attributes supplied together with an object body on write.
///
/// The store stamps `updated` and `size` itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAttrs {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub custom_time: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// A remote resource the engine should mirror.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Target folder in the store (logical path prefix, usually ending in `/`).
    pub folder: String,
    /// Sanitized base name without the ending.
    pub name: String,
    /// File ending appended to `name`, e.g. `.html`.
    pub ending: String,
    /// Creation time of the resource on the portal.
    pub created: DateTime<Utc>,
    pub method: HttpMethod,
    /// Form fields sent URL-encoded with a POST.
    pub form: Vec<(String, String)>,
    /// Expected MIME-type prefix of the response, [`ANY_MIME`] for any.
    pub expected_mime: String,
    /// Ignore cached freshness for this artifact.
    pub redownload: bool,
    /// Propagate re-fetch intent to dependent artifacts.
    pub redownload_children: bool,
}

impl FetchRequest {
    /// A GET request for `url`, stored as `folder + sanitize(name) + ending`.
    pub fn new(
        folder: impl Into<String>,
        name: &str,
        ending: impl Into<String>,
        created: DateTime<Utc>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            folder: folder.into(),
            name: sanitize_name(name),
            ending: ending.into(),
            created,
            method: HttpMethod::Get,
            form: Vec::new(),
            expected_mime: ANY_MIME.to_string(),
            redownload: false,
            redownload_children: false,
        }
    }

    /// Switch to a form-encoded POST carrying `form`.
    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.method = HttpMethod::Post;
        self.form = form;
        self
    }

    pub fn expecting(mut self, mime_prefix: impl Into<String>) -> Self {
        self.expected_mime = mime_prefix.into();
        self
    }

    pub fn with_redownload(mut self, redownload: bool, children: bool) -> Self {
        self.redownload = redownload;
        self.redownload_children = children;
        self
    }

    /// Object name in the store: `name + ending`.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.ending)
    }

    /// Whether a response content type satisfies [`expected_mime`](Self::expected_mime).
    pub fn accepts(&self, content_type: &str) -> bool {
        self.expected_mime == ANY_MIME || content_type.starts_with(&self.expected_mime)
    }
}

/// Result of one successful transport call. Consumed immediately.
#[derive(Debug, Clone)]
pub struct Download {
    /// Base name of the final request URL (after redirects).
    pub name: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub status: u16,
}

/// Content fingerprint: hex-encoded SHA-256 of the body.
pub fn fingerprint(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let h = fingerprint(b"hello world");
        assert_eq!(
            h,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(fingerprint(b"hello world"), h);
        assert_ne!(fingerprint(b"hello world!"), h);
    }

    #[test]
    fn request_defaults_to_get_any_mime() {
        let req = FetchRequest::new("vorlagen/", "VO 12/3", ".html", Utc::now(), "http://x/vo");
        assert_eq!(req.method, HttpMethod::Get);
        assert!(req.accepts("application/pdf"));
        assert_eq!(req.file_name(), "VO-123.html");
    }

    #[test]
    fn request_with_form_is_post() {
        let req = FetchRequest::new("s/", "a", ".html", Utc::now(), "http://x")
            .with_form(vec![("SILFDNR".into(), "1 2".into()), ("x".into(), "ä&".into())]);
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.form.len(), 2);
    }

    #[test]
    fn accepts_checks_prefix() {
        let req = FetchRequest::new("s/", "a", ".pdf", Utc::now(), "http://x")
            .expecting("application/pdf");
        assert!(req.accepts("application/pdf"));
        assert!(!req.accepts("text/html;charset=utf-8"));
    }

    #[test]
    fn object_meta_reads_hash_and_fetched_at() {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_HASH.to_string(), "abc".to_string());
        metadata.insert(
            META_FETCHED_AT.to_string(),
            "2024-03-01T10:00:00Z".to_string(),
        );
        let meta = ObjectMeta {
            path: "a/b.html".into(),
            content_type: "text/html".into(),
            content_encoding: Some("GZIP".into()),
            content_language: None,
            custom_time: None,
            updated: Utc::now(),
            size: 0,
            metadata,
        };
        assert_eq!(meta.hash(), Some("abc"));
        assert_eq!(
            meta.fetched_at().map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
        assert!(meta.is_gzip());
    }

    #[test]
    fn object_meta_rejects_bad_fetched_at() {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_FETCHED_AT.to_string(), "yesterday".to_string());
        let meta = ObjectMeta {
            path: "x".into(),
            content_type: "text/plain".into(),
            content_encoding: None,
            content_language: None,
            custom_time: None,
            updated: Utc::now(),
            size: 0,
            metadata,
        };
        assert!(meta.fetched_at().is_none());
        assert!(meta.hash().is_none());
    }
}
