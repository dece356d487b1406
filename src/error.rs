//! Error types for the fetch engine and the reconciler.
//!
//! Transport failures are [`FetchError`]s; everything touching stored
//! artifacts is an [`ArtifactError`]. Blob store backends and the CLI use
//! `anyhow`, which [`ArtifactError::Store`] wraps together with the
//! operation and path that failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// The origin redirected to its login page. Never retried.
    #[error("authentication redirect from {url} (status {status})")]
    AuthRedirect { url: String, status: u16 },

    #[error("empty response body from {url}")]
    EmptyBody { url: String },

    #[error("failed to decode body from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("proxy allocation failed: {reason}")]
    Proxy { reason: String },

    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        #[source]
        source: reqwest::Error,
    },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Terminal errors end a retry chain immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchError::AuthRedirect { .. } | FetchError::Cancelled)
    }

    /// The error that ended the chain, unwrapping [`FetchError::Exhausted`].
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("cannot write {path}: content hash not set")]
    MissingHash { path: String },

    #[error("cannot write {path}: content type not set")]
    MissingContentType { path: String },

    #[error("cannot write {path}: empty content")]
    EmptyContent { path: String },

    #[error("unexpected content type from {url}: expected {expected}, got {actual}")]
    UnexpectedMime {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("invalid metadata on {path}: {reason}")]
    InvalidMetadata { path: String, reason: String },

    #[error("{op} {path} failed: {source:#}")]
    Store {
        op: &'static str,
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ArtifactError {
    pub(crate) fn store(op: &'static str, path: impl Into<String>, source: anyhow::Error) -> Self {
        ArtifactError::Store {
            op,
            path: path.into(),
            source,
        }
    }
}
