//! # Portal Mirror
//!
//! A resilient fetch-and-sync engine that mirrors a legacy web portal into a
//! versioned object store.
//!
//! Pages and documents are fetched through a retrying HTTP transport that
//! paces its calls, rotates egress proxies and repairs the portal's
//! inconsistent character encodings. Every fetched artifact is stored
//! gzip-compressed with a content hash; unchanged content is only touched,
//! changed content is backed up before it is overwritten, and artifacts that
//! vanish upstream are backed up and removed together with their children.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Proxy        │──▶│ Transport   │──▶│ Reconciler   │
//! │ Resolver     │   │ Retry+Enc.  │   │ Artifact     │
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                             │
//!                          ┌──────────────────┤
//!                          ▼                  ▼
//!                    ┌──────────┐       ┌──────────┐
//!                    │ primary  │       │  backup  │
//!                    │ bucket   │       │  bucket  │
//!                    └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pmirror init
//! pmirror fetch "https://portal.example/bi/vo020.asp?VOLFDNR=12" \
//!     --folder vorlagen/ --name vo12 --ending .html --expect text/html
//! pmirror ls vorlagen/
//! pmirror reconcile vorlagen/ --live live.txt --child-folder anlagen/
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed fetch and artifact errors |
//! | [`logging`] | Tracing subscriber setup |
//! | [`proxy`] | Egress proxy allocation |
//! | [`retry`] | Retry policy, pacing, cancellation |
//! | [`encoding`] | HTML charset normalization |
//! | [`transport`] | Retrying HTTP GET/POST |
//! | [`artifact`] | Versioned stored artifacts |
//! | [`reconcile`] | Freshness, write policy, orphan removal |
//! | [`ingest`] | One-resource sync and CLI commands |
//! | [`batch`] | Sequential range batching |
//! | [`sqlite_store`] | SQLite blob store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod artifact;
pub mod batch;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod ls;
pub mod migrate;
pub mod proxy;
pub mod reconcile;
pub mod retry;
pub mod sqlite_store;
pub mod transport;
