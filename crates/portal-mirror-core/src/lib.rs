//! # Portal Mirror Core
//!
//! Shared, runtime-free logic for Portal Mirror: artifact data models,
//! content fingerprints, object path rules, and the blob store abstraction.
//!
//! This crate contains no tokio, reqwest, sqlx, or filesystem I/O. The
//! engine crate layers HTTP fetching, retry, and reconciliation on top of
//! these types.

pub mod models;
pub mod path;
pub mod store;
