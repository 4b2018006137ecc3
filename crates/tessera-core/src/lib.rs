//! tessera-core - Core library for tessera.
//!
//! This crate provides the envelope data model, the `Repository` and
//! `Searcher` contracts shared by every storage backend, the query template
//! compiler, and the pluggable `Auth` capability.
//!
//! An envelope is one immutable version of a logical record. Updates append
//! a new version sharing the same `id`; reads are scoped to an instant and
//! return the version current at that instant.
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::{Envelope, QueryTemplate, Repository};
//!
//! let envelope = Envelope::new(serde_json::json!({"name": "red"}));
//! let created = repository.create(envelope, &[]).await?;
//!
//! let template = QueryTemplate::compile(r#"{"id": "{{id}}"}"#)?;
//! ```

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod template;
pub mod traits;

// Re-export commonly used types
pub use auth::{token_intersects, Auth, NoopAuth, RequestContext};
pub use config::{
    ResolverConfig, RootConfig, SingletonConfig, StorageConfig, StorageProvider, VectorConfig,
};
pub use envelope::{Envelope, Payload};
pub use error::{TesseraError, TesseraResult};
pub use template::QueryTemplate;
pub use traits::{Repository, Searcher};
