//! tessera-stores - Storage backend implementations for tessera.
//!
//! Every backend implements the same `Repository`/`Searcher` contracts from
//! tessera-core with identical versioning, soft-delete, and
//! timestamp-scoped-read semantics, each using its engine's native way of
//! selecting the latest version per id.
//!
//! # Supported Backends
//!
//! - **Memory** (feature: `memory`) - in-process chain store, the reference
//!   semantics for the behavioral suite
//! - **MongoDB** (feature: `mongo`) - aggregation-pipeline grouping
//! - **PostgreSQL** (feature: `postgres`) - `DISTINCT ON` windowing
//! - **MySQL** (feature: `mysql`) - `ROW_NUMBER()` windowing
//! - **SQLite** (feature: `sqlite`) - `ROW_NUMBER()` windowing

mod factory;
mod pool;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "mongo")]
mod mongo;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "mysql")]
mod mysql;

#[cfg(feature = "sqlite")]
mod sqlite;

// Public exports
pub use factory::{Backend, StoreFactory};
pub use pool::PoolRegistry;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "mongo")]
pub use mongo::{MongoRepository, MongoSearcher};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresRepository, PostgresSearcher};

#[cfg(feature = "mysql")]
pub use mysql::{MysqlRepository, MysqlSearcher};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteRepository, SqliteSearcher};

// Re-export core types for convenience
pub use tessera_core::{
    Auth, Envelope, NoopAuth, Payload, QueryTemplate, Repository, Searcher, StorageConfig,
    StorageProvider, TesseraError, TesseraResult,
};
