//! Factory for building backends from storage descriptors.

use std::sync::Arc;

use tessera_core::{
    Auth, Repository, Searcher, StorageConfig, StorageProvider, TesseraError, TesseraResult,
};

use crate::pool::PoolRegistry;

#[cfg(feature = "memory")]
use crate::memory::MemoryStore;

#[cfg(feature = "mongo")]
use crate::mongo::{MongoRepository, MongoSearcher};

#[cfg(feature = "postgres")]
use crate::postgres::{PostgresRepository, PostgresSearcher};

#[cfg(feature = "mysql")]
use crate::mysql::{MysqlRepository, MysqlSearcher};

#[cfg(feature = "sqlite")]
use crate::sqlite::{SqliteRepository, SqliteSearcher};

/// A repository/searcher pair built over the same underlying store.
#[derive(Clone)]
pub struct Backend {
    pub repository: Arc<dyn Repository>,
    pub searcher: Arc<dyn Searcher>,
}

/// Builds backends from `StorageConfig` descriptors, sharing connection
/// pools through its own [`PoolRegistry`].
#[derive(Default)]
pub struct StoreFactory {
    pools: PoolRegistry,
}

impl StoreFactory {
    /// Create a factory with an empty pool registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the backend a descriptor asks for, initializing schema or
    /// indexes on first contact.
    pub async fn create(
        &self,
        config: &StorageConfig,
        authorizer: Arc<dyn Auth>,
    ) -> TesseraResult<Backend> {
        match config.provider {
            #[cfg(feature = "memory")]
            StorageProvider::Memory => {
                let store = MemoryStore::new_shared(authorizer);
                Ok(Backend {
                    repository: store.clone(),
                    searcher: store,
                })
            }

            #[cfg(feature = "mongo")]
            StorageProvider::Mongo => {
                let uri = require_uri(config)?;
                let client = self.pools.mongo(uri).await?;
                let database = config
                    .config
                    .get("db")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tessera");
                let repository =
                    MongoRepository::new(&client, database, &config.collection);
                repository.initialize().await?;
                let searcher =
                    MongoSearcher::new(&client, database, &config.collection, authorizer);
                Ok(Backend {
                    repository: Arc::new(repository),
                    searcher: Arc::new(searcher),
                })
            }

            #[cfg(feature = "postgres")]
            StorageProvider::Postgres => {
                let pool = self.pools.postgres(require_uri(config)?).await?;
                let repository = PostgresRepository::new(pool.clone(), &config.collection);
                repository.initialize().await?;
                let searcher = PostgresSearcher::new(pool, &config.collection, authorizer);
                Ok(Backend {
                    repository: Arc::new(repository),
                    searcher: Arc::new(searcher),
                })
            }

            #[cfg(feature = "mysql")]
            StorageProvider::Mysql => {
                let pool = self.pools.mysql(require_uri(config)?).await?;
                let repository = MysqlRepository::new(pool.clone(), &config.collection);
                repository.initialize().await?;
                let searcher = MysqlSearcher::new(pool, &config.collection, authorizer);
                Ok(Backend {
                    repository: Arc::new(repository),
                    searcher: Arc::new(searcher),
                })
            }

            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => {
                let pool = self.pools.sqlite(require_uri(config)?).await?;
                let repository = SqliteRepository::new(pool.clone(), &config.collection);
                repository.initialize().await?;
                let searcher = SqliteSearcher::new(pool, &config.collection, authorizer);
                Ok(Backend {
                    repository: Arc::new(repository),
                    searcher: Arc::new(searcher),
                })
            }

            #[allow(unreachable_patterns)]
            provider => Err(TesseraError::UnsupportedProvider {
                provider: format!("{provider:?}"),
            }),
        }
    }

    /// Release every pooled connection.
    pub async fn close(&self) -> TesseraResult<()> {
        self.pools.close().await
    }
}

#[cfg(any(
    feature = "mongo",
    feature = "postgres",
    feature = "mysql",
    feature = "sqlite"
))]
fn require_uri(config: &StorageConfig) -> TesseraResult<&str> {
    config.uri.as_deref().ok_or_else(|| {
        TesseraError::Configuration(format!(
            "provider {:?} requires a connection uri",
            config.provider
        ))
    })
}
