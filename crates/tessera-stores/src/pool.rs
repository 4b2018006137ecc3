//! Explicit connection-pool registry.
//!
//! One pool per distinct connection string, created lazily on first use and
//! shared across every backend built from the same factory. Nothing here is
//! process-global: the registry is owned by the `StoreFactory`, and
//! `close()` releases every outstanding connection on shutdown.

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite", feature = "mongo"))]
use std::collections::HashMap;

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite", feature = "mongo"))]
use tokio::sync::Mutex;

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite", feature = "mongo"))]
use tessera_core::TesseraError;
use tessera_core::TesseraResult;

/// Lazily-populated pool cache keyed by connection string.
#[derive(Default)]
pub struct PoolRegistry {
    #[cfg(feature = "postgres")]
    postgres: Mutex<HashMap<String, sqlx::PgPool>>,
    #[cfg(feature = "mysql")]
    mysql: Mutex<HashMap<String, sqlx::MySqlPool>>,
    #[cfg(feature = "sqlite")]
    sqlite: Mutex<HashMap<String, sqlx::SqlitePool>>,
    #[cfg(feature = "mongo")]
    mongo: Mutex<HashMap<String, mongodb::Client>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow or create the Postgres pool for a connection string.
    #[cfg(feature = "postgres")]
    pub async fn postgres(&self, uri: &str) -> TesseraResult<sqlx::PgPool> {
        let mut pools = self.postgres.lock().await;
        if let Some(pool) = pools.get(uri) {
            return Ok(pool.clone());
        }
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to connect to PostgreSQL", e))?;
        pools.insert(uri.to_string(), pool.clone());
        Ok(pool)
    }

    /// Borrow or create the MySQL pool for a connection string.
    #[cfg(feature = "mysql")]
    pub async fn mysql(&self, uri: &str) -> TesseraResult<sqlx::MySqlPool> {
        let mut pools = self.mysql.lock().await;
        if let Some(pool) = pools.get(uri) {
            return Ok(pool.clone());
        }
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to connect to MySQL", e))?;
        pools.insert(uri.to_string(), pool.clone());
        Ok(pool)
    }

    /// Borrow or create the SQLite pool for a connection string.
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(&self, uri: &str) -> TesseraResult<sqlx::SqlitePool> {
        let mut pools = self.sqlite.lock().await;
        if let Some(pool) = pools.get(uri) {
            return Ok(pool.clone());
        }
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to connect to SQLite", e))?;
        pools.insert(uri.to_string(), pool.clone());
        Ok(pool)
    }

    /// Borrow or create the MongoDB client for a connection string.
    #[cfg(feature = "mongo")]
    pub async fn mongo(&self, uri: &str) -> TesseraResult<mongodb::Client> {
        let mut clients = self.mongo.lock().await;
        if let Some(client) = clients.get(uri) {
            return Ok(client.clone());
        }
        let mut options = mongodb::options::ClientOptions::parse(uri)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to parse MongoDB URI", e))?;
        options.app_name = Some("tessera".to_string());
        let client = mongodb::Client::with_options(options)
            .map_err(|e| TesseraError::store_with_source("Failed to create MongoDB client", e))?;
        clients.insert(uri.to_string(), client.clone());
        Ok(client)
    }

    /// Tear down every pool, releasing all outstanding connections.
    pub async fn close(&self) -> TesseraResult<()> {
        #[cfg(feature = "postgres")]
        {
            let mut pools = self.postgres.lock().await;
            for (_, pool) in pools.drain() {
                pool.close().await;
            }
        }
        #[cfg(feature = "mysql")]
        {
            let mut pools = self.mysql.lock().await;
            for (_, pool) in pools.drain() {
                pool.close().await;
            }
        }
        #[cfg(feature = "sqlite")]
        {
            let mut pools = self.sqlite.lock().await;
            for (_, pool) in pools.drain() {
                pool.close().await;
            }
        }
        #[cfg(feature = "mongo")]
        {
            // The driver closes its connections when the last clone drops.
            self.mongo.lock().await.clear();
        }
        Ok(())
    }
}
