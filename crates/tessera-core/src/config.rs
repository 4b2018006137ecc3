//! Declarative configuration for stores and federation.
//!
//! Route glue builds repositories, searchers, and resolver dispatch tables
//! from these structs; the core never branches on provider type once a
//! backend has been constructed.

use serde::{Deserialize, Serialize};

/// Storage provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    #[default]
    Memory,
    Mongo,
    Postgres,
    Mysql,
    Sqlite,
}

/// Flat storage descriptor a backend is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Provider type.
    pub provider: StorageProvider,
    /// Collection or table name.
    pub collection: String,
    /// Connection string, where the provider needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Provider-specific configuration.
    #[serde(flatten)]
    pub config: serde_json::Value,
}

impl StorageConfig {
    /// In-memory descriptor, handy for tests.
    pub fn memory(collection: impl Into<String>) -> Self {
        Self {
            provider: StorageProvider::Memory,
            collection: collection.into(),
            uri: None,
            config: serde_json::json!({}),
        }
    }
}

/// Maps an exposed field name to a federated lookup on a sibling service.
/// Immutable after process start; a fixed dispatch function interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Field name exposed on the local payload.
    pub name: String,
    /// Local payload field holding the foreign key.
    #[serde(default = "default_foreign_key")]
    pub foreign_key: String,
    /// Query name on the remote service.
    pub query_name: String,
    /// Remote service base URL.
    pub url: String,
}

fn default_foreign_key() -> String {
    "id".to_string()
}

/// A named single-result query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingletonConfig {
    pub name: String,
    /// Query template source.
    pub query: String,
}

/// A named multi-result query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub name: String,
    /// Query template source.
    pub query: String,
}

/// Everything the glue needs to wire one service's query surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RootConfig {
    #[serde(default)]
    pub singletons: Vec<SingletonConfig>,
    #[serde(default)]
    pub vectors: Vec<VectorConfig>,
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_round_trips_with_flattened_extras() {
        let raw = serde_json::json!({
            "provider": "postgres",
            "collection": "farms",
            "uri": "postgres://localhost/test",
            "max_connections": 5
        });
        let config: StorageConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.provider, StorageProvider::Postgres);
        assert_eq!(config.collection, "farms");
        assert_eq!(config.config["max_connections"], 5);
    }

    #[test]
    fn resolver_foreign_key_defaults_to_id() {
        let raw = serde_json::json!({
            "name": "coops",
            "query_name": "getByFarm",
            "url": "http://localhost:4044/graph"
        });
        let resolver: ResolverConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(resolver.foreign_key, "id");
    }

    #[test]
    fn root_config_sections_default_empty() {
        let config: RootConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(config.singletons.is_empty());
        assert!(config.vectors.is_empty());
        assert!(config.resolvers.is_empty());
    }
}
