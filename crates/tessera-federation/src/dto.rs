//! DTO resolver assignment.
//!
//! `ResolverConfig` descriptors are data, never closures: the factory
//! validates them at construction and a single fixed dispatch path
//! interprets them at resolution time. Every DTO carries the root query's
//! instant so federated lookups stay on the same temporal slice as the
//! record they hang off.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;

use tessera_core::{Payload, ResolverConfig, TesseraError, TesseraResult};

use crate::loader::{LoaderRegistry, PendingValue};
use crate::selection::SelectionSet;
use crate::subgraph::{SubgraphClient, SubgraphTransport};

/// A payload plus the instant its federated fields must be read at.
#[derive(Debug, Clone)]
pub struct Dto {
    values: Payload,
    at: DateTime<Utc>,
}

impl Dto {
    pub fn values(&self) -> &Payload {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn at_millis(&self) -> i64 {
        self.at.timestamp_millis()
    }
}

/// The two ways a federated field resolves.
pub enum Resolution {
    /// Queued on a batch loader; resolves after the registry flushes.
    Pending(PendingValue),
    /// Fetched with a dedicated unbatched call.
    Immediate(serde_json::Value),
}

impl Resolution {
    /// The resolved value, whichever path produced it.
    pub async fn value(self) -> TesseraResult<serde_json::Value> {
        match self {
            Resolution::Pending(pending) => pending.resolve().await,
            Resolution::Immediate(value) => Ok(value),
        }
    }
}

struct ResolverBinding {
    foreign_key: String,
    query_name: String,
    url: Url,
}

/// Builds DTOs and dispatches their federated field lookups.
pub struct DtoFactory {
    resolvers: HashMap<String, ResolverBinding>,
    transport: Arc<dyn SubgraphTransport>,
}

impl DtoFactory {
    /// Build a factory, rejecting descriptors with unparseable URLs up
    /// front rather than at first resolution.
    pub fn new(
        configs: &[ResolverConfig],
        transport: Arc<dyn SubgraphTransport>,
    ) -> TesseraResult<Self> {
        let mut resolvers = HashMap::with_capacity(configs.len());
        for config in configs {
            let url = Url::parse(&config.url).map_err(|e| {
                TesseraError::Configuration(format!(
                    "resolver '{}' has invalid url {}: {e}",
                    config.name, config.url
                ))
            })?;
            tracing::debug!(
                field = %config.name,
                query = %config.query_name,
                url = %url,
                "assigned resolver"
            );
            resolvers.insert(
                config.name.clone(),
                ResolverBinding {
                    foreign_key: config.foreign_key.clone(),
                    query_name: config.query_name.clone(),
                    url,
                },
            );
        }
        Ok(Self {
            resolvers,
            transport,
        })
    }

    /// Field names this factory can resolve.
    pub fn resolver_fields(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }

    /// Stamp a payload with the root query's instant.
    pub fn fill_one(&self, values: Payload, at: DateTime<Utc>) -> Dto {
        Dto { values, at }
    }

    /// Stamp a batch of payloads with the same instant.
    pub fn fill_many(&self, values: Vec<Payload>, at: DateTime<Utc>) -> Vec<Dto> {
        values.into_iter().map(|v| self.fill_one(v, at)).collect()
    }

    /// Resolve one federated field of a DTO.
    ///
    /// With a registry the key is enqueued on the shared loader and the
    /// caller awaits the handle after `flush_all()`. Without one, a single
    /// unbatched call goes out immediately; same result, one request per
    /// field.
    pub async fn resolve(
        &self,
        dto: &Dto,
        field: &str,
        selection: &SelectionSet,
        registry: Option<&LoaderRegistry>,
        auth_header: Option<&str>,
    ) -> TesseraResult<Resolution> {
        let binding = self.resolvers.get(field).ok_or_else(|| {
            TesseraError::Configuration(format!("no resolver configured for field '{field}'"))
        })?;

        let Some(key) = dto.get(&binding.foreign_key).and_then(|v| v.as_str()) else {
            tracing::warn!(
                field,
                foreign_key = %binding.foreign_key,
                "foreign key absent from payload, resolving empty"
            );
            return Ok(Resolution::Immediate(serde_json::json!({})));
        };

        if let Some(registry) = registry {
            let loader = registry
                .loader(&binding.url, &binding.query_name, selection)
                .await;
            return Ok(Resolution::Pending(loader.enqueue(key).await));
        }

        let client = SubgraphClient::from_url(binding.url.clone(), self.transport.clone())
            .with_auth_header(auth_header.map(str::to_string));
        let value = client
            .query_one(&binding.query_name, key, selection, dto.at_millis())
            .await?;
        Ok(Resolution::Immediate(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::MockSubgraphTransport;
    use serde_json::json;

    fn coops_resolver() -> ResolverConfig {
        ResolverConfig {
            name: "coops".to_string(),
            foreign_key: "id".to_string(),
            query_name: "getByFarm".to_string(),
            url: "http://localhost:4044/graph".to_string(),
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn invalid_resolver_url_rejected_at_construction() {
        let mut config = coops_resolver();
        config.url = "not a url".to_string();
        let err = DtoFactory::new(&[config], Arc::new(MockSubgraphTransport::new()))
            .err()
            .expect("invalid url must be rejected");
        assert!(matches!(err, TesseraError::Configuration(_)));
    }

    #[test]
    fn fill_stamps_the_root_instant() {
        let factory =
            DtoFactory::new(&[coops_resolver()], Arc::new(MockSubgraphTransport::new())).unwrap();
        let at = Utc::now();
        let dtos = factory.fill_many(
            vec![payload(json!({"id": "f1"})), payload(json!({"id": "f2"}))],
            at,
        );
        assert_eq!(dtos.len(), 2);
        assert!(dtos.iter().all(|d| d.at() == at));
        assert_eq!(dtos[0].get("id"), Some(&json!("f1")));
    }

    #[tokio::test]
    async fn unknown_field_is_a_configuration_error() {
        let factory =
            DtoFactory::new(&[coops_resolver()], Arc::new(MockSubgraphTransport::new())).unwrap();
        let dto = factory.fill_one(payload(json!({"id": "f1"})), Utc::now());
        let err = factory
            .resolve(&dto, "hens", &SelectionSet::leaves(["id"]), None, None)
            .await
            .err()
            .expect("unconfigured field must be rejected");
        assert!(matches!(err, TesseraError::Configuration(_)));
    }

    #[tokio::test]
    async fn missing_foreign_key_resolves_empty() {
        let factory =
            DtoFactory::new(&[coops_resolver()], Arc::new(MockSubgraphTransport::new())).unwrap();
        let dto = factory.fill_one(payload(json!({"name": "no id here"})), Utc::now());
        let value = factory
            .resolve(&dto, "coops", &SelectionSet::leaves(["id"]), None, None)
            .await
            .unwrap()
            .value()
            .await
            .unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn fallback_path_queries_immediately() {
        let mut transport = MockSubgraphTransport::new();
        transport
            .expect_post()
            .times(1)
            .withf(|_, query, auth| {
                query.contains("getByFarm(id: \"f1\"") && auth.as_deref() == Some("Bearer abc")
            })
            .returning(|_, _, _| {
                Ok(json!({"data": {"getByFarm": [{"name": "c1"}, {"name": "c2"}]}}))
            });

        let factory = DtoFactory::new(&[coops_resolver()], Arc::new(transport)).unwrap();
        let dto = factory.fill_one(payload(json!({"id": "f1"})), Utc::now());

        let value = factory
            .resolve(
                &dto,
                "coops",
                &SelectionSet::leaves(["name"]),
                None,
                Some("Bearer abc"),
            )
            .await
            .unwrap()
            .value()
            .await
            .unwrap();
        assert_eq!(value, json!([{"name": "c1"}, {"name": "c2"}]));
    }

    #[tokio::test]
    async fn batched_and_fallback_paths_agree() {
        let canned = json!({"data": {
            "getByFarm": [{"name": "c1"}],
            "item_0": [{"name": "c1"}]
        }});

        let mut transport = MockSubgraphTransport::new();
        let body = canned.clone();
        transport
            .expect_post()
            .times(2)
            .returning(move |_, _, _| Ok(body.clone()));
        let transport = Arc::new(transport);

        let factory = DtoFactory::new(&[coops_resolver()], transport.clone()).unwrap();
        let dto = factory.fill_one(payload(json!({"id": "f1"})), Utc::now());
        let selection = SelectionSet::leaves(["name"]);

        let direct = factory
            .resolve(&dto, "coops", &selection, None, None)
            .await
            .unwrap()
            .value()
            .await
            .unwrap();

        let registry = LoaderRegistry::new(transport, dto.at_millis());
        let pending = factory
            .resolve(&dto, "coops", &selection, Some(&registry), None)
            .await
            .unwrap();
        registry.flush_all().await;
        let batched = pending.value().await.unwrap();

        assert_eq!(direct, batched);
    }
}
