//! In-memory backend.
//!
//! Version chains live in a `HashMap<id, Vec<Envelope>>` behind an async
//! RwLock. This is the reference implementation for the behavioral suite:
//! insertion order within a chain is the tie-break when two versions share
//! an exact `created_at`, matching the sequence-column ordering of the SQL
//! backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use tessera_core::{
    token_intersects, Auth, Envelope, Payload, QueryTemplate, Repository, Searcher, TesseraError,
    TesseraResult,
};

/// In-memory chain store implementing both `Repository` and `Searcher`.
pub struct MemoryStore {
    chains: RwLock<HashMap<String, Vec<Envelope>>>,
    authorizer: Arc<dyn Auth>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(authorizer: Arc<dyn Auth>) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            authorizer,
        }
    }

    /// Create an empty store wrapped in Arc.
    pub fn new_shared(authorizer: Arc<dyn Auth>) -> Arc<Self> {
        Arc::new(Self::new(authorizer))
    }
}

/// Repository read rule: an empty credential set reads everything, otherwise
/// the envelope must be world-readable or share a token.
fn readable(tokens: &[String], envelope: &Envelope) -> bool {
    tokens.is_empty() || token_intersects(tokens, &envelope.authorized_tokens)
}

/// Latest visible version in a chain: maximal `created_at <= at` among
/// non-deleted readable versions, later insertion winning exact ties.
fn latest_visible<'a>(
    chain: &'a [Envelope],
    tokens: &[String],
    at: DateTime<Utc>,
) -> Option<&'a Envelope> {
    chain
        .iter()
        .enumerate()
        .filter(|(_, e)| e.visible_at(at) && readable(tokens, e))
        .max_by_key(|(index, e)| (e.created_at, *index))
        .map(|(_, e)| e)
}

/// Whether the envelope matches a JSON filter document: each key compares
/// against the payload, `"id"` against the logical id.
fn matches_filter(filter: &Payload, envelope: &Envelope) -> bool {
    filter.iter().all(|(key, expected)| {
        if key == "id" {
            envelope.id.as_deref() == expected.as_str()
        } else {
            envelope.payload.get(key) == Some(expected)
        }
    })
}

#[async_trait]
impl Repository for MemoryStore {
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope> {
        let mut stored = envelope;
        stored.id = Some(stored.id_or_generate());
        stored.created_at = Some(Utc::now());
        stored.deleted = false;
        stored.authorized_tokens = tokens.to_vec();

        let mut chains = self.chains.write().await;
        chains
            .entry(stored.id.clone().expect("id assigned"))
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn create_many(
        &self,
        envelopes: Vec<Envelope>,
        tokens: &[String],
    ) -> TesseraResult<Vec<Envelope>> {
        let mut created = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            created.push(self.create(envelope, tokens).await?);
        }
        Ok(created)
    }

    async fn read(
        &self,
        id: &str,
        tokens: &[String],
        at: Option<DateTime<Utc>>,
    ) -> TesseraResult<Option<Envelope>> {
        let at = at.unwrap_or_else(Utc::now);
        let chains = self.chains.read().await;
        Ok(chains
            .get(id)
            .and_then(|chain| latest_visible(chain, tokens, at))
            .cloned())
    }

    async fn read_many(&self, ids: &[String], tokens: &[String]) -> TesseraResult<Vec<Envelope>> {
        let now = Utc::now();
        let chains = self.chains.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| chains.get(id))
            .filter_map(|chain| latest_visible(chain, tokens, now))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str, tokens: &[String]) -> TesseraResult<bool> {
        let mut chains = self.chains.write().await;
        let Some(chain) = chains.get_mut(id) else {
            return Ok(false);
        };
        if !chain.iter().any(|e| readable(tokens, e)) {
            return Ok(false);
        }
        // Tombstone the whole chain, not just the latest version.
        for envelope in chain.iter_mut() {
            envelope.deleted = true;
        }
        Ok(true)
    }

    async fn remove_many(
        &self,
        ids: &[String],
        tokens: &[String],
    ) -> TesseraResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(ids.len());
        for id in ids {
            outcome.insert(id.clone(), self.remove(id, tokens).await?);
        }
        Ok(outcome)
    }

    async fn list(&self, tokens: &[String]) -> TesseraResult<Vec<Envelope>> {
        let now = Utc::now();
        let chains = self.chains.read().await;
        Ok(chains
            .values()
            .filter_map(|chain| latest_visible(chain, tokens, now))
            .cloned()
            .collect())
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Latest version in a chain that both is visible at `at` and matches the
/// filter. Matching happens before grouping, so a superseded version whose
/// newer sibling stopped matching is still found, exactly like the SQL and
/// Mongo query shapes.
fn latest_matching<'a>(
    chain: &'a [Envelope],
    filter: &Payload,
    at: DateTime<Utc>,
) -> Option<&'a Envelope> {
    chain
        .iter()
        .enumerate()
        .filter(|(_, e)| e.visible_at(at) && matches_filter(filter, e))
        .max_by_key(|(index, e)| (e.created_at, *index))
        .map(|(_, e)| e)
}

#[async_trait]
impl Searcher for MemoryStore {
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload> {
        let filter = parse_filter(template, args)?;

        let chains = self.chains.read().await;
        let candidate = chains
            .values()
            .filter_map(|chain| latest_matching(chain, &filter, at))
            // The id is the secondary key so equal timestamps across chains
            // pick the same winner on every run.
            .max_by_key(|e| (e.created_at, e.id.clone()))
            .cloned();
        drop(chains);

        if let Some(envelope) = candidate {
            if self.authorizer.is_authorized(creds, &envelope).await {
                return Ok(envelope.payload_with_id());
            }
        }
        Ok(Payload::new())
    }

    async fn find_all(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Vec<Payload>> {
        let filter = parse_filter(template, args)?;

        let chains = self.chains.read().await;
        let candidates: Vec<Envelope> = chains
            .values()
            .filter_map(|chain| latest_matching(chain, &filter, at))
            .cloned()
            .collect();
        drop(chains);

        let mut payloads = Vec::with_capacity(candidates.len());
        for envelope in candidates {
            if self.authorizer.is_authorized(creds, &envelope).await {
                payloads.push(envelope.payload_with_id());
            }
        }
        Ok(payloads)
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Render the template and parse it as a JSON filter document.
fn parse_filter(template: &QueryTemplate, args: &Payload) -> TesseraResult<Payload> {
    let rendered = template.render(args)?;
    let value: serde_json::Value = serde_json::from_str(&rendered).map_err(|e| {
        TesseraError::template(format!("template did not render to JSON: {rendered}: {e}"))
    })?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(TesseraError::template(format!(
            "filter must be a JSON object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::NoopAuth;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(NoopAuth))
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let store = store();
        let created = store
            .create(Envelope::new(json!({"name": "red"})), &[])
            .await
            .unwrap();
        assert!(created.id.is_some());
        assert!(created.created_at.is_some());
    }

    #[tokio::test]
    async fn update_appends_a_version() {
        let store = store();
        let v1 = store
            .create(Envelope::new(json!({"name": "red"})), &[])
            .await
            .unwrap();
        let id = v1.id.clone().unwrap();
        store
            .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
            .await
            .unwrap();

        let chains = store.chains.read().await;
        assert_eq!(chains.get(&id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn equal_timestamps_tie_break_to_later_insert() {
        let store = store();
        let at = Utc::now();
        let mut first = Envelope::with_id("x", json!({"v": 1}));
        first.created_at = Some(at);
        let mut second = Envelope::with_id("x", json!({"v": 2}));
        second.created_at = Some(at);

        {
            let mut chains = store.chains.write().await;
            chains.insert("x".to_string(), vec![first, second]);
        }

        let read = store.read("x", &[], None).await.unwrap().unwrap();
        assert_eq!(read.payload["v"], json!(2));
    }

    #[tokio::test]
    async fn remove_tombstones_every_version() {
        let store = store();
        let v1 = store
            .create(Envelope::new(json!({"name": "red"})), &[])
            .await
            .unwrap();
        let id = v1.id.clone().unwrap();
        store
            .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
            .await
            .unwrap();

        assert!(store.remove(&id, &[]).await.unwrap());
        assert!(store.read(&id, &[], None).await.unwrap().is_none());
        // Absent at the original write instant too.
        assert!(store
            .read(&id, &[], v1.created_at)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn remove_unknown_id_is_false() {
        let store = store();
        assert!(!store.remove("nope", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn token_disjoint_reads_are_absent() {
        let store = store();
        let created = store
            .create(Envelope::new(json!({"secret": true})), &["alpha".to_string()])
            .await
            .unwrap();
        let id = created.id.unwrap();

        assert!(store
            .read(&id, &["beta".to_string()], None)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .read(&id, &["alpha".to_string()], None)
            .await
            .unwrap()
            .is_some());
        // Empty credential set reads everything at the repository level.
        assert!(store.read(&id, &[], None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_parses_json_filter() {
        let store = store();
        store
            .create(Envelope::new(json!({"name": "duck", "farm": "f1"})), &[])
            .await
            .unwrap();

        let template = QueryTemplate::compile(r#"{"farm": "{{farm}}"}"#).unwrap();
        let args = json!({"farm": "f1"}).as_object().unwrap().clone();
        let found = store.find(&template, &args, &[], Utc::now()).await.unwrap();
        assert_eq!(found["name"], json!("duck"));
        assert!(found.contains_key("id"));
    }

    #[tokio::test]
    async fn find_all_matches_superseded_versions() {
        let store = store();
        let v1 = store
            .create(Envelope::new(json!({"flag": "old"})), &[])
            .await
            .unwrap();
        let id = v1.id.clone().unwrap();
        store
            .create(Envelope::with_id(&id, json!({"flag": "new"})), &[])
            .await
            .unwrap();

        let template = QueryTemplate::compile(r#"{"flag": "{{flag}}"}"#).unwrap();
        let args = json!({"flag": "old"}).as_object().unwrap().clone();

        // Filtering happens before grouping, so the older version still
        // matches even though a newer sibling superseded it.
        let all = store
            .find_all(&template, &args, &[], Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["flag"], json!("old"));

        let one = store.find(&template, &args, &[], Utc::now()).await.unwrap();
        assert_eq!(one["flag"], json!("old"));
    }

    #[tokio::test]
    async fn find_tie_across_chains_is_deterministic() {
        let store = store();
        let at = Utc::now();
        for id in ["a", "b"] {
            let mut envelope = Envelope::with_id(id, json!({"kind": "duck"}));
            envelope.created_at = Some(at);
            let mut chains = store.chains.write().await;
            chains.insert(id.to_string(), vec![envelope]);
        }

        let template = QueryTemplate::compile(r#"{"kind": "{{kind}}"}"#).unwrap();
        let args = json!({"kind": "duck"}).as_object().unwrap().clone();

        // Two chains share the exact timestamp; the id breaks the tie the
        // same way on every run.
        for _ in 0..5 {
            let found = store.find(&template, &args, &[], Utc::now()).await.unwrap();
            assert_eq!(found["id"], json!("b"));
        }
    }

    #[tokio::test]
    async fn find_with_non_json_template_is_malformed() {
        let store = store();
        let template = QueryTemplate::compile("id = '{{id}}'").unwrap();
        let args = json!({"id": "x"}).as_object().unwrap().clone();
        let err = store
            .find(&template, &args, &[], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::MalformedTemplate(_)));
    }
}
