//! Subgraph HTTP client.
//!
//! Sibling services expose one POST endpoint accepting `{"query": ...}` and
//! answering `{"data": ...}` or `{"errors": [...]}`. The transport is a
//! trait so tests can count dispatches without a listening server; the
//! production transport is a thin reqwest wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use tessera_core::{TesseraError, TesseraResult};

use crate::selection::SelectionSet;

/// Wire-level POST to a sibling service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubgraphTransport: Send + Sync {
    /// Post a query body and return the parsed JSON response.
    async fn post(
        &self,
        url: &Url,
        query: &str,
        auth_header: Option<String>,
    ) -> TesseraResult<serde_json::Value>;
}

/// reqwest-backed transport.
#[derive(Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubgraphTransport for HttpTransport {
    async fn post(
        &self,
        url: &Url,
        query: &str,
        auth_header: Option<String>,
    ) -> TesseraResult<serde_json::Value> {
        tracing::trace!(url = %url, "subgraph call");
        let mut request = self
            .client
            .post(url.clone())
            .json(&serde_json::json!({ "query": query }));
        if let Some(header) = auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TesseraError::federation_with_source("Subgraph request failed", e))?;
        let text = response
            .text()
            .await
            .map_err(|e| TesseraError::federation_with_source("Subgraph response unreadable", e))?;

        serde_json::from_str(&text)
            .map_err(|_| TesseraError::federation(format!("Subgraph returned non-JSON: {text}")))
    }
}

/// Client for one sibling service endpoint.
#[derive(Clone)]
pub struct SubgraphClient {
    url: Url,
    auth_header: Option<String>,
    transport: Arc<dyn SubgraphTransport>,
}

impl SubgraphClient {
    /// Build a client, validating the endpoint URL.
    pub fn new(url: &str, transport: Arc<dyn SubgraphTransport>) -> TesseraResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| TesseraError::Configuration(format!("invalid subgraph url {url}: {e}")))?;
        Ok(Self::from_url(url, transport))
    }

    /// Build a client over an already-validated URL.
    pub fn from_url(url: Url, transport: Arc<dyn SubgraphTransport>) -> Self {
        Self {
            url,
            auth_header: None,
            transport,
        }
    }

    /// Forward an Authorization header with every call.
    pub fn with_auth_header(mut self, header: Option<String>) -> Self {
        self.auth_header = header;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// One sub-query: `{ name(id: "k", at: millis) { body } }`.
    pub fn single_query(
        query_name: &str,
        key: &str,
        selection: &SelectionSet,
        at_millis: i64,
    ) -> String {
        format!(
            "{{ {query_name}(id: \"{key}\", at: {at_millis}) {{ {} }} }}",
            selection.to_query_body()
        )
    }

    /// One request carrying every key as an aliased sub-query, the temporal
    /// bound threaded into each:
    /// `{ item_0: name(id: "a", at: millis) { body } item_1: ... }`.
    pub fn aliased_query(
        query_name: &str,
        keys: &[String],
        selection: &SelectionSet,
        at_millis: i64,
    ) -> String {
        let body = selection.to_query_body();
        let aliased: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                format!("item_{index}: {query_name}(id: \"{key}\", at: {at_millis}) {{ {body} }}")
            })
            .collect();
        format!("{{ {} }}", aliased.join(" "))
    }

    /// Run a single query and return `data[query_name]`.
    pub async fn query_one(
        &self,
        query_name: &str,
        key: &str,
        selection: &SelectionSet,
        at_millis: i64,
    ) -> TesseraResult<serde_json::Value> {
        let query = Self::single_query(query_name, key, selection, at_millis);
        let body = self
            .transport
            .post(&self.url, &query, self.auth_header.clone())
            .await?;
        extract(&body, query_name)
    }

    /// Run one aliased request for every key, returning the per-key results
    /// in input order.
    pub async fn query_batch(
        &self,
        query_name: &str,
        keys: &[String],
        selection: &SelectionSet,
        at_millis: i64,
    ) -> TesseraResult<Vec<serde_json::Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = Self::aliased_query(query_name, keys, selection, at_millis);
        let body = self
            .transport
            .post(&self.url, &query, self.auth_header.clone())
            .await?;

        check_errors(&body)?;
        Ok((0..keys.len())
            .map(|index| result_at(&body, &format!("item_{index}")))
            .collect())
    }
}

fn check_errors(body: &serde_json::Value) -> TesseraResult<()> {
    if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
        let message = errors
            .first()
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("subgraph query failed");
        return Err(TesseraError::federation(message));
    }
    Ok(())
}

/// `data[key]`, where an absent or null entry is an empty map, not an error.
fn result_at(body: &serde_json::Value, key: &str) -> serde_json::Value {
    match body.get("data").and_then(|data| data.get(key)) {
        Some(serde_json::Value::Null) | None => serde_json::json!({}),
        Some(value) => value.clone(),
    }
}

fn extract(body: &serde_json::Value, key: &str) -> TesseraResult<serde_json::Value> {
    check_errors(body)?;
    Ok(result_at(body, key))
}
