//! Request-scoped batch loading.
//!
//! Resolving a list of parent records naively issues one subgraph call per
//! row. The loader replaces that with an explicit two-phase protocol:
//! resolvers `enqueue` their keys and hold a pending handle, then the glue
//! calls `flush_all()` once, each loader dispatches a single aliased
//! request, and every handle resolves from the demultiplexed response.
//!
//! A registry lives for exactly one request. Sharing one across requests
//! would leak another caller's credentials and temporal bound.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use url::Url;

use tessera_core::{TesseraError, TesseraResult};

use crate::selection::SelectionSet;
use crate::subgraph::{SubgraphClient, SubgraphTransport};

/// Handle for a value that resolves after the owning loader flushes.
pub struct PendingValue {
    receiver: oneshot::Receiver<TesseraResult<serde_json::Value>>,
}

impl PendingValue {
    /// Await the flushed result. Errors if the loader was dropped without
    /// flushing, which is a protocol bug in the caller.
    pub async fn resolve(self) -> TesseraResult<serde_json::Value> {
        self.receiver
            .await
            .map_err(|_| TesseraError::federation("batch loader dropped before flush"))?
    }
}

struct Waiter {
    key: String,
    sender: oneshot::Sender<TesseraResult<serde_json::Value>>,
}

/// Accumulates keys for one `(endpoint, query)` pair and dispatches them as
/// a single aliased request.
pub struct BatchLoader {
    client: SubgraphClient,
    query_name: String,
    selection: SelectionSet,
    at_millis: i64,
    pending: Mutex<Vec<Waiter>>,
}

impl BatchLoader {
    pub fn new(
        client: SubgraphClient,
        query_name: impl Into<String>,
        selection: SelectionSet,
        at_millis: i64,
    ) -> Self {
        Self {
            client,
            query_name: query_name.into(),
            selection,
            at_millis,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a key for the next flush.
    pub async fn enqueue(&self, key: impl Into<String>) -> PendingValue {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.push(Waiter {
            key: key.into(),
            sender,
        });
        PendingValue { receiver }
    }

    /// Number of keys waiting for the next flush.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Dispatch everything queued since the last flush as one request and
    /// resolve the handles in enqueue order. A transport failure resolves
    /// every handle with the same error. Nothing queued, nothing sent.
    pub async fn flush(&self) {
        let waiters: Vec<Waiter> = std::mem::take(&mut *self.pending.lock().await);
        if waiters.is_empty() {
            return;
        }

        let keys: Vec<String> = waiters.iter().map(|w| w.key.clone()).collect();
        tracing::debug!(
            query = %self.query_name,
            url = %self.client.url(),
            batch = keys.len(),
            "dispatching batched subgraph request"
        );

        match self
            .client
            .query_batch(&self.query_name, &keys, &self.selection, self.at_millis)
            .await
        {
            Ok(values) => {
                for (waiter, value) in waiters.into_iter().zip(values) {
                    let _ = waiter.sender.send(Ok(value));
                }
            }
            Err(e) => {
                tracing::warn!(query = %self.query_name, error = %e, "batched dispatch failed");
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.sender.send(Err(TesseraError::federation(message.clone())));
                }
            }
        }
    }
}

/// Request-scoped loader cache keyed by `(endpoint, query name)`.
pub struct LoaderRegistry {
    transport: Arc<dyn SubgraphTransport>,
    auth_header: Option<String>,
    at_millis: i64,
    loaders: Mutex<HashMap<(String, String), Arc<BatchLoader>>>,
}

impl LoaderRegistry {
    /// Create a registry for one request, pinned to its temporal bound.
    pub fn new(transport: Arc<dyn SubgraphTransport>, at_millis: i64) -> Self {
        Self {
            transport,
            auth_header: None,
            at_millis,
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Forward the request's Authorization header on every dispatch.
    pub fn with_auth_header(mut self, header: Option<String>) -> Self {
        self.auth_header = header;
        self
    }

    /// Borrow or create the loader for an endpoint/query pair. The first
    /// caller's selection wins for the whole request.
    pub async fn loader(
        &self,
        url: &Url,
        query_name: &str,
        selection: &SelectionSet,
    ) -> Arc<BatchLoader> {
        let key = (url.to_string(), query_name.to_string());
        let mut loaders = self.loaders.lock().await;
        loaders
            .entry(key)
            .or_insert_with(|| {
                let client = SubgraphClient::from_url(url.clone(), self.transport.clone())
                    .with_auth_header(self.auth_header.clone());
                Arc::new(BatchLoader::new(
                    client,
                    query_name,
                    selection.clone(),
                    self.at_millis,
                ))
            })
            .clone()
    }

    /// The scope barrier: flush every loader. Callers enqueue everything
    /// first, flush once, then await their pending handles.
    pub async fn flush_all(&self) {
        let loaders: Vec<Arc<BatchLoader>> =
            self.loaders.lock().await.values().cloned().collect();
        futures::future::join_all(loaders.iter().map(|loader| loader.flush())).await;
    }
}
