//! Repository and Searcher contracts - all storage backends implement these.
//!
//! Every backend must honor the same semantics: envelopes are append-only,
//! an update is a new version under the same id, deletion tombstones the
//! whole chain, and reads are scoped to an instant. How a backend selects
//! the latest version (aggregation grouping, `DISTINCT ON`, window
//! functions) is its own business; results must be behaviorally identical.
//!
//! Failure semantics: transient backend errors on reads and lists degrade
//! to an empty result (logged by the backend), keeping federated callers
//! alive. Write failures always propagate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::envelope::{Envelope, Payload};
use crate::error::TesseraResult;
use crate::template::QueryTemplate;

/// Durable CRUD and versioning over envelopes.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Append a new envelope version. Assigns the id when absent and stamps
    /// `created_at` with the write instant. Never mutates existing rows.
    ///
    /// Backends must retry uniqueness collisions caused by
    /// timestamp-granularity clashes rather than failing the caller.
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope>;

    /// Batched create. Partial failure surfaces as a `BulkWrite` error
    /// carrying how many envelopes were persisted, never a silent drop.
    async fn create_many(
        &self,
        envelopes: Vec<Envelope>,
        tokens: &[String],
    ) -> TesseraResult<Vec<Envelope>>;

    /// The latest non-deleted version with `created_at <= at` (`at`
    /// defaulting to now), restricted to versions the credentials may read.
    async fn read(
        &self,
        id: &str,
        tokens: &[String],
        at: Option<DateTime<Utc>>,
    ) -> TesseraResult<Option<Envelope>>;

    /// Per-id latest authorized version. Unordered; index results by the
    /// returned id.
    async fn read_many(&self, ids: &[String], tokens: &[String]) -> TesseraResult<Vec<Envelope>>;

    /// Tombstone the logical id - every version of the chain. Returns
    /// whether authorization passed and the tombstone applied.
    async fn remove(&self, id: &str, tokens: &[String]) -> TesseraResult<bool>;

    /// Batched remove; per-id outcome map.
    async fn remove_many(
        &self,
        ids: &[String],
        tokens: &[String],
    ) -> TesseraResult<HashMap<String, bool>>;

    /// One envelope per distinct id: the latest non-deleted authorized
    /// version as of now.
    async fn list(&self, tokens: &[String]) -> TesseraResult<Vec<Envelope>>;

    /// Liveness probe.
    async fn ready(&self) -> bool;
}

/// Read-only templated query execution, authorization-filtered.
///
/// Templates originate from trusted static configuration, not end-user
/// input. Searchers add the implicit `created_at <= at AND deleted = false`
/// bound themselves and group by id before limiting, so no caller ever sees
/// two rows for one id or a stale version shadowing a newer one.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Execute the template and return the most recent matching payload with
    /// `id` injected, or an empty map when nothing matches or the caller is
    /// not authorized. Absence and unauthorized are indistinguishable.
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload>;

    /// Execute the template and return one payload per matching id, each the
    /// current version at `at`, authorization-filtered.
    async fn find_all(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Vec<Payload>>;

    /// Liveness probe.
    async fn ready(&self) -> bool;
}
