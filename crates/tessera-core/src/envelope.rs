//! Envelope data model.
//!
//! An envelope is one immutable version of a logical record: a stable `id`,
//! an opaque JSON payload, the write instant, a tombstone flag, and the
//! credential set allowed to read it. Multiple envelopes sharing an `id`
//! form a version chain ordered by `created_at`; the version current at
//! instant `t` is the latest non-deleted one with `created_at <= t`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque document payload.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// One immutable version of a logical record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Stable logical identifier, shared by every version of the record.
    /// Absent on first creation; the repository assigns a UUID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Opaque document.
    pub payload: Payload,
    /// Write instant, stamped by the repository.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Tombstone flag. Deletion tombstones the whole id, every version.
    #[serde(default)]
    pub deleted: bool,
    /// Credentials allowed to read this version. Empty = world-readable.
    #[serde(default)]
    pub authorized_tokens: Vec<String>,
}

impl Envelope {
    /// Create an unwritten envelope from a payload. The repository assigns
    /// `id` and `created_at` on create.
    pub fn new(payload: impl Into<serde_json::Value>) -> Self {
        let payload = match payload.into() {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = Payload::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: None,
            payload,
            created_at: None,
            deleted: false,
            authorized_tokens: Vec::new(),
        }
    }

    /// Create an unwritten envelope carrying an existing logical id, i.e.
    /// the next version of a record.
    pub fn with_id(id: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        let mut envelope = Self::new(payload);
        envelope.id = Some(id.into());
        envelope
    }

    /// The logical id, generating a fresh UUID when none was supplied.
    /// Identifiers are never reused for a different logical record.
    pub fn id_or_generate(&self) -> String {
        self.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// The payload with the logical id injected under `"id"`, the shape
    /// searchers hand to callers.
    pub fn payload_with_id(&self) -> Payload {
        let mut payload = self.payload.clone();
        if let Some(id) = &self.id {
            payload.insert("id".to_string(), serde_json::Value::String(id.clone()));
        }
        payload
    }

    /// Whether this version is visible at instant `at`: written at or before
    /// `at` and not tombstoned.
    pub fn visible_at(&self, at: DateTime<Utc>) -> bool {
        !self.deleted && self.created_at.map(|c| c <= at).unwrap_or(false)
    }
}
