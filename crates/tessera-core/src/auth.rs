//! Pluggable authorization capability.
//!
//! The core embeds no policy logic: searchers and repositories consume this
//! capability as an opaque predicate. Unauthorized results are represented
//! exactly like absent ones so existence never leaks.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Opaque per-request context handed to credential extraction. Route glue
/// populates it from whatever transport it serves.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Transport headers, lower-cased keys.
    pub headers: HashMap<String, String>,
}

impl RequestContext {
    /// The forwarded `authorization` header, if any.
    pub fn auth_header(&self) -> Option<&str> {
        self.headers.get("authorization").map(String::as_str)
    }
}

/// Authorization capability consumed by searchers and repositories.
#[async_trait]
pub trait Auth: Send + Sync {
    /// Extract credentials from an inbound request context.
    async fn get_auth_token(&self, context: &RequestContext) -> Vec<String>;

    /// Whether the credentials may read the envelope.
    async fn is_authorized(&self, credentials: &[String], envelope: &Envelope) -> bool;
}

/// Allow-everything authorizer.
pub struct NoopAuth;

#[async_trait]
impl Auth for NoopAuth {
    async fn get_auth_token(&self, _context: &RequestContext) -> Vec<String> {
        vec!["TOKEN".to_string()]
    }

    async fn is_authorized(&self, _credentials: &[String], _envelope: &Envelope) -> bool {
        true
    }
}

/// The common read rule: an empty token set is world-readable, otherwise the
/// credentials must intersect the envelope's tokens.
pub fn token_intersects(credentials: &[String], tokens: &[String]) -> bool {
    tokens.is_empty() || tokens.iter().any(|t| credentials.contains(t))
}
