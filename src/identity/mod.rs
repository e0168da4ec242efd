//! Identity records and the store they are loaded from.
//!
//! An identity bundles everything one crawl actor presents to the outside
//! world: a proxy endpoint, a browser fingerprint, a user agent, and a
//! starting cookie jar. Identities are loaded once at run start, bound 1:1
//! to sessions, and written back (with mutated cookies) when the run ends.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Prefix used to derive the externally observable session id.
const SESSION_ID_PREFIX: &str = "session-";

/// Immutable description of one crawl actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: u64,
    pub proxy: String,
    /// Opaque browser fingerprint, carried through untouched.
    #[serde(default)]
    pub fingerprint: Value,
    pub user_agent: String,
    /// Starting cookie jar, keyed by cookie name.
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Free-form data the identity store attaches (account tags, notes…).
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl Identity {
    pub fn new(id: u64, proxy: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            id,
            proxy: proxy.into(),
            fingerprint: Value::Null,
            user_agent: user_agent.into(),
            cookies: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Value) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Deterministic session id derived from the numeric identity id.
    pub fn session_id(&self) -> String {
        format!("{SESSION_ID_PREFIX}{}", self.id)
    }

    /// Inverse of [`Identity::session_id`].
    pub fn id_from_session_id(session_id: &str) -> Option<u64> {
        session_id
            .strip_prefix(SESSION_ID_PREFIX)
            .and_then(|raw| raw.parse().ok())
    }
}

/// Error surfaced by identity store implementations.
#[derive(Debug, Error)]
#[error("identity store error: {0}")]
pub struct IdentityStoreError(pub String);

/// External collaborator that supplies identities at run start and receives
/// the mutated snapshot at run end.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Identity>, IdentityStoreError>;

    async fn save(&self, identities: Vec<Identity>) -> Result<(), IdentityStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips() {
        let identity = Identity::new(42, "http://10.0.0.1:8080", "agent");
        assert_eq!(identity.session_id(), "session-42");
        assert_eq!(Identity::id_from_session_id("session-42"), Some(42));
    }

    #[test]
    fn rejects_foreign_session_ids() {
        assert_eq!(Identity::id_from_session_id("other-42"), None);
        assert_eq!(Identity::id_from_session_id("session-abc"), None);
    }
}
