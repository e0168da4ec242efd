//! Proxy resolution for outgoing requests.
//!
//! Each session keeps the proxy its identity was provisioned with; resolution
//! is a lookup, not a rotation policy. Swapping proxies happens by rotating
//! identities, never by moving an identity onto a different exit address.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::identity::Identity;

/// Maps a session id to the proxy endpoint its requests must egress through.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    async fn resolve(&self, session_id: &str) -> Option<String>;
}

/// Resolver backed by the identity list loaded at run start. Unknown session
/// ids resolve to `None` (direct connection).
#[derive(Debug, Clone, Default)]
pub struct IdentityProxyResolver {
    proxies: HashMap<String, String>,
}

impl IdentityProxyResolver {
    pub fn from_identities(identities: &[Identity]) -> Self {
        let proxies = identities
            .iter()
            .map(|identity| (identity.session_id(), identity.proxy.clone()))
            .collect();
        Self { proxies }
    }
}

#[async_trait]
impl ProxyResolver for IdentityProxyResolver {
    async fn resolve(&self, session_id: &str) -> Option<String> {
        self.proxies.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_sessions_only() {
        let identities = vec![
            Identity::new(1, "http://10.0.0.1:8080", "a"),
            Identity::new(2, "http://10.0.0.2:8080", "b"),
        ];
        let resolver = IdentityProxyResolver::from_identities(&identities);

        assert_eq!(
            resolver.resolve("session-2").await.as_deref(),
            Some("http://10.0.0.2:8080")
        );
        assert_eq!(resolver.resolve("session-9").await, None);
    }
}
