//! Per-identity runtime session state and the discovery/final phase machine.
//!
//! A session is the mutable side of an identity: the live cookie jar, the
//! behavioral phase downstream request preparation consults, the usability
//! flag, and a rotation counter. Exactly one session exists per identity for
//! the lifetime of the pool.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use crate::identity::Identity;

/// Behavioral phase attached to a session.
///
/// `Final` is the default and looks terminal but is not: a session can be
/// driven back to `Discovery` for a fresh warm-up pass. Both transitions are
/// unconditional and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    Discovery,
    #[default]
    Final,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "DISCOVERY",
            Phase::Final => "FINAL",
        }
    }
}

/// Mutable runtime binding of one identity to in-progress crawl state.
#[derive(Debug, Clone)]
pub struct Session {
    identity: Arc<Identity>,
    session_id: String,
    cookies: HashMap<String, String>,
    phase: Phase,
    usable: bool,
    rotation_count: u32,
}

impl Session {
    pub fn from_identity(identity: Arc<Identity>) -> Self {
        let session_id = identity.session_id();
        let cookies = identity.cookies.clone();
        Self {
            identity,
            session_id,
            cookies,
            phase: Phase::default(),
            usable: true,
            rotation_count: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_agent(&self) -> &str {
        &self.identity.user_agent
    }

    pub fn proxy(&self) -> &str {
        &self.identity.proxy
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Overlay response cookies onto the jar. Response values win.
    pub fn merge_cookies(&mut self, cookies: HashMap<String, String>) {
        self.cookies.extend(cookies);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_in_discovery_phase(&self) -> bool {
        self.phase == Phase::Discovery
    }

    /// Drive the session (back) into the discovery phase.
    pub fn continue_discovery(&mut self) {
        self.phase = Phase::Discovery;
    }

    /// Settle the session into the final phase.
    pub fn finalize_discovery(&mut self) {
        self.phase = Phase::Final;
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Permanently mark the session unusable. Never reversed within the same
    /// pool instance.
    pub fn retire(&mut self) {
        self.usable = false;
        self.rotation_count += 1;
    }

    pub fn rotation_count(&self) -> u32 {
        self.rotation_count
    }

    /// Merge the mutated cookie jar back onto a clone of the originating
    /// identity for write-back persistence.
    pub fn identity_snapshot(&self) -> Identity {
        let mut identity = (*self.identity).clone();
        identity.cookies.extend(self.cookies.clone());
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::from_identity(Arc::new(Identity::new(1, "http://p:1", "agent")))
    }

    #[test]
    fn defaults_to_final_phase() {
        let session = session();
        assert_eq!(session.phase(), Phase::Final);
        assert!(!session.is_in_discovery_phase());
        assert!(session.is_usable());
        assert_eq!(session.rotation_count(), 0);
    }

    #[test]
    fn phase_transitions_are_idempotent() {
        let mut session = session();
        session.continue_discovery();
        session.continue_discovery();
        assert_eq!(session.phase(), Phase::Discovery);

        session.finalize_discovery();
        session.continue_discovery();
        assert!(session.is_in_discovery_phase());

        session.finalize_discovery();
        session.finalize_discovery();
        assert_eq!(session.phase(), Phase::Final);
    }

    #[test]
    fn response_cookies_win_on_merge() {
        let identity = Identity::new(7, "http://p:1", "agent")
            .with_cookies(HashMap::from([("tok".into(), "old".into())]));
        let mut session = Session::from_identity(Arc::new(identity));

        session.merge_cookies(HashMap::from([
            ("tok".into(), "new".into()),
            ("extra".into(), "1".into()),
        ]));

        assert_eq!(session.cookies().get("tok").map(String::as_str), Some("new"));
        assert_eq!(session.cookies().len(), 2);
    }

    #[test]
    fn snapshot_carries_mutated_cookies() {
        let mut session = session();
        session.merge_cookies(HashMap::from([("sid".into(), "xyz".into())]));

        let snapshot = session.identity_snapshot();
        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.cookies.get("sid").map(String::as_str), Some("xyz"));
    }
}
