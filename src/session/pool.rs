//! Admission-controlled session pool with cooldown gating.
//!
//! Hands out rested sessions under a cooldown policy, retires bad ones
//! permanently, and guarantees that no two concurrent callers ever hold the
//! same session at once. Selection is uniform-random among the eligible
//! subset so load spreads evenly instead of following a fingerprintable
//! round-robin order.
//!
//! Waiting for a session to rest is a poll-with-sleep loop rather than a
//! condition variable: cooldown expiry is time-based and pool membership can
//! shrink concurrently, so polling keeps the implementation simple at the
//! cost of up to one poll interval of added latency.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::identity::Identity;
use crate::session::{Phase, Session};

/// Cooldown and wait-budget knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum time between two uses of the same session.
    pub cooldown: Duration,
    /// Sleep between acquisition attempts while no session is rested.
    pub poll_interval: Duration,
    /// Total wait budget for one acquisition before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Error surfaced by pool acquisition.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no sessions available in the pool")]
    NoSessions,
    #[error("timed out after {0:?} waiting for a rested session")]
    ExhaustedTimeout(Duration),
}

/// Result of a direct, non-blocking claim on a specific session.
#[derive(Debug)]
pub enum SessionClaim {
    Granted(SessionLease),
    /// The session exists and is usable but is held by another in-flight unit.
    Busy,
    /// The session is absent or has been retired.
    Unavailable,
}

#[derive(Debug)]
struct PoolState {
    sessions: HashMap<String, Session>,
    last_used: HashMap<String, Instant>,
    leased: HashSet<String>,
    max_size: usize,
}

impl PoolState {
    fn is_rested(&self, session_id: &str, now: Instant, cooldown: Duration) -> bool {
        match self.last_used.get(session_id) {
            Some(used) => now.duration_since(*used) > cooldown,
            None => true,
        }
    }

    /// Uniform-random pick among rested, un-leased sessions. The first pass
    /// intentionally skips the usability check so an externally retired
    /// session surfaces and triggers a purge, mirroring the recovery path in
    /// [`SessionPool::try_acquire`].
    fn pick_rested(
        &self,
        now: Instant,
        cooldown: Duration,
        require_usable: bool,
    ) -> Option<String> {
        let candidates: Vec<&String> = self
            .sessions
            .iter()
            .filter(|(id, session)| {
                !self.leased.contains(*id)
                    && (!require_usable || session.is_usable())
                    && self.is_rested(id, now, cooldown)
            })
            .map(|(id, _)| id)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|id| (*id).to_string())
    }

    /// Drop retired sessions that nobody is holding.
    fn purge_retired(&mut self) {
        self.sessions
            .retain(|id, session| session.is_usable() || self.leased.contains(id));
    }
}

/// Fixed pool of sessions, one per identity, shrinking monotonically as
/// sessions are retired. Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct SessionPool {
    state: Arc<Mutex<PoolState>>,
    config: PoolConfig,
}

impl SessionPool {
    pub fn from_identities(identities: Vec<Identity>, config: PoolConfig) -> Self {
        let sessions: HashMap<String, Session> = identities
            .into_iter()
            .map(|identity| {
                let session = Session::from_identity(Arc::new(identity));
                (session.session_id().to_string(), session)
            })
            .collect();
        let max_size = sessions.len();
        Self {
            state: Arc::new(Mutex::new(PoolState {
                sessions,
                last_used: HashMap::new(),
                leased: HashSet::new(),
                max_size,
            })),
            config,
        }
    }

    /// Acquire a random rested session, waiting if none is currently
    /// eligible. Fails once the configured wait budget is exhausted.
    pub async fn acquire(&self) -> Result<SessionLease, PoolError> {
        let started = Instant::now();
        let mut announced = false;
        loop {
            if let Some(lease) = self.try_acquire()? {
                return Ok(lease);
            }
            if !announced {
                log::info!("waiting for a session to rest");
                announced = true;
            }
            if started.elapsed() >= self.config.acquire_timeout {
                return Err(PoolError::ExhaustedTimeout(self.config.acquire_timeout));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Single non-blocking acquisition attempt.
    ///
    /// Stamps `last_used` at acquisition time, so the cooldown window is
    /// measured from hand-out rather than from response time.
    pub fn try_acquire(&self) -> Result<Option<SessionLease>, PoolError> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if state.sessions.is_empty() {
            return Err(PoolError::NoSessions);
        }

        let now = Instant::now();
        let Some(candidate) = state.pick_rested(now, self.config.cooldown, false) else {
            return Ok(None);
        };

        // A retired session slipped into the draw: clean up and re-select
        // once, this time demanding usability.
        let usable = state
            .sessions
            .get(&candidate)
            .is_some_and(Session::is_usable);
        let chosen = if usable {
            candidate
        } else {
            state.purge_retired();
            match state.pick_rested(now, self.config.cooldown, true) {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        state.last_used.insert(chosen.clone(), now);
        state.leased.insert(chosen.clone());
        Ok(Some(self.lease(chosen, &state)))
    }

    /// Claim a specific session by id without blocking. Sticky units use
    /// this; the cooldown gate is intentionally bypassed because sticky
    /// work is already paced by its issuer.
    pub fn claim(&self, session_id: &str) -> SessionClaim {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let usable = state
            .sessions
            .get(session_id)
            .is_some_and(Session::is_usable);
        if !usable {
            return SessionClaim::Unavailable;
        }
        if state.leased.contains(session_id) {
            return SessionClaim::Busy;
        }
        state.last_used.insert(session_id.to_string(), Instant::now());
        state.leased.insert(session_id.to_string());
        SessionClaim::Granted(self.lease(session_id.to_string(), &state))
    }

    /// Permanently retire a session. It is never resurrected and no
    /// replacement is created; the pool only ever shrinks.
    pub fn retire(&self, session_id: &str) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.retire();
            log::warn!("retired session {session_id}");
        }
    }

    /// Stamp `now` as the session's last-used time.
    pub fn touch(&self, session_id: &str) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.last_used.insert(session_id.to_string(), Instant::now());
    }

    /// Write-back list: every remaining session merged back onto its
    /// originating identity.
    pub fn snapshot_identities(&self) -> Vec<Identity> {
        let state = self.state.lock().expect("pool lock poisoned");
        state
            .sessions
            .values()
            .map(Session::identity_snapshot)
            .collect()
    }

    /// Number of sessions still present (usable or awaiting purge).
    pub fn len(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions still eligible for selection (usable, ignoring
    /// cooldown and leases).
    pub fn selectable_len(&self) -> usize {
        let state = self.state.lock().expect("pool lock poisoned");
        state
            .sessions
            .values()
            .filter(|session| session.is_usable())
            .count()
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().expect("pool lock poisoned").max_size
    }

    fn lease(&self, session_id: String, state: &PoolState) -> SessionLease {
        let session = &state.sessions[&session_id];
        SessionLease {
            state: Arc::clone(&self.state),
            user_agent: session.user_agent().to_string(),
            proxy: session.proxy().to_string(),
            session_id,
        }
    }
}

/// Exclusive handle on one pooled session.
///
/// Holding a lease guarantees no other caller is handed the same session;
/// dropping it returns the session to the selectable set (subject to its
/// cooldown). Session-local state is only ever mutated through the lease.
#[derive(Debug)]
pub struct SessionLease {
    state: Arc<Mutex<PoolState>>,
    session_id: String,
    user_agent: String,
    proxy: String,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.with_session(|session| session.cookies().clone())
            .unwrap_or_default()
    }

    pub fn merge_cookies(&self, cookies: HashMap<String, String>) {
        self.with_session_mut(|session| session.merge_cookies(cookies));
    }

    pub fn phase(&self) -> Phase {
        self.with_session(|session| session.phase()).unwrap_or_default()
    }

    pub fn is_in_discovery_phase(&self) -> bool {
        self.phase() == Phase::Discovery
    }

    pub fn continue_discovery(&self) {
        self.with_session_mut(Session::continue_discovery);
    }

    pub fn finalize_discovery(&self) {
        self.with_session_mut(Session::finalize_discovery);
    }

    pub fn rotation_count(&self) -> u32 {
        self.with_session(Session::rotation_count).unwrap_or(0)
    }

    fn with_session<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        let state = self.state.lock().expect("pool lock poisoned");
        state.sessions.get(&self.session_id).map(f)
    }

    fn with_session_mut(&self, f: impl FnOnce(&mut Session)) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if let Some(session) = state.sessions.get_mut(&self.session_id) {
            f(session);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.leased.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identities(n: u64) -> Vec<Identity> {
        (0..n)
            .map(|i| Identity::new(i, format!("http://10.0.0.{i}:8080"), format!("agent-{i}")))
            .collect()
    }

    fn pool(n: u64, config: PoolConfig) -> SessionPool {
        SessionPool::from_identities(identities(n), config)
    }

    #[tokio::test]
    async fn acquire_hands_out_distinct_sessions() {
        let pool = pool(3, PoolConfig::default());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        let mut ids = vec![a.session_id(), b.session_id(), c.session_id()];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn leased_sessions_are_never_double_allocated() {
        let pool = pool(1, PoolConfig::default());
        let lease = pool.acquire().await.unwrap();
        assert!(pool.try_acquire().unwrap().is_none());
        drop(lease);
        // Still cooling down after release, but no longer leased.
        assert!(pool.try_acquire().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_gates_reselection() {
        let config = PoolConfig {
            cooldown: Duration::from_secs(3),
            ..PoolConfig::default()
        };
        let pool = pool(1, config);

        let lease = pool.acquire().await.unwrap();
        drop(lease);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(pool.try_acquire().unwrap().is_none(), "eligible only strictly after cooldown");

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(pool.try_acquire().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_nothing_rests() {
        let config = PoolConfig {
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let pool = pool(1, config);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::ExhaustedTimeout(_)));
    }

    #[tokio::test]
    async fn empty_pool_fails_fast() {
        let pool = SessionPool::from_identities(Vec::new(), PoolConfig::default());
        assert!(matches!(pool.acquire().await, Err(PoolError::NoSessions)));
    }

    #[tokio::test]
    async fn retirement_shrinks_the_pool_monotonically() {
        let pool = pool(5, PoolConfig::default());
        pool.retire("session-0");
        pool.retire("session-3");

        assert_eq!(pool.selectable_len(), 3);
        assert_eq!(pool.max_size(), 5);

        // Retirement is never reversed; re-retiring is harmless.
        pool.retire("session-0");
        assert_eq!(pool.selectable_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_sessions_are_purged_and_skipped() {
        let config = PoolConfig {
            cooldown: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        let pool = pool(2, config);
        pool.retire("session-0");

        // Repeated draws must only ever yield the surviving session.
        for _ in 0..10 {
            let lease = pool.acquire().await.unwrap();
            assert_eq!(lease.session_id(), "session-1");
            drop(lease);
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_restarts_the_cooldown_window() {
        let config = PoolConfig {
            cooldown: Duration::from_secs(3),
            ..PoolConfig::default()
        };
        let pool = pool(1, config);

        let lease = pool.acquire().await.unwrap();
        drop(lease);

        tokio::time::advance(Duration::from_secs(2)).await;
        pool.touch("session-0");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pool.try_acquire().unwrap().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pool.try_acquire().unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_by_id_reports_busy_and_unavailable() {
        let pool = pool(2, PoolConfig::default());

        let held = match pool.claim("session-0") {
            SessionClaim::Granted(lease) => lease,
            other => panic!("expected grant, got {other:?}"),
        };
        assert!(matches!(pool.claim("session-0"), SessionClaim::Busy));

        pool.retire("session-1");
        assert!(matches!(pool.claim("session-1"), SessionClaim::Unavailable));
        assert!(matches!(pool.claim("session-99"), SessionClaim::Unavailable));

        drop(held);
        assert!(matches!(pool.claim("session-0"), SessionClaim::Granted(_)));
    }

    #[tokio::test]
    async fn snapshot_merges_lease_mutations() {
        let pool = pool(1, PoolConfig::default());
        let lease = pool.acquire().await.unwrap();
        lease.merge_cookies(HashMap::from([("sid".into(), "abc".into())]));
        lease.continue_discovery();
        drop(lease);

        let snapshot = pool.snapshot_identities();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].cookies.get("sid").map(String::as_str), Some("abc"));
    }
}
