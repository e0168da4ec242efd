//! Handler pipeline boundary: execution context, outcome taxonomy, and the
//! classifier mapping outcomes to recovery actions.
//!
//! The pipeline itself (transport, parsing, artifact writes) is an external
//! collaborator. It reports back through [`HandlerOutcome`], an explicit
//! tagged union the executor switches on instead of catching a hierarchy of
//! exception types. Anything the pipeline cannot classify is returned as
//! [`FatalError`] and aborts the whole run.

use std::collections::HashMap;

use async_trait::async_trait;
use http::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use thiserror::Error;

use super::unit::{RequestUnit, WorkType};
use crate::session::Phase;
use crate::session::pool::SessionLease;

/// Header downstream services read to vary behavior per phase.
pub const PHASE_HEADER: &str = "x-crawl-phase";

/// Error building the execution context (bad header material).
#[derive(Debug, Error)]
#[error("invalid header '{0}'")]
pub struct InvalidHeader(pub String);

/// Unclassified failure: the run is in an unknown state and must abort.
#[derive(Debug, Error)]
#[error("fatal pipeline error: {0}")]
pub struct FatalError(pub String);

/// Everything the handler pipeline needs to execute one unit: the unit
/// itself, the exclusive session lease, the resolved proxy, and prepared
/// headers. Contexts reference the session through its lease rather than
/// holding pool internals, so there is no ownership cycle back into the pool.
pub struct RequestContext {
    pub unit: RequestUnit,
    pub lease: SessionLease,
    pub proxy: Option<String>,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn new(
        unit: RequestUnit,
        lease: SessionLease,
        proxy: Option<String>,
    ) -> Result<Self, InvalidHeader> {
        let headers = prepare_headers(&unit, &lease)?;
        Ok(Self {
            unit,
            lease,
            proxy,
            headers,
        })
    }

    pub fn session_id(&self) -> &str {
        self.lease.session_id()
    }

    /// Effective phase for this dispatch: warm-up visits always run as
    /// discovery regardless of the session's own phase.
    pub fn phase(&self) -> Phase {
        if self.unit.work_type == WorkType::BeforeStart {
            Phase::Discovery
        } else {
            self.lease.phase()
        }
    }

    pub fn is_in_discovery_phase(&self) -> bool {
        self.phase() == Phase::Discovery
    }

    /// Drive the underlying session (back) into discovery.
    pub fn continue_discovery(&self) {
        self.lease.continue_discovery();
    }

    /// Settle the underlying session into its final phase.
    pub fn finalize_discovery(&self) {
        self.lease.finalize_discovery();
    }
}

/// Apply the identity's presentation to the outgoing request: user agent,
/// the session cookie jar, and the phase marker.
fn prepare_headers(unit: &RequestUnit, lease: &SessionLease) -> Result<HeaderMap, InvalidHeader> {
    let mut headers = HeaderMap::new();

    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(lease.user_agent())
            .map_err(|_| InvalidHeader("user-agent".into()))?,
    );

    let cookies = lease.cookies();
    if !cookies.is_empty() {
        let mut pairs: Vec<String> = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        pairs.sort_unstable();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&pairs.join("; ")).map_err(|_| InvalidHeader("cookie".into()))?,
        );
    }

    let phase = if unit.work_type == WorkType::BeforeStart {
        Phase::Discovery
    } else {
        lease.phase()
    };
    headers.insert(
        HeaderName::from_static(PHASE_HEADER),
        HeaderValue::from_static(phase.as_str()),
    );

    Ok(headers)
}

/// Outcome of one pipeline execution, one row per taxonomy entry.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Clean success; response cookies are merged back onto the session.
    Success { cookies: HashMap<String, String> },
    /// The unit was already claimed or processed elsewhere.
    Collision { reason: String },
    /// Application-level parsing/logic error raised by the handler.
    HandlerError { message: String },
    /// Session-level block/ban/soft-ban signal; the identity is burned.
    SessionBlocked { reason: String },
    /// An upstream stage short-circuited (robots disallow, early exit).
    Interrupted { reason: String },
    /// The pipeline failed before the handler ran.
    InitFailed { message: String },
}

impl HandlerOutcome {
    pub fn success() -> Self {
        HandlerOutcome::Success {
            cookies: HashMap::new(),
        }
    }
}

/// What the executor does with a classified outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Commit the result and mark the unit handled.
    Commit,
    /// Mark handled as a terminal failure; no retry.
    FailTerminal,
    /// Retire the session, bump the unit's rotation counter, and reclaim it.
    Rotate,
    /// Mark handled without committing a result.
    Skip,
}

/// Pure mapping from outcome to recovery action. The rotation budget is the
/// executor's concern; an exhausted budget downgrades `Rotate` to
/// `FailTerminal` there.
pub fn classify(outcome: &HandlerOutcome) -> RecoveryAction {
    match outcome {
        HandlerOutcome::Success { .. } => RecoveryAction::Commit,
        HandlerOutcome::Collision { .. } => RecoveryAction::FailTerminal,
        HandlerOutcome::HandlerError { .. } => RecoveryAction::FailTerminal,
        HandlerOutcome::SessionBlocked { .. } => RecoveryAction::Rotate,
        HandlerOutcome::Interrupted { .. } => RecoveryAction::Skip,
        HandlerOutcome::InitFailed { .. } => RecoveryAction::FailTerminal,
    }
}

/// External handler pipeline (transport + parsing + artifact writes).
///
/// Implementations classify every expected failure into a
/// [`HandlerOutcome`]; `Err` is reserved for the unclassified/fatal class
/// that aborts the executor.
#[async_trait]
pub trait HandlerPipeline: Send + Sync {
    async fn execute(&self, context: &mut RequestContext) -> Result<HandlerOutcome, FatalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::session::pool::{PoolConfig, SessionPool};
    use url::Url;

    fn lease() -> SessionLease {
        let pool = SessionPool::from_identities(
            vec![Identity::new(5, "http://p:1", "agent-5")
                .with_cookies(HashMap::from([("a".into(), "1".into())]))],
            PoolConfig::default(),
        );
        pool.try_acquire().unwrap().unwrap()
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify(&HandlerOutcome::success()), RecoveryAction::Commit);
        assert_eq!(
            classify(&HandlerOutcome::Collision { reason: "dup".into() }),
            RecoveryAction::FailTerminal
        );
        assert_eq!(
            classify(&HandlerOutcome::HandlerError { message: "parse".into() }),
            RecoveryAction::FailTerminal
        );
        assert_eq!(
            classify(&HandlerOutcome::SessionBlocked { reason: "403".into() }),
            RecoveryAction::Rotate
        );
        assert_eq!(
            classify(&HandlerOutcome::Interrupted { reason: "robots".into() }),
            RecoveryAction::Skip
        );
        assert_eq!(
            classify(&HandlerOutcome::InitFailed { message: "tls".into() }),
            RecoveryAction::FailTerminal
        );
    }

    #[test]
    fn prepares_identity_headers() {
        let unit = RequestUnit::work(Url::parse("https://example.com/").unwrap());
        let context = RequestContext::new(unit, lease(), None).unwrap();

        assert_eq!(context.headers.get(USER_AGENT).unwrap(), "agent-5");
        assert_eq!(context.headers.get(COOKIE).unwrap(), "a=1");
        assert_eq!(context.headers.get(PHASE_HEADER).unwrap(), "FINAL");
    }

    #[test]
    fn warmups_always_dispatch_as_discovery() {
        let unit = RequestUnit::work(Url::parse("https://example.com/").unwrap());
        let mut unit = unit;
        unit.work_type = WorkType::BeforeStart;
        let context = RequestContext::new(unit, lease(), None).unwrap();

        assert!(context.is_in_discovery_phase());
        assert_eq!(context.headers.get(PHASE_HEADER).unwrap(), "DISCOVERY");
    }

    #[test]
    fn phase_operations_reach_the_session() {
        let unit = RequestUnit::work(Url::parse("https://example.com/").unwrap());
        let context = RequestContext::new(unit, lease(), None).unwrap();

        assert_eq!(context.phase(), Phase::Final);
        context.continue_discovery();
        assert!(context.is_in_discovery_phase());
        context.finalize_discovery();
        assert_eq!(context.phase(), Phase::Final);
    }
}
