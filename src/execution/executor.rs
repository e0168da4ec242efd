//! The per-unit execution protocol.
//!
//! Pulls units from the work queue, resolves a session for each, hands off
//! to the external handler pipeline, classifies the outcome, and applies the
//! bounded retry/rotation policy. Each unit moves strictly through
//! enqueued → dispatched → {done, reclaimed, failed-terminal}; only the
//! unclassified/fatal error class aborts the run as a whole.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use super::pipeline::{
    FatalError, HandlerOutcome, HandlerPipeline, RecoveryAction, RequestContext, classify,
};
use super::queue::{QueueError, WorkQueue};
use super::unit::RequestUnit;
use crate::proxy::ProxyResolver;
use crate::session::pool::{PoolError, SessionClaim, SessionPool};
use crate::stats::StatsSink;

/// Retry and pacing knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum session rotations per unit before it is failed terminally.
    pub max_session_rotations: u32,
    /// Timeout applied to each queue operation (fetch, mark-handled, reclaim).
    pub op_timeout: Duration,
    /// Attempts per queue operation before surfacing a hard error.
    pub op_attempts: u32,
    /// Base pacing delay between dispatch and hand-off; the actual sleep is
    /// jittered to `uniform(base/2, base*1.5)` to emulate human cadence.
    pub wait_between_requests: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_session_rotations: 2,
            op_timeout: Duration::from_secs(5),
            op_attempts: 3,
            wait_between_requests: None,
        }
    }
}

/// Run-aborting errors. Per-unit failures are handled locally and never show
/// up here.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("work queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("work queue unresponsive after {attempts} attempts")]
    QueueTimeout { attempts: u32 },
    #[error("session pool gave out: {0}")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Terminal state of one processed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitDisposition {
    /// Handled; result committed or deliberately skipped.
    Done,
    /// Requeued for another attempt.
    Reclaimed,
    /// Handled as a terminal failure.
    FailedTerminal,
}

/// Counters accumulated over one executor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorReport {
    pub done: u64,
    pub reclaimed: u64,
    pub failed: u64,
}

/// Drives the work queue until it drains. Cloning yields a sibling worker
/// sharing the same pool, queue, collaborators, and abort flag.
#[derive(Clone)]
pub struct RequestExecutor {
    pool: SessionPool,
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<dyn HandlerPipeline>,
    proxies: Arc<dyn ProxyResolver>,
    stats: Arc<dyn StatsSink>,
    config: ExecutorConfig,
    abort: Arc<AtomicBool>,
}

impl RequestExecutor {
    pub fn new(
        pool: SessionPool,
        queue: Arc<dyn WorkQueue>,
        pipeline: Arc<dyn HandlerPipeline>,
        proxies: Arc<dyn ProxyResolver>,
        stats: Arc<dyn StatsSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            pipeline,
            proxies,
            stats,
            config,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process units until the queue drains or a fatal error aborts the run.
    pub async fn run(&self) -> Result<ExecutorReport, ExecutorError> {
        let mut report = ExecutorReport::default();
        loop {
            if self.abort.load(Ordering::SeqCst) {
                log::warn!("abort flagged by a sibling worker; stopping dispatch");
                return Ok(report);
            }

            let unit = match self.fetch_next().await {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(err) => {
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            };

            match self.process_unit(unit).await {
                Ok(UnitDisposition::Done) => report.done += 1,
                Ok(UnitDisposition::Reclaimed) => report.reclaimed += 1,
                Ok(UnitDisposition::FailedTerminal) => report.failed += 1,
                Err(err) => {
                    log::error!("aborting run in unknown state: {err}");
                    self.abort.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        Ok(report)
    }

    async fn process_unit(&self, unit: RequestUnit) -> Result<UnitDisposition, ExecutorError> {
        let key = unit.unique_key.clone();
        self.stats.record_start(&key);

        // Resolve a session: honour the sticky pin, otherwise draw a rested
        // one from the pool.
        let sticky_pin = unit.sticky_session_id.clone();
        let lease = match sticky_pin.as_deref() {
            Some(sticky) => match self.pool.claim(sticky) {
                SessionClaim::Granted(lease) => lease,
                SessionClaim::Busy => {
                    // Pinned session is held by another in-flight unit; try
                    // again later without consuming rotation budget.
                    log::debug!("session {sticky} busy, requeueing {key}");
                    return Ok(self.reclaim(unit, &key).await);
                }
                SessionClaim::Unavailable => {
                    log::error!("unit {key} pinned to unavailable session {sticky}");
                    return Ok(self.finish_failed(&unit, &key).await);
                }
            },
            None => match self.pool.acquire().await {
                Ok(lease) => lease,
                Err(err) => {
                    self.stats.record_failure(&key);
                    return Err(err.into());
                }
            },
        };

        let proxy = self.proxies.resolve(lease.session_id()).await;
        let unit_for_queue = unit.clone();
        let mut context = match RequestContext::new(unit, lease, proxy) {
            Ok(context) => context,
            Err(err) => {
                log::error!("failed to build context for {key}: {err}");
                return Ok(self.finish_failed(&unit_for_queue, &key).await);
            }
        };

        self.pace().await;

        let outcome = match self.pipeline.execute(&mut context).await {
            Ok(outcome) => outcome,
            Err(fatal) => return Err(fatal.into()),
        };

        match classify(&outcome) {
            RecoveryAction::Commit => {
                if let HandlerOutcome::Success { cookies } = outcome
                    && !cookies.is_empty()
                {
                    context.lease.merge_cookies(cookies);
                }
                if !self.mark_handled(&unit_for_queue).await {
                    self.stats.record_failure(&key);
                    return Ok(UnitDisposition::FailedTerminal);
                }
                self.stats.record_finish(&key);
                Ok(UnitDisposition::Done)
            }
            RecoveryAction::Skip => {
                log::debug!("unit {key} interrupted upstream, no result committed");
                if !self.mark_handled(&unit_for_queue).await {
                    self.stats.record_failure(&key);
                    return Ok(UnitDisposition::FailedTerminal);
                }
                self.stats.record_finish(&key);
                Ok(UnitDisposition::Done)
            }
            RecoveryAction::FailTerminal => {
                log::warn!("unit {key} failed terminally: {outcome:?}");
                Ok(self.finish_failed(&unit_for_queue, &key).await)
            }
            RecoveryAction::Rotate => {
                let RequestContext { mut unit, lease, .. } = context;
                let session_id = lease.session_id().to_string();

                if unit.session_rotation_count < self.config.max_session_rotations {
                    self.pool.retire(&session_id);
                    drop(lease);
                    unit.session_rotation_count += 1;
                    unit.sticky_session_id = None;
                    log::warn!(
                        "rotated unit {key} off session {session_id} \
                         (rotation {}/{})",
                        unit.session_rotation_count,
                        self.config.max_session_rotations,
                    );
                    Ok(self.reclaim(unit, &key).await)
                } else {
                    log::error!(
                        "rotation budget exhausted for {key} after {} rotations",
                        unit.session_rotation_count
                    );
                    drop(lease);
                    Ok(self.finish_failed(&unit, &key).await)
                }
            }
        }
    }

    /// Jittered pacing sleep between dispatch and hand-off.
    async fn pace(&self) {
        let Some(base) = self.config.wait_between_requests else {
            return;
        };
        let base_secs = base.as_secs_f64();
        if base_secs <= 0.0 {
            return;
        }
        let jittered = rand::thread_rng().gen_range((base_secs / 2.0)..=(base_secs * 1.5));
        sleep(Duration::from_secs_f64(jittered)).await;
    }

    async fn fetch_next(&self) -> Result<Option<RequestUnit>, ExecutorError> {
        for attempt in 1..=self.config.op_attempts {
            match timeout(self.config.op_timeout, self.queue.fetch_next()).await {
                Ok(result) => return Ok(result?),
                Err(_) => log::warn!("queue fetch timed out (attempt {attempt})"),
            }
        }
        Err(ExecutorError::QueueTimeout {
            attempts: self.config.op_attempts,
        })
    }

    /// Bounded-retry mark-handled. Exhaustion is terminal for the unit only.
    async fn mark_handled(&self, unit: &RequestUnit) -> bool {
        for attempt in 1..=self.config.op_attempts {
            match timeout(self.config.op_timeout, self.queue.mark_handled(unit)).await {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => log::warn!("mark-handled failed (attempt {attempt}): {err}"),
                Err(_) => log::warn!("mark-handled timed out (attempt {attempt})"),
            }
        }
        log::error!("giving up on mark-handled for {}", unit.unique_key);
        false
    }

    async fn reclaim(&self, unit: RequestUnit, key: &str) -> UnitDisposition {
        for attempt in 1..=self.config.op_attempts {
            let pending = unit.clone();
            match timeout(self.config.op_timeout, self.queue.reclaim(pending)).await {
                Ok(Ok(())) => return UnitDisposition::Reclaimed,
                Ok(Err(err)) => log::warn!("reclaim failed (attempt {attempt}): {err}"),
                Err(_) => log::warn!("reclaim timed out (attempt {attempt})"),
            }
        }
        log::error!("giving up on reclaim for {key}");
        self.finish_failed(&unit, key).await
    }

    async fn finish_failed(&self, unit: &RequestUnit, key: &str) -> UnitDisposition {
        self.mark_handled(unit).await;
        self.stats.record_failure(key);
        UnitDisposition::FailedTerminal
    }
}
