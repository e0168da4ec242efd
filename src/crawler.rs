//! High level crawl orchestration.
//!
//! Wires the identity store, session pool, work queue, proxy resolution, and
//! the handler pipeline into a single entry point: load identities, expand
//! and seed the work, run a set of executor workers over the shared queue,
//! then write the mutated identities back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::execution::executor::{ExecutorConfig, ExecutorError, ExecutorReport, RequestExecutor};
use crate::execution::pipeline::HandlerPipeline;
use crate::execution::queue::{InMemoryWorkQueue, QueueError, WorkQueue};
use crate::execution::unit::{RequestUnit, expand_units};
use crate::identity::{Identity, IdentityStore, IdentityStoreError};
use crate::proxy::{IdentityProxyResolver, ProxyResolver};
use crate::session::pool::{PoolConfig, SessionPool};
use crate::stats::{RunStats, StatsSink, StatsSnapshot};

/// Result alias used across the orchestration layer.
pub type CrawlerResult<T> = Result<T, CrawlerError>;

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("identity store error: {0}")]
    Identity(#[from] IdentityStoreError),
    #[error("no identities available to build the session pool")]
    NoIdentities,
    #[error("no handler pipeline configured")]
    MissingPipeline,
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("worker panicked: {0}")]
    Worker(String),
}

/// Crawl configuration used by the builder.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Minimum rest between two uses of the same session.
    pub cooldown: Duration,
    /// Base pacing delay between dispatch and hand-off, jittered per request.
    pub wait_between_requests: Option<Duration>,
    /// Rotation budget per unit before it fails terminally.
    pub max_session_rotations: u32,
    /// Number of executor workers sharing the queue.
    pub concurrency: usize,
    /// Timeout per queue operation.
    pub op_timeout: Duration,
    /// Total wait budget for one session acquisition.
    pub acquire_timeout: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            wait_between_requests: Some(Duration::from_secs(3)),
            max_session_rotations: 2,
            concurrency: 1,
            op_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Final report of one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub done: u64,
    pub reclaimed: u64,
    pub failed: u64,
    /// Sessions still usable when the run ended.
    pub surviving_sessions: usize,
    pub stats: StatsSnapshot,
}

/// Fluent builder for [`Crawler`].
pub struct CrawlerBuilder {
    config: CrawlerConfig,
    identities: Vec<Identity>,
    store: Option<Arc<dyn IdentityStore>>,
    queue: Option<Arc<dyn WorkQueue>>,
    pipeline: Option<Arc<dyn HandlerPipeline>>,
    proxies: Option<Arc<dyn ProxyResolver>>,
    stats: Option<Arc<dyn StatsSink>>,
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self {
            config: CrawlerConfig::default(),
            identities: Vec::new(),
            store: None,
            queue: None,
            pipeline: None,
            proxies: None,
            stats: None,
        }
    }

    pub fn with_config(mut self, config: CrawlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Inline identity list, used when no store is configured.
    pub fn with_identities(mut self, identities: Vec<Identity>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_identity_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn HandlerPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_proxy_resolver(mut self, proxies: Arc<dyn ProxyResolver>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    /// Additional sink notified alongside the built-in run counters.
    pub fn with_stats_sink(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn with_wait_between_requests(mut self, wait: Option<Duration>) -> Self {
        self.config.wait_between_requests = wait;
        self
    }

    pub fn with_max_session_rotations(mut self, budget: u32) -> Self {
        self.config.max_session_rotations = budget;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.config.concurrency = workers.max(1);
        self
    }

    pub fn build(self) -> CrawlerResult<Crawler> {
        let pipeline = self.pipeline.ok_or(CrawlerError::MissingPipeline)?;
        Ok(Crawler {
            config: self.config,
            identities: self.identities,
            store: self.store,
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(InMemoryWorkQueue::new())),
            pipeline,
            proxies: self.proxies,
            stats: self.stats,
        })
    }
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards lifecycle events to every registered sink.
struct FanoutSink(Vec<Arc<dyn StatsSink>>);

impl StatsSink for FanoutSink {
    fn record_start(&self, unit_key: &str) {
        for sink in &self.0 {
            sink.record_start(unit_key);
        }
    }

    fn record_finish(&self, unit_key: &str) {
        for sink in &self.0 {
            sink.record_finish(unit_key);
        }
    }

    fn record_failure(&self, unit_key: &str) {
        for sink in &self.0 {
            sink.record_failure(unit_key);
        }
    }
}

/// One-shot crawl orchestrator.
pub struct Crawler {
    config: CrawlerConfig,
    identities: Vec<Identity>,
    store: Option<Arc<dyn IdentityStore>>,
    queue: Arc<dyn WorkQueue>,
    pipeline: Arc<dyn HandlerPipeline>,
    proxies: Option<Arc<dyn ProxyResolver>>,
    stats: Option<Arc<dyn StatsSink>>,
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("config", &self.config)
            .field("identities", &self.identities)
            .finish_non_exhaustive()
    }
}

impl Crawler {
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }

    /// Run the submitted work to completion.
    ///
    /// Warm-up URLs are expanded into one pinned visit per identity and
    /// dispatched ahead of the work units. The run ends when the queue drains
    /// or a worker hits a fatal error; either way the mutated identities are
    /// written back to the store before returning.
    pub async fn run(
        &self,
        work: Vec<RequestUnit>,
        warmup_urls: &[Url],
    ) -> CrawlerResult<CrawlReport> {
        let identities = match &self.store {
            Some(store) => store.load().await?,
            None => self.identities.clone(),
        };
        if identities.is_empty() {
            return Err(CrawlerError::NoIdentities);
        }
        log::info!("starting run with {} identities", identities.len());

        let pool = SessionPool::from_identities(
            identities.clone(),
            PoolConfig {
                cooldown: self.config.cooldown,
                acquire_timeout: self.config.acquire_timeout,
                ..PoolConfig::default()
            },
        );
        let proxies = self
            .proxies
            .clone()
            .unwrap_or_else(|| Arc::new(IdentityProxyResolver::from_identities(&identities)));

        let run_stats = RunStats::new();
        let stats: Arc<dyn StatsSink> = match &self.stats {
            Some(extra) => Arc::new(FanoutSink(vec![
                Arc::new(run_stats.clone()),
                Arc::clone(extra),
            ])),
            None => Arc::new(run_stats.clone()),
        };

        // Seed the queue. Reclaim doubles as the insert operation so external
        // queue backends need no separate enqueue surface.
        let units = expand_units(work, warmup_urls, &identities);
        log::info!("seeding {} units", units.len());
        for unit in units {
            self.queue.reclaim(unit).await?;
        }

        let executor = RequestExecutor::new(
            pool.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.pipeline),
            proxies,
            stats,
            ExecutorConfig {
                max_session_rotations: self.config.max_session_rotations,
                op_timeout: self.config.op_timeout,
                wait_between_requests: self.config.wait_between_requests,
                ..ExecutorConfig::default()
            },
        );

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for _ in 0..self.config.concurrency.max(1) {
            let worker = executor.clone();
            handles.push(tokio::spawn(async move { worker.run().await }));
        }

        let mut report = ExecutorReport::default();
        let mut first_error: Option<CrawlerError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(worker_report)) => {
                    report.done += worker_report.done;
                    report.reclaimed += worker_report.reclaimed;
                    report.failed += worker_report.failed;
                }
                Ok(Err(err)) => {
                    first_error.get_or_insert(err.into());
                }
                Err(join_err) => {
                    first_error.get_or_insert(CrawlerError::Worker(join_err.to_string()));
                }
            }
        }

        // Identities carry freshly earned cookies; write them back even when
        // the run failed.
        if let Some(store) = &self.store {
            store.save(pool.snapshot_identities()).await?;
        }
        self.queue.discard().await?;

        if let Some(err) = first_error {
            log::error!("run aborted: {err}");
            return Err(err);
        }

        let report = CrawlReport {
            done: report.done,
            reclaimed: report.reclaimed,
            failed: report.failed,
            surviving_sessions: pool.selectable_len(),
            stats: run_stats.snapshot(),
        };
        log::info!(
            "run finished: {} done, {} failed, {} sessions surviving",
            report.done,
            report.failed,
            report.surviving_sessions
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::pipeline::{FatalError, HandlerOutcome, RequestContext};
    use async_trait::async_trait;

    struct OkPipeline;

    #[async_trait]
    impl HandlerPipeline for OkPipeline {
        async fn execute(
            &self,
            _context: &mut RequestContext,
        ) -> Result<HandlerOutcome, FatalError> {
            Ok(HandlerOutcome::success())
        }
    }

    fn identities(n: u64) -> Vec<Identity> {
        (0..n)
            .map(|i| Identity::new(i, format!("http://10.0.0.{i}:1"), format!("agent-{i}")))
            .collect()
    }

    fn quick_config() -> CrawlerConfig {
        CrawlerConfig {
            cooldown: Duration::ZERO,
            wait_between_requests: None,
            ..CrawlerConfig::default()
        }
    }

    #[test]
    fn build_requires_a_pipeline() {
        let err = Crawler::builder()
            .with_identities(identities(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, CrawlerError::MissingPipeline));
    }

    #[tokio::test]
    async fn run_requires_identities() {
        let crawler = Crawler::builder()
            .with_pipeline(Arc::new(OkPipeline))
            .build()
            .unwrap();
        let err = crawler.run(Vec::new(), &[]).await.unwrap_err();
        assert!(matches!(err, CrawlerError::NoIdentities));
    }

    #[tokio::test(start_paused = true)]
    async fn run_processes_work_and_warmups() {
        let crawler = Crawler::builder()
            .with_identities(identities(2))
            .with_pipeline(Arc::new(OkPipeline))
            .with_config(quick_config())
            .build()
            .unwrap();

        let work = vec![
            RequestUnit::work(Url::parse("https://example.com/1").unwrap()),
            RequestUnit::work(Url::parse("https://example.com/2").unwrap()),
        ];
        let warmups = [Url::parse("https://example.com/").unwrap()];

        let report = crawler.run(work, &warmups).await.unwrap();

        // 2 warm-ups (one per identity) + 2 work units.
        assert_eq!(report.done, 4);
        assert_eq!(report.failed, 0);
        assert_eq!(report.surviving_sessions, 2);
        assert_eq!(report.stats.finished, 4);
    }
}
