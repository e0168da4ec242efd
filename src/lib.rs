//! # greenroom
//!
//! Rested-identity session pool and retryable request execution core for
//! low-profile crawlers.
//!
//! Each crawl identity (proxy, fingerprint, user agent, cookie jar) is bound
//! 1:1 to a session. Sessions are handed out uniform-randomly among those
//! that have rested past a cooldown, never to two callers at once, and are
//! permanently retired when a target blocks them. Work units flow through a
//! queue into an executor that classifies every handler outcome and applies
//! a bounded rotate-and-retry policy before giving up on a unit.
//!
//! The transport itself is not part of this crate: callers plug in a
//! [`HandlerPipeline`] that performs the request and reports back a
//! classified [`HandlerOutcome`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use greenroom::{Crawler, Identity, RequestUnit};
//! use url::Url;
//!
//! # async fn example(pipeline: Arc<dyn greenroom::HandlerPipeline>) -> Result<(), Box<dyn std::error::Error>> {
//! let crawler = Crawler::builder()
//!     .with_identities(vec![Identity::new(0, "http://10.0.0.1:8080", "Mozilla/5.0")])
//!     .with_pipeline(pipeline)
//!     .build()?;
//!
//! let work = vec![RequestUnit::work(Url::parse("https://example.com/item/1")?)];
//! let report = crawler.run(work, &[]).await?;
//! println!("done: {}, failed: {}", report.done, report.failed);
//! # Ok(())
//! # }
//! ```

mod crawler;

pub mod execution;
pub mod identity;
pub mod proxy;
pub mod session;
pub mod stats;

pub use crate::crawler::{
    CrawlReport,
    Crawler,
    CrawlerBuilder,
    CrawlerConfig,
    CrawlerError,
    CrawlerResult,
};

pub use crate::execution::executor::{
    ExecutorConfig,
    ExecutorError,
    ExecutorReport,
    RequestExecutor,
    UnitDisposition,
};

pub use crate::execution::pipeline::{
    FatalError,
    HandlerOutcome,
    HandlerPipeline,
    InvalidHeader,
    PHASE_HEADER,
    RecoveryAction,
    RequestContext,
    classify,
};

pub use crate::execution::queue::{
    InMemoryWorkQueue,
    QueueError,
    WorkQueue,
};

pub use crate::execution::unit::{
    RequestUnit,
    WARMUP_LABEL,
    WorkType,
    expand_units,
};

pub use crate::identity::{
    Identity,
    IdentityStore,
    IdentityStoreError,
};

pub use crate::proxy::{
    IdentityProxyResolver,
    ProxyResolver,
};

pub use crate::session::pool::{
    PoolConfig,
    PoolError,
    SessionClaim,
    SessionLease,
    SessionPool,
};

pub use crate::session::{
    Phase,
    Session,
};

pub use crate::stats::{
    RunStats,
    StatsSink,
    StatsSnapshot,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
