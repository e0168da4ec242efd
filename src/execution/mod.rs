//! Request execution: work units, the queue boundary, the handler pipeline
//! contract, and the executor driving them.

pub mod executor;
pub mod pipeline;
pub mod queue;
pub mod unit;

pub use executor::{ExecutorConfig, ExecutorError, ExecutorReport, RequestExecutor, UnitDisposition};
pub use pipeline::{
    FatalError, HandlerOutcome, HandlerPipeline, InvalidHeader, PHASE_HEADER, RecoveryAction,
    RequestContext, classify,
};
pub use queue::{InMemoryWorkQueue, QueueError, WorkQueue};
pub use unit::{RequestUnit, WARMUP_LABEL, WorkType, expand_units};
