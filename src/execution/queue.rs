//! Work queue abstraction and the default in-process implementation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use super::unit::RequestUnit;

/// Error surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// External work queue the executor pulls from.
///
/// `fetch_next` returning `Ok(None)` signals the queue is drained and the
/// executor should stop. Reclaimed units must become fetchable again.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn fetch_next(&self) -> Result<Option<RequestUnit>, QueueError>;

    async fn mark_handled(&self, unit: &RequestUnit) -> Result<(), QueueError>;

    /// Push a unit back for another attempt.
    async fn reclaim(&self, unit: RequestUnit) -> Result<(), QueueError>;

    /// Discard the queue at run end.
    async fn discard(&self) -> Result<(), QueueError>;
}

/// FIFO queue living in process memory. Reclaimed units go to the back so
/// other work keeps flowing while a rotated unit waits for its next attempt.
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    inner: Arc<Mutex<VecDeque<RequestUnit>>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, units: impl IntoIterator<Item = RequestUnit>) {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        queue.extend(units);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn fetch_next(&self) -> Result<Option<RequestUnit>, QueueError> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        Ok(queue.pop_front())
    }

    async fn mark_handled(&self, _unit: &RequestUnit) -> Result<(), QueueError> {
        Ok(())
    }

    async fn reclaim(&self, unit: RequestUnit) -> Result<(), QueueError> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        queue.push_back(unit);
        Ok(())
    }

    async fn discard(&self) -> Result<(), QueueError> {
        let mut queue = self.inner.lock().expect("queue lock poisoned");
        queue.clear();
        Ok(())
    }
}
