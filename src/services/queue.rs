//! Queue seam between submission and the workers.
//!
//! The trait is deliberately minimal (enqueue / receive / complete) so the
//! backing technology is swappable. The in-memory implementation tracks
//! invoice ids from enqueue until completion, which gives the required
//! at-most-one-concurrent-attempt-per-invoice guarantee and makes duplicate
//! enqueues a no-op.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub invoice_id: String,
}

impl Job {
    pub fn new(invoice_id: impl Into<String>) -> Self {
        Job {
            invoice_id: invoice_id.into(),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns false when the invoice is already queued or in flight.
    fn enqueue(&self, job: Job) -> bool;

    /// Next job, or `None` once the queue is closed.
    async fn recv(&self) -> Option<Job>;

    /// Must be called exactly once per received job, success or failure;
    /// releases the invoice for future enqueues.
    fn complete(&self, invoice_id: &str);
}

pub struct InMemoryQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    tracked: Mutex<HashSet<String>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        InMemoryQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    fn enqueue(&self, job: Job) -> bool {
        let Ok(mut tracked) = self.tracked.lock() else {
            return false;
        };
        if !tracked.insert(job.invoice_id.clone()) {
            return false;
        }
        if self.tx.send(job.clone()).is_err() {
            tracked.remove(&job.invoice_id);
            return false;
        }
        true
    }

    async fn recv(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }

    fn complete(&self, invoice_id: &str) {
        if let Ok(mut tracked) = self.tracked.lock() {
            tracked.remove(invoice_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn duplicate_enqueue_is_suppressed_until_complete() {
        let queue = InMemoryQueue::new();
        assert!(queue.enqueue(Job::new("inv1")));
        assert!(!queue.enqueue(Job::new("inv1")));

        let job = queue.recv().await.unwrap();
        assert_eq!(job.invoice_id, "inv1");
        // Still tracked while in flight.
        assert!(!queue.enqueue(Job::new("inv1")));

        queue.complete("inv1");
        assert!(queue.enqueue(Job::new("inv1")));
    }

    #[tokio::test]
    async fn jobs_come_out_in_order() {
        let queue = InMemoryQueue::new();
        queue.enqueue(Job::new("a"));
        queue.enqueue(Job::new("b"));
        assert_eq!(queue.recv().await.unwrap().invoice_id, "a");
        assert_eq!(queue.recv().await.unwrap().invoice_id, "b");
        assert_eq!(queue.tracked_count(), 2);
    }
}
