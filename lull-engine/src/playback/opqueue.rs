//! Bounded serial queue for user operations.
//!
//! One worker task drains three priority lanes — user-interactive first,
//! then high, then normal — so a pause lands ahead of queued housekeeping.
//! Each lane is a bounded channel; when a lane is full, enqueueing applies
//! backpressure rather than dropping the operation, because losing a pause
//! or stop would break the facade's invariants.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Default per-lane depth.
pub const DEFAULT_DEPTH: usize = 3;

/// Operation priorities, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPriority {
    /// Pause, stop: the user hears the delay
    UserInteractive,
    /// Skips and transitions
    High,
    /// Resume and everything else
    Normal,
}

struct QueuedOp {
    label: &'static str,
    fut: BoxFuture<'static, ()>,
}

/// Serial executor with three priority lanes.
pub struct OperationQueue {
    user_tx: mpsc::Sender<QueuedOp>,
    high_tx: mpsc::Sender<QueuedOp>,
    normal_tx: mpsc::Sender<QueuedOp>,
}

impl OperationQueue {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        let (user_tx, mut user_rx) = mpsc::channel::<QueuedOp>(depth);
        let (high_tx, mut high_rx) = mpsc::channel::<QueuedOp>(depth);
        let (normal_tx, mut normal_rx) = mpsc::channel::<QueuedOp>(depth);

        tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    biased;
                    Some(op) = user_rx.recv() => Some(op),
                    Some(op) = high_rx.recv() => Some(op),
                    Some(op) = normal_rx.recv() => Some(op),
                    else => None,
                };
                match op {
                    Some(op) => {
                        debug!(label = op.label, "operation dispatched");
                        op.fut.await;
                    }
                    None => break,
                }
            }
            debug!("operation queue drained and closed");
        });

        Self {
            user_tx,
            high_tx,
            normal_tx,
        }
    }

    fn lane(&self, priority: OpPriority) -> &mpsc::Sender<QueuedOp> {
        match priority {
            OpPriority::UserInteractive => &self.user_tx,
            OpPriority::High => &self.high_tx,
            OpPriority::Normal => &self.normal_tx,
        }
    }

    /// Enqueue a fire-and-forget operation; awaits lane capacity.
    pub async fn enqueue<F>(&self, priority: OpPriority, label: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let op = QueuedOp {
            label,
            fut: fut.boxed(),
        };
        if self.lane(priority).send(op).await.is_err() {
            warn!(label, "operation queue closed, op dropped");
        }
    }

    /// Enqueue an operation and await its result. `None` means the queue
    /// shut down before the operation ran.
    pub async fn submit<T, F>(&self, priority: OpPriority, label: &'static str, fut: F) -> Option<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(priority, label, async move {
            let _ = tx.send(fut.await);
        })
        .await;
        rx.await.ok()
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_submit_returns_value() {
        let queue = OperationQueue::new(3);
        let result = queue
            .submit(OpPriority::Normal, "answer", async { 41 + 1 })
            .await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_operations_run_serially_in_order() {
        let queue = OperationQueue::new(8);
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = Arc::clone(&log);
            queue
                .enqueue(OpPriority::Normal, "record", async move {
                    log.lock().await.push(i);
                })
                .await;
        }

        // Flush by submitting a final op on the same lane
        queue.submit(OpPriority::Normal, "flush", async {}).await;
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_user_interactive_preempts_queued_normal() {
        let queue = OperationQueue::new(8);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());

        // A blocker op keeps the worker busy while we stack the lanes
        let gate_clone = Arc::clone(&gate);
        queue
            .enqueue(OpPriority::Normal, "blocker", async move {
                gate_clone.notified().await;
            })
            .await;

        let o = Arc::clone(&order);
        queue
            .enqueue(OpPriority::Normal, "normal", async move {
                o.lock().await.push("normal");
            })
            .await;
        let o = Arc::clone(&order);
        queue
            .enqueue(OpPriority::UserInteractive, "pause", async move {
                o.lock().await.push("pause");
            })
            .await;

        gate.notify_one();
        queue.submit(OpPriority::Normal, "flush", async {}).await;

        assert_eq!(*order.lock().await, vec!["pause", "normal"]);
    }

    #[tokio::test]
    async fn test_bounded_lane_applies_backpressure() {
        let queue = OperationQueue::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        // Fill beyond the depth; sends await capacity but all complete
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            queue
                .enqueue(OpPriority::Normal, "tick", async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        queue.submit(OpPriority::Normal, "flush", async {}).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
