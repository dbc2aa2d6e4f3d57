//! Write-behind persistence queue.
//!
//! Ledger mutations are applied in memory and enqueued here while the
//! ledger's lock is still held, so the queue carries snapshots in mutation
//! order. A single background task drains it into the durable `Ledger`. Failed writes are logged and counted, never surfaced
//! to the caller. `flush` lets tests and shutdown wait for the queue to
//! drain.

use crate::model::{Order, Position, Strategy};
use crate::persistence::Ledger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

enum Job {
    Strategy(Strategy),
    Order(Order),
    Position(Position),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background persistence task. Cheap to clone.
#[derive(Clone)]
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<Job>,
    failures: Arc<AtomicU64>,
}

impl WriteBehind {
    /// Spawn the drain task on the current tokio runtime.
    pub fn spawn(ledger: Arc<dyn Ledger>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let failures = Arc::new(AtomicU64::new(0));
        let failures_task = failures.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match &job {
                    Job::Strategy(s) => ledger.upsert_strategy(s).await,
                    Job::Order(o) => ledger.upsert_order(o).await,
                    Job::Position(p) => ledger.upsert_position(p).await,
                    Job::Flush(_) => Ok(()),
                };

                if let Err(e) = result {
                    failures_task.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Write-behind persistence failed");
                }

                if let Job::Flush(done) = job {
                    let _ = done.send(());
                }
            }
            debug!("Write-behind queue closed");
        });

        Self { tx, failures }
    }

    pub fn strategy(&self, strategy: Strategy) {
        self.enqueue(Job::Strategy(strategy));
    }

    pub fn order(&self, order: Order) {
        self.enqueue(Job::Order(order));
    }

    pub fn position(&self, position: Position) {
        self.enqueue(Job::Position(position));
    }

    fn enqueue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Write-behind queue is closed; dropping write");
        }
    }

    /// Wait until every write enqueued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of writes that failed or were dropped.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
