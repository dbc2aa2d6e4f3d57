//! Periodic reconciliation and order-management passes.
//!
//! Each pass fans out one task per runnable strategy and waits for all of
//! them. A pass that is still running when its next tick fires causes that
//! tick to be skipped; ticks never queue up behind a slow pass. A failing
//! strategy is logged and does not affect the others.

use crate::error::Result;
use crate::exchange::BrokerClient;
use crate::model::{Strategy, TimeRange};
use crate::store::{StrategyLedger, Stores};
use crate::strategy::{GridEngine, OrderExecutor, RebalanceEngine, Reconciler};
use crate::utils::Clock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Every trading service, wired to one broker and one set of ledgers.
pub struct Engine {
    pub strategies: Arc<StrategyLedger>,
    pub reconciler: Reconciler,
    pub executor: Arc<OrderExecutor>,
    pub grid: GridEngine,
    pub rebalancer: RebalanceEngine,
}

impl Engine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        stores: &Stores,
        clock: Arc<dyn Clock>,
        session: TimeRange,
        lookback: chrono::Duration,
    ) -> Self {
        let executor = Arc::new(OrderExecutor::new(
            broker.clone(),
            stores.strategies.clone(),
            stores.orders.clone(),
            stores.positions.clone(),
            clock.clone(),
        ));
        Self {
            strategies: stores.strategies.clone(),
            reconciler: Reconciler::new(
                broker.clone(),
                stores.strategies.clone(),
                stores.orders.clone(),
                stores.positions.clone(),
                clock.clone(),
                lookback,
            ),
            grid: GridEngine::new(
                broker.clone(),
                stores.orders.clone(),
                executor.clone(),
                clock.clone(),
                session,
            ),
            rebalancer: RebalanceEngine::new(
                broker,
                stores.positions.clone(),
                executor.clone(),
                clock,
            ),
            executor,
        }
    }

    /// Fold broker state into the ledgers for one strategy.
    pub async fn reconcile(&self, strategy: &Strategy) -> Result<()> {
        self.reconciler.confirm(strategy).await?;
        self.reconciler.confirm_grid_end(strategy).await?;
        Ok(())
    }

    /// Run the order-management chain for one strategy; the first failing
    /// step ends the chain.
    pub async fn manage_orders(&self, strategy: &Strategy) -> Result<()> {
        self.executor.cancel_all(strategy).await?;
        self.executor.exit_all(strategy).await?;
        self.rebalancer.rebalance(strategy).await?;
        self.grid.leveling(strategy).await?;
        Ok(())
    }
}

/// What happened to one scheduled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The previous pass of the same kind was still running
    Skipped,
    Completed { strategies: usize, failures: usize },
}

/// Clears a running flag when the pass finishes, even if it panics.
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag.clone()))
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<Engine>,
    reconciling: Arc<AtomicBool>,
    managing: Arc<AtomicBool>,
    reconcile_interval: Duration,
    order_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, reconcile_interval: Duration, order_interval: Duration) -> Self {
        Self {
            engine,
            reconciling: Arc::new(AtomicBool::new(false)),
            managing: Arc::new(AtomicBool::new(false)),
            reconcile_interval,
            order_interval,
        }
    }

    pub async fn reconcile_pass(&self) -> PassOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.reconciling) else {
            warn!("Previous reconciliation pass still running, skipping tick");
            return PassOutcome::Skipped;
        };
        self.fan_out("reconcile", |engine, strategy| async move {
            engine.reconcile(&strategy).await
        })
        .await
    }

    pub async fn order_pass(&self) -> PassOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.managing) else {
            warn!("Previous order pass still running, skipping tick");
            return PassOutcome::Skipped;
        };
        self.fan_out("orders", |engine, strategy| async move {
            engine.manage_orders(&strategy).await
        })
        .await
    }

    async fn fan_out<F, Fut>(&self, pass: &'static str, task: F) -> PassOutcome
    where
        F: Fn(Arc<Engine>, Strategy) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let strategies = self.engine.strategies.runnable();
        let mut handles = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let code = strategy.code.clone();
            let handle = tokio::spawn(task(self.engine.clone(), strategy));
            handles.push((code, handle));
        }

        let total = handles.len();
        let mut failures = 0;
        for (code, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(strategy = %code, pass, error = %e, "Strategy pass failed");
                }
                Err(e) => {
                    failures += 1;
                    error!(strategy = %code, pass, error = %e, "Strategy task panicked");
                }
            }
        }

        debug!(pass, strategies = total, failures, "Pass complete");
        PassOutcome::Completed {
            strategies: total,
            failures,
        }
    }

    /// Drive both passes until `shutdown` is set, then wait for in-flight
    /// passes to finish.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut reconcile_tick = tokio::time::interval(self.reconcile_interval);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut order_tick = tokio::time::interval(self.order_interval);
        order_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            reconcile_secs = self.reconcile_interval.as_secs(),
            order_secs = self.order_interval.as_secs(),
            "Scheduler started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move { scheduler.reconcile_pass().await });
                }
                _ = order_tick.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move { scheduler.order_pass().await });
                }
            }
        }

        while self.reconciling.load(Ordering::SeqCst) || self.managing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Scheduler stopped");
    }
}
