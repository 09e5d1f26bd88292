//! Rollback engine.
//!
//! Failed executions are queued here and consumed by a single worker
//! task. A rollback is only considered done once a fresh position read
//! shows the target venue flat; closes are reduce-only market orders
//! sized from the observed position, retried with exponential backoff.
//! A rollback that exhausts its retries leaves a naked leg and raises a
//! critical alert instead of failing silently.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::RollbackConfig;
use crate::events::EventBus;
use crate::execution::state::{ExecutionState, ExecutionStats, TradeExecution};
use crate::models::{TradeStatus, Venue};
use crate::store::{TradePatch, TradeStore};
use crate::venues::{position_for, VenueAdapter};

/// Position sizes at or below this are treated as flat inside execution
/// and rollback flows.
pub const EXECUTION_DUST_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 1e-8

/// One queued rollback: close whatever is open on `venues` for the
/// execution's symbol.
#[derive(Debug)]
pub struct RollbackJob {
    pub execution: TradeExecution,
    pub venues: Vec<Venue>,
    pub reason: String,
}

impl RollbackJob {
    /// Derive the close targets from which legs filled: a lone maker fill
    /// closes on the maker venue, a lone hedge fill on the hedge venue.
    /// Both-filled jobs (bad entry spread) flatten both venues.
    pub fn from_execution(execution: TradeExecution, reason: &str) -> Self {
        let venues = if execution.maker_filled && execution.hedge_filled {
            vec![execution.maker_venue, execution.hedge_venue()]
        } else if execution.maker_filled {
            vec![execution.maker_venue]
        } else if execution.hedge_filled {
            vec![execution.hedge_venue()]
        } else {
            Vec::new()
        };
        Self {
            execution,
            venues,
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RollbackHandle {
    tx: mpsc::Sender<RollbackJob>,
    stats: Arc<ExecutionStats>,
}

impl RollbackHandle {
    /// Enqueue for background processing. Returns false when the queue is
    /// full or the worker is gone, which callers must treat as a critical
    /// condition.
    pub async fn enqueue(&self, mut job: RollbackJob) -> bool {
        job.execution.state = ExecutionState::RollbackQueued;
        ExecutionStats::bump(&self.stats.rollbacks_triggered);
        self.stats.pending_rollbacks.fetch_add(1, Ordering::Relaxed);
        info!(
            symbol = %job.execution.symbol,
            reason = %job.reason,
            targets = ?job.venues,
            "rollback queued"
        );
        if self.tx.send(job).await.is_err() {
            self.stats.pending_rollbacks.fetch_sub(1, Ordering::Relaxed);
            error!("rollback queue closed, job dropped");
            return false;
        }
        true
    }
}

pub struct RollbackEngine {
    venues: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<dyn TradeStore>,
    bus: EventBus,
    cfg: RollbackConfig,
    stats: Arc<ExecutionStats>,
}

impl RollbackEngine {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        store: Arc<dyn TradeStore>,
        bus: EventBus,
        cfg: RollbackConfig,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        let mut venues: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(Venue::VenueA, venue_a);
        venues.insert(Venue::VenueB, venue_b);
        Self {
            venues,
            store,
            bus,
            cfg,
            stats,
        }
    }

    /// Start the worker; the handle feeds it, dropping all handles drains
    /// and stops it.
    pub fn start(self) -> (RollbackHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);
        let handle = RollbackHandle {
            tx,
            stats: self.stats.clone(),
        };
        let worker = tokio::spawn(self.worker_loop(rx));
        (handle, worker)
    }

    async fn worker_loop(self, mut rx: mpsc::Receiver<RollbackJob>) {
        info!("rollback worker running");
        while let Some(mut job) = rx.recv().await {
            job.execution.state = ExecutionState::RollbackInProgress;
            let symbol = job.execution.symbol.clone();

            let done = self.run_with_retry(&mut job).await;
            self.stats.pending_rollbacks.fetch_sub(1, Ordering::Relaxed);

            if done {
                job.execution.state = ExecutionState::RollbackDone;
                ExecutionStats::bump(&self.stats.rollbacks_successful);
                self.persist_outcome(&job, true).await;
                info!(symbol = %symbol, attempts = job.execution.rollback_attempts, "✅ rollback complete");
            } else {
                job.execution.state = ExecutionState::RollbackFailed;
                ExecutionStats::bump(&self.stats.rollbacks_failed);
                self.persist_outcome(&job, false).await;
                error!(
                    symbol = %symbol,
                    "🚨 ROLLBACK FAILED after {} attempts: naked leg, manual intervention required",
                    self.cfg.max_attempts
                );
                self.bus.critical(
                    format!("rollback failed for {symbol}: naked leg"),
                    serde_json::json!({
                        "symbol": symbol,
                        "reason": job.reason,
                        "attempts": self.cfg.max_attempts,
                    }),
                );
            }
        }
        info!("rollback worker drained and stopped");
    }

    async fn run_with_retry(&self, job: &mut RollbackJob) -> bool {
        let symbol = job.execution.symbol.clone();

        if job.venues.is_empty() {
            // Nothing filled: nothing to close.
            info!(symbol = %symbol, "rollback with no filled legs, trivially done");
            return true;
        }

        warn!(
            symbol = %symbol,
            maker_filled = job.execution.maker_filled,
            hedge_filled = job.execution.hedge_filled,
            reason = %job.reason,
            "🔄 rollback started"
        );

        // Let in-flight orders land before reading positions.
        sleep(Duration::from_secs_f64(self.cfg.settle_delay_seconds)).await;

        for attempt in 0..self.cfg.max_attempts {
            job.execution.rollback_attempts = attempt + 1;
            if attempt > 0 {
                let delay = self.cfg.base_delay_seconds * f64::powi(2.0, attempt as i32);
                warn!(
                    symbol = %symbol,
                    attempt = attempt + 1,
                    delay_secs = delay,
                    "rollback retry after backoff"
                );
                sleep(Duration::from_secs_f64(delay)).await;
            }

            match self.close_targets(job).await {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(e) => {
                    error!(symbol = %symbol, attempt = attempt + 1, error = %e, "rollback attempt errored");
                }
            }
        }
        false
    }

    /// One pass over the target venues. Returns Ok(true) when every
    /// target verified flat.
    async fn close_targets(&self, job: &RollbackJob) -> anyhow::Result<bool> {
        let symbol = &job.execution.symbol;
        let mut all_flat = true;

        for venue in &job.venues {
            let adapter = &self.venues[venue];

            let position = position_for(adapter, symbol).await?;
            let Some(pos) = position.filter(|p| p.abs_size() > EXECUTION_DUST_EPSILON) else {
                info!(symbol, %venue, "no position on venue, nothing to close");
                continue;
            };

            let notional = pos.abs_size() * pos.mark_price;
            warn!(
                symbol,
                %venue,
                size = %pos.signed_size,
                notional = %notional,
                "closing leg with reduce-only market order"
            );
            adapter
                .close_position(symbol, pos.side(), notional)
                .await
                .map_err(|e| anyhow::anyhow!("close on {venue} failed: {e}"))?;

            sleep(Duration::from_secs_f64(self.cfg.verify_delay_seconds)).await;

            let remaining = position_for(adapter, symbol).await?;
            match remaining {
                Some(p) if p.abs_size() > EXECUTION_DUST_EPSILON => {
                    warn!(symbol, %venue, remaining = %p.signed_size, "position still open after close");
                    all_flat = false;
                }
                _ => info!(symbol, %venue, "leg verified flat"),
            }
        }

        Ok(all_flat)
    }

    async fn persist_outcome(&self, job: &RollbackJob, success: bool) {
        let trade_id = &job.execution.trade_id;
        if trade_id.is_empty() {
            return;
        }
        let (status, state, reason) = if success {
            (
                TradeStatus::Closed,
                ExecutionState::RollbackDone,
                job.reason.clone(),
            )
        } else {
            (
                TradeStatus::Failed,
                ExecutionState::RollbackFailed,
                "rollback_failed".to_string(),
            )
        };
        let patch = TradePatch {
            status: Some(status),
            execution_state: Some(state.as_str().to_string()),
            close_reason: Some(reason),
            closed_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_trade(trade_id, patch).await {
            error!(trade_id, error = %e, "failed to persist rollback outcome");
        }
    }
}
