//! Execution engine.
//!
//! Drives one hedged entry at a time per symbol: validate the book, rest
//! the maker leg, detect its fill (stream events with a polling fallback),
//! hedge the actual filled quantity with a taker order on the other venue,
//! and hand any one-sided outcome to the rollback worker. The cancel/fill
//! race around maker timeouts is resolved pessimistically: a position
//! check, an authoritative order-status read and a trade-history sweep all
//! run before an order is declared unfilled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionConfig, RollbackConfig, ValidatorPolicy};
use crate::events::{EngineEvent, EventBus};
use crate::execution::fills::FillWatcher;
use crate::execution::rollback::{RollbackEngine, RollbackHandle, RollbackJob, EXECUTION_DUST_EPSILON};
use crate::execution::sizing::align_common_quantity;
use crate::execution::state::{ExecutionState, ExecutionStats, StatsSnapshot, TradeExecution};
use crate::execution::validator::OrderbookValidator;
use crate::execution::ExecError;
use crate::models::{
    normalize_symbol, OrderKind, OrderRequest, OrderState, Side, TradeRecord, TradeStatus, Venue,
};
use crate::orderbook::OrderbookProvider;
use crate::store::{TradePatch, TradeStore};
use crate::venues::{position_for, VenueAdapter, VenueError};
use crate::volatility::VolatilityMonitor;

/// One hedged-entry request. The maker role is assigned per opportunity;
/// the hedge leg always runs on the other venue.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub maker_venue: Venue,
    pub maker_side: Side,
    pub hedge_side: Side,
    pub target_usd: Decimal,
    pub maker_price: Option<Decimal>,
    pub hedge_price: Option<Decimal>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct EntryOutcome {
    pub success: bool,
    pub trade_id: Option<String>,
    pub maker_order_id: Option<String>,
    pub hedge_order_id: Option<String>,
    pub error: Option<ExecError>,
}

impl EntryOutcome {
    fn failed(
        error: ExecError,
        trade_id: Option<String>,
        maker_order_id: Option<String>,
    ) -> Self {
        Self {
            success: false,
            trade_id,
            maker_order_id,
            hedge_order_id: None,
            error: Some(error),
        }
    }
}

struct EntrySuccess {
    trade_id: String,
    maker_order_id: String,
    hedge_order_id: String,
}

struct EntryFailure {
    error: ExecError,
    trade_id: Option<String>,
    maker_order_id: Option<String>,
}

impl EntryFailure {
    fn bare(error: ExecError) -> Self {
        Self {
            error,
            trade_id: None,
            maker_order_id: None,
        }
    }
}

struct MakerTimeoutOutcome {
    filled: bool,
    actual: Option<Decimal>,
    wait_more: bool,
}

impl MakerTimeoutOutcome {
    fn filled(actual: Decimal) -> Self {
        Self {
            filled: true,
            actual: Some(actual),
            wait_more: false,
        }
    }

    fn unfilled() -> Self {
        Self {
            filled: false,
            actual: None,
            wait_more: false,
        }
    }

    fn wait_more() -> Self {
        Self {
            filled: false,
            actual: None,
            wait_more: true,
        }
    }
}

enum RetryOutcome {
    Filled { order_id: String, actual: Decimal },
    NotFilled,
}

pub struct ExecutionEngine {
    venues: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<dyn TradeStore>,
    bus: EventBus,
    cfg: ExecutionConfig,
    rollback_cfg: RollbackConfig,
    validator: OrderbookValidator,
    provider: Arc<OrderbookProvider>,
    volatility: Arc<VolatilityMonitor>,
    fills: Arc<FillWatcher>,
    stats: Arc<ExecutionStats>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    active: Mutex<HashMap<String, ExecutionState>>,
    compliance_cache: Mutex<HashMap<String, (Instant, bool)>>,
    rollback: Mutex<Option<RollbackHandle>>,
    rollback_worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        store: Arc<dyn TradeStore>,
        bus: EventBus,
        cfg: ExecutionConfig,
        rollback_cfg: RollbackConfig,
        validator_policy: ValidatorPolicy,
    ) -> Arc<Self> {
        let provider = OrderbookProvider::new(
            venue_a.clone(),
            venue_b.clone(),
            validator_policy.post_reconnect_cooldown_seconds,
        );
        let mut venues: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(Venue::VenueA, venue_a);
        venues.insert(Venue::VenueB, venue_b);

        Arc::new(Self {
            venues,
            store,
            bus,
            cfg,
            rollback_cfg,
            validator: OrderbookValidator::new(validator_policy),
            provider,
            volatility: Arc::new(VolatilityMonitor::default()),
            fills: FillWatcher::new(),
            stats: Arc::new(ExecutionStats::default()),
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            compliance_cache: Mutex::new(HashMap::new()),
            rollback: Mutex::new(None),
            rollback_worker: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Register fill callbacks on both venues and start the rollback
    /// worker.
    pub fn start(self: &Arc<Self>) {
        for adapter in self.venues.values() {
            adapter.register_position_callback(self.fills.callback());
        }

        let engine = RollbackEngine::new(
            self.venues[&Venue::VenueA].clone(),
            self.venues[&Venue::VenueB].clone(),
            self.store.clone(),
            self.bus.clone(),
            self.rollback_cfg.clone(),
            self.stats.clone(),
        );
        let (handle, worker) = engine.start();
        *self.rollback.lock() = Some(handle);
        *self.rollback_worker.lock() = Some(worker);
        info!("✅ execution engine started");
    }

    /// Graceful shutdown: refuse new entries, give active executions the
    /// configured budget, force-flatten whatever remains, then drain the
    /// rollback queue.
    pub async fn stop(&self, force: bool) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(force, "🛑 execution engine stopping");

        if !force {
            let deadline = Instant::now() + Duration::from_secs_f64(self.cfg.graceful_timeout_seconds);
            while !self.active.lock().is_empty() && Instant::now() < deadline {
                sleep(Duration::from_millis(250)).await;
            }
        }

        let leftovers: Vec<String> = self.active.lock().keys().cloned().collect();
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "executions did not finish in time, force-flattening");
            self.force_flatten(&leftovers).await;
        }

        let handle = { self.rollback.lock().take() };
        drop(handle);
        let worker = { self.rollback_worker.lock().take() };
        if let Some(worker) = worker {
            if force {
                worker.abort();
            } else {
                let budget = Duration::from_secs_f64(self.cfg.graceful_timeout_seconds);
                if tokio::time::timeout(budget, worker).await.is_err() {
                    error!("rollback worker did not drain in time, abandoning queue");
                    self.bus.critical(
                        "rollback queue abandoned at shutdown",
                        serde_json::Value::Null,
                    );
                }
            }
        }

        for adapter in self.venues.values() {
            adapter.shutdown().await;
        }
        info!("✅ execution engine stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn provider(&self) -> Arc<OrderbookProvider> {
        self.provider.clone()
    }

    pub fn volatility(&self) -> Arc<VolatilityMonitor> {
        self.volatility.clone()
    }

    pub fn get_execution_stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.active.lock().clone())
    }

    fn venue(&self, venue: Venue) -> &Arc<dyn VenueAdapter> {
        &self.venues[&venue]
    }

    fn try_lock_symbol(&self, key: &str) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let lock = {
            self.locks
                .lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }

    fn fill_fraction(&self) -> Decimal {
        Decimal::from_f64(self.cfg.fill_match_fraction).unwrap_or_else(|| Decimal::new(95, 2))
    }

    fn transition(
        &self,
        exec: &mut TradeExecution,
        record: &mut TradeRecord,
        next: ExecutionState,
        details: serde_json::Value,
    ) {
        debug!(
            symbol = %exec.symbol,
            from = %exec.state,
            to = %next,
            "execution state transition"
        );
        exec.state = next;
        record.execution_state = next.as_str().to_string();
        record.push_event(next.as_str(), details);
        self.active
            .lock()
            .insert(normalize_symbol(&exec.symbol), next);
    }

    async fn persist(&self, record: &TradeRecord) {
        let patch = TradePatch {
            status: Some(record.status),
            execution_state: Some(record.execution_state.clone()),
            entry_price_a: Some(record.entry_price_a),
            entry_price_b: Some(record.entry_price_b),
            size_usd: Some(record.size_usd),
            opened_at: record.opened_at,
            closed_at: record.closed_at,
            realized_pnl: Some(record.realized_pnl),
            close_reason: record.close_reason.clone(),
            events: Some(record.events.clone()),
            metadata: if record.metadata.is_null() {
                None
            } else {
                Some(record.metadata.clone())
            },
        };
        if let Err(e) = self.store.update_trade(&record.trade_id, patch).await {
            error!(trade_id = %record.trade_id, error = %e, "failed to persist trade record");
        }
    }

    // ── Entry ───────────────────────────────────────────────────────────

    pub async fn execute_hedged_entry(&self, req: EntryRequest) -> EntryOutcome {
        if self.is_shutting_down() {
            return EntryOutcome::failed(ExecError::ShuttingDown, None, None);
        }

        let symbol_key = normalize_symbol(&req.symbol);
        let Some(guard) = self.try_lock_symbol(&symbol_key) else {
            debug!(symbol = %req.symbol, "entry rejected: symbol lock held");
            return EntryOutcome::failed(ExecError::Busy, None, None);
        };

        ExecutionStats::bump(&self.stats.total);
        self.active
            .lock()
            .insert(symbol_key.clone(), ExecutionState::Pending);

        info!(
            symbol = %req.symbol,
            maker = %req.maker_venue,
            maker_side = %req.maker_side,
            hedge_side = %req.hedge_side,
            target_usd = %req.target_usd,
            "🚀 hedged entry start"
        );

        let result = self.run_entry(&req).await;

        self.active.lock().remove(&symbol_key);
        self.fills.clear(req.maker_venue, &req.symbol);
        self.fills.clear(req.maker_venue.other(), &req.symbol);
        drop(guard);

        match result {
            Ok(success) => {
                ExecutionStats::bump(&self.stats.successful);
                info!(symbol = %req.symbol, trade_id = %success.trade_id, "✅ hedged entry complete");
                EntryOutcome {
                    success: true,
                    trade_id: Some(success.trade_id),
                    maker_order_id: Some(success.maker_order_id),
                    hedge_order_id: Some(success.hedge_order_id),
                    error: None,
                }
            }
            Err(failure) => {
                ExecutionStats::bump(&self.stats.failed);
                warn!(
                    symbol = %req.symbol,
                    error = %failure.error,
                    "hedged entry failed"
                );
                EntryOutcome::failed(failure.error, failure.trade_id, failure.maker_order_id)
            }
        }
    }

    async fn run_entry(&self, req: &EntryRequest) -> Result<EntrySuccess, EntryFailure> {
        let symbol = &req.symbol;
        let maker = self.venue(req.maker_venue).clone();
        let hedge = self.venue(req.maker_venue.other()).clone();

        // Pre-clean: stale resting orders on either venue poison both the
        // compliance check and the fill detection. Best-effort only.
        if let Err(e) = maker.cancel_all_orders(symbol).await {
            debug!(symbol, error = %e, "pre-clean cancel on maker venue failed");
        }
        if let Err(e) = hedge.cancel_all_orders(symbol).await {
            debug!(symbol, error = %e, "pre-clean cancel on hedge venue failed");
        }

        if !self
            .compliance_check(symbol, req.maker_venue, req.maker_side, req.hedge_side)
            .await
        {
            return Err(EntryFailure::bare(ExecError::SelfMatchRisk));
        }

        // Size alignment against both venues' lot grids.
        let (maker_info, hedge_info) =
            tokio::join!(maker.get_market_info(symbol), hedge.get_market_info(symbol));
        let maker_info = maker_info
            .map_err(|e| EntryFailure::bare(ExecError::Internal(format!("market info: {e}"))))?;
        let hedge_info = hedge_info
            .map_err(|e| EntryFailure::bare(ExecError::Internal(format!("market info: {e}"))))?;

        let reference_price = match req.maker_price {
            Some(px) if px > Decimal::ZERO => px,
            _ => maker.fetch_mark_price(symbol).await.map_err(|e| {
                EntryFailure::bare(ExecError::Internal(format!("no reference price: {e}")))
            })?,
        };
        if let Some(px) = reference_price.to_f64() {
            self.volatility.update_price(symbol, px);
        }

        let aligned = align_common_quantity(
            req.target_usd,
            reference_price,
            maker_info.lot_size,
            hedge_info.lot_size,
        )
        .ok_or_else(|| {
            EntryFailure::bare(ExecError::Internal(
                "aligned quantity is zero for target size".to_string(),
            ))
        })?;
        info!(
            symbol,
            target_usd = %req.target_usd,
            aligned_usd = %aligned.usd,
            coins = %aligned.coins,
            "⚖️ size aligned to common lot grid"
        );

        let (side_a, side_b) = match req.maker_venue {
            Venue::VenueA => (req.maker_side, req.hedge_side),
            Venue::VenueB => (req.hedge_side, req.maker_side),
        };
        let mut record = TradeRecord::new(symbol, side_a, side_b, aligned.usd);
        record.push_event(
            "CREATED",
            serde_json::json!({
                "maker_venue": req.maker_venue.as_str(),
                "planned_coins": aligned.coins.to_string(),
            }),
        );
        self.store.create_trade(&record).await.map_err(|e| {
            EntryFailure::bare(ExecError::Internal(format!("store create failed: {e}")))
        })?;
        let trade_id = record.trade_id.clone();

        let mut exec = TradeExecution::new(
            &trade_id,
            symbol,
            req.maker_venue,
            req.maker_side,
            req.hedge_side,
            aligned.usd,
            aligned.coins,
        );

        // Phase 0: orderbook quality gate on the maker venue.
        let validation = self
            .validator
            .validate_with_provider(
                &self.provider,
                req.maker_venue,
                symbol,
                req.maker_side,
                aligned.usd,
            )
            .await;
        if !validation.valid {
            record.status = TradeStatus::Rejected;
            record.close_reason = Some(validation.reason.clone());
            record.closed_at = Some(Utc::now());
            record.push_event(
                "REJECTED",
                serde_json::json!({"reason": validation.reason}),
            );
            self.persist(&record).await;
            return Err(EntryFailure {
                error: ExecError::OrderbookInvalid(validation.reason.clone()),
                trade_id: Some(trade_id),
                maker_order_id: None,
            });
        }

        // Phase 1: rest the maker leg.
        let maker_price = match req.maker_price {
            Some(px) => px,
            None => self
                .validator
                .recommended_price(
                    req.maker_side,
                    validation.best_bid,
                    validation.best_ask,
                    maker_info.tick_size,
                )
                .ok_or_else(|| EntryFailure {
                    error: ExecError::Internal("no book reference for maker price".to_string()),
                    trade_id: Some(trade_id.clone()),
                    maker_order_id: None,
                })?,
        };

        record.status = TradeStatus::Opening;
        self.transition(
            &mut exec,
            &mut record,
            ExecutionState::Leg1Sent,
            serde_json::json!({"price": maker_price.to_string()}),
        );
        self.persist(&record).await;

        // Arm the fill watch before placement: a fast fill must not race
        // past an unarmed notify.
        let notify = self.fills.watch(
            req.maker_venue,
            symbol,
            aligned.coins,
            self.fill_fraction(),
        );

        let maker_order = maker
            .place_order(&OrderRequest {
                symbol: symbol.clone(),
                side: req.maker_side,
                kind: OrderKind::LimitPostOnly,
                size_coins: aligned.coins,
                price: Some(maker_price),
                reduce_only: false,
            })
            .await;
        let maker_order = match maker_order {
            Ok(ack) => ack,
            Err(e) => {
                record.status = TradeStatus::Failed;
                record.close_reason = Some("leg1_place_failed".to_string());
                record.closed_at = Some(Utc::now());
                self.transition(
                    &mut exec,
                    &mut record,
                    ExecutionState::Failed,
                    serde_json::json!({"error": e.to_string()}),
                );
                self.persist(&record).await;
                return Err(EntryFailure {
                    error: ExecError::Leg1PlaceFailed(e.to_string()),
                    trade_id: Some(trade_id),
                    maker_order_id: None,
                });
            }
        };
        exec.maker_order_id = Some(maker_order.order_id.clone());
        info!(symbol, order_id = %maker_order.order_id, price = %maker_price, "📤 maker leg resting");

        // Phase 1.5: wait for the maker fill under a liquidity- and
        // volatility-scaled timeout.
        let timeout = req.timeout.unwrap_or_else(|| {
            self.dynamic_timeout(
                symbol,
                validation.same_side_depth_usd(req.maker_side),
                aligned.usd,
            )
        });
        info!(symbol, timeout_secs = timeout.as_secs_f64(), "⏳ waiting for maker fill");

        let mut actual = self
            .wait_for_maker_fill(req.maker_venue, symbol, aligned.coins, timeout, &notify)
            .await;

        if actual.is_none() {
            let mut outcome = self
                .handle_maker_timeout(
                    req.maker_venue,
                    symbol,
                    &maker_order.order_id,
                    aligned.coins,
                    hedge_info.min_order_size_coins,
                )
                .await;

            if outcome.wait_more {
                // Micro partial fill: cancelling now would strand a
                // position too small to hedge. Give it one more window.
                self.transition(
                    &mut exec,
                    &mut record,
                    ExecutionState::PartialFill,
                    serde_json::json!({"below_hedge_min": hedge_info.min_order_size_coins.to_string()}),
                );
                self.persist(&record).await;

                if self
                    .wait_for_maker_fill(req.maker_venue, symbol, aligned.coins, timeout, &notify)
                    .await
                    .is_none()
                {
                    outcome = self
                        .handle_maker_timeout(
                            req.maker_venue,
                            symbol,
                            &maker_order.order_id,
                            aligned.coins,
                            hedge_info.min_order_size_coins,
                        )
                        .await;
                } else {
                    outcome = MakerTimeoutOutcome::filled(aligned.coins);
                }

                if outcome.wait_more {
                    // Still a micro fill: abort and flatten the crumb.
                    self.abort_microfill(req.maker_venue, symbol, &maker_order.order_id)
                        .await;
                    record.status = TradeStatus::Failed;
                    record.close_reason = Some("micro_fill_abort".to_string());
                    record.closed_at = Some(Utc::now());
                    self.transition(
                        &mut exec,
                        &mut record,
                        ExecutionState::Failed,
                        serde_json::json!({"reason": "partial fill below hedge minimum"}),
                    );
                    self.persist(&record).await;
                    return Err(EntryFailure {
                        error: ExecError::Leg1Unfilled,
                        trade_id: Some(trade_id),
                        maker_order_id: Some(maker_order.order_id),
                    });
                }
            }

            if outcome.filled {
                actual = outcome.actual.or(Some(aligned.coins));
            } else {
                // Confirmed clean cancel: chase the price if retries are on.
                match self
                    .retry_maker_with_chase(
                        req.maker_venue,
                        symbol,
                        req.maker_side,
                        aligned.coins,
                        aligned.usd,
                        maker_info.tick_size,
                        &maker_order.order_id,
                    )
                    .await
                {
                    RetryOutcome::Filled {
                        order_id,
                        actual: size,
                    } => {
                        exec.maker_order_id = Some(order_id);
                        actual = Some(size);
                    }
                    RetryOutcome::NotFilled => {
                        record.status = TradeStatus::Failed;
                        record.close_reason = Some("leg1_unfilled".to_string());
                        record.closed_at = Some(Utc::now());
                        self.transition(
                            &mut exec,
                            &mut record,
                            ExecutionState::Failed,
                            serde_json::json!({"reason": "maker timeout, cancel confirmed"}),
                        );
                        self.persist(&record).await;
                        return Err(EntryFailure {
                            error: ExecError::Leg1Unfilled,
                            trade_id: Some(trade_id),
                            maker_order_id: Some(maker_order.order_id),
                        });
                    }
                }
            }
        }

        let actual = actual.unwrap_or(exec.planned_quantity_coins);
        exec.maker_filled = true;
        exec.actual_filled_quantity = actual;
        exec.entry_price_maker = maker_price;
        match req.maker_venue {
            Venue::VenueA => record.entry_price_a = maker_price,
            Venue::VenueB => record.entry_price_b = maker_price,
        }
        self.transition(
            &mut exec,
            &mut record,
            ExecutionState::Leg1Filled,
            serde_json::json!({"filled_coins": actual.to_string()}),
        );
        self.persist(&record).await;

        // Phase 2: hedge the ACTUAL filled quantity, never the plan.
        if actual < hedge_info.min_order_size_coins {
            error!(
                symbol,
                actual = %actual,
                hedge_min = %hedge_info.min_order_size_coins,
                "filled quantity below hedge minimum after fill confirmation"
            );
            self.abort_microfill(req.maker_venue, symbol, &maker_order.order_id)
                .await;
            record.status = TradeStatus::Failed;
            record.close_reason = Some("micro_fill_abort".to_string());
            record.closed_at = Some(Utc::now());
            self.transition(
                &mut exec,
                &mut record,
                ExecutionState::Failed,
                serde_json::json!({"reason": "fill below hedge minimum"}),
            );
            self.persist(&record).await;
            return Err(EntryFailure {
                error: ExecError::Leg1Unfilled,
                trade_id: Some(trade_id),
                maker_order_id: Some(maker_order.order_id),
            });
        }

        self.transition(
            &mut exec,
            &mut record,
            ExecutionState::Leg2Sent,
            serde_json::json!({"coins": actual.to_string()}),
        );
        self.persist(&record).await;

        let hedge_ack = hedge
            .place_order(&OrderRequest {
                symbol: symbol.clone(),
                side: req.hedge_side,
                kind: OrderKind::MarketIoc,
                size_coins: actual,
                price: req.hedge_price,
                reduce_only: false,
            })
            .await;

        let hedge_ack = match hedge_ack {
            Ok(ack) if !ack.filled_size.is_zero() => ack,
            Ok(ack) => {
                warn!(symbol, order_id = %ack.order_id, "hedge IOC returned no fill");
                return self
                    .queue_entry_rollback(
                        exec,
                        record,
                        "leg2_no_fill",
                        ExecError::Leg2PlaceFailed("hedge IOC returned no fill".to_string()),
                        maker_order.order_id,
                    )
                    .await;
            }
            Err(e) => {
                error!(symbol, error = %e, "❌ hedge placement failed, maker leg exposed");
                return self
                    .queue_entry_rollback(
                        exec,
                        record,
                        "leg2_place_failed",
                        ExecError::Leg2PlaceFailed(e.to_string()),
                        maker_order.order_id,
                    )
                    .await;
            }
        };

        exec.hedge_filled = true;
        exec.hedge_order_id = Some(hedge_ack.order_id.clone());
        let hedge_price = if hedge_ack.avg_fill_price > Decimal::ZERO {
            hedge_ack.avg_fill_price
        } else {
            hedge
                .fetch_mark_price(symbol)
                .await
                .unwrap_or(reference_price)
        };
        exec.entry_price_hedge = hedge_price;
        match req.maker_venue.other() {
            Venue::VenueA => record.entry_price_a = hedge_price,
            Venue::VenueB => record.entry_price_b = hedge_price,
        }

        // Let the hedge position reflect in the venue's feed.
        sleep(Duration::from_secs_f64(self.cfg.hedge_settle_seconds)).await;

        // Post-fill entry spread gate.
        let mid = (exec.entry_price_maker + hedge_price) / Decimal::TWO;
        if mid > Decimal::ZERO {
            let spread = (exec.entry_price_maker - hedge_price).abs() / mid;
            let max_spread =
                Decimal::from_f64(self.cfg.max_entry_spread_pct).unwrap_or(Decimal::ONE);
            if spread > max_spread {
                let msg = format!(
                    "entry spread {:.4}% exceeds {:.4}%",
                    spread * Decimal::ONE_HUNDRED,
                    max_spread * Decimal::ONE_HUNDRED
                );
                warn!(symbol, %spread, "⚠️ bad entry spread");
                record.push_event("BAD_ENTRY_SPREAD", serde_json::json!({"spread": spread.to_string()}));
                if self.cfg.auto_close_bad_entries {
                    return self
                        .queue_entry_rollback(
                            exec,
                            record,
                            "bad_entry_spread",
                            ExecError::BadEntrySpread(msg),
                            maker_order.order_id,
                        )
                        .await;
                }
                self.persist(&record).await;
            }
        }

        record.status = TradeStatus::Open;
        record.opened_at = Some(Utc::now());
        let entry_price_maker_str = exec.entry_price_maker.to_string();
        self.transition(
            &mut exec,
            &mut record,
            ExecutionState::Complete,
            serde_json::json!({
                "entry_price_maker": entry_price_maker_str,
                "entry_price_hedge": hedge_price.to_string(),
            }),
        );
        self.persist(&record).await;
        self.bus.publish(EngineEvent::TradeOpened {
            trade_id: trade_id.clone(),
            symbol: symbol.clone(),
            size_usd: record.size_usd,
        });

        Ok(EntrySuccess {
            trade_id,
            maker_order_id: maker_order.order_id,
            hedge_order_id: hedge_ack.order_id,
        })
    }

    /// Shared failure path for a filled-but-unhedged (or badly hedged)
    /// entry: queue the rollback, persist, surface the error.
    async fn queue_entry_rollback(
        &self,
        mut exec: TradeExecution,
        mut record: TradeRecord,
        reason: &str,
        error: ExecError,
        maker_order_id: String,
    ) -> Result<EntrySuccess, EntryFailure> {
        record.status = TradeStatus::Rollback;
        self.transition(
            &mut exec,
            &mut record,
            ExecutionState::RollbackQueued,
            serde_json::json!({"reason": reason}),
        );
        self.persist(&record).await;

        let trade_id = record.trade_id.clone();
        let job = RollbackJob::from_execution(exec, reason);
        let handle = { self.rollback.lock().clone() };
        match handle {
            Some(handle) => {
                if !handle.enqueue(job).await {
                    self.bus.critical(
                        format!("rollback enqueue failed for {}", record.symbol),
                        serde_json::json!({"reason": reason}),
                    );
                }
            }
            None => {
                error!(symbol = %record.symbol, "rollback requested but worker not started");
                self.bus.critical(
                    format!("no rollback worker for {}", record.symbol),
                    serde_json::json!({"reason": reason}),
                );
            }
        }

        Err(EntryFailure {
            error,
            trade_id: Some(trade_id),
            maker_order_id: Some(maker_order_id),
        })
    }

    // ── Fill waiting and the cancel/fill race ───────────────────────────

    fn dynamic_timeout(
        &self,
        symbol: &str,
        same_side_depth_usd: Decimal,
        trade_size_usd: Decimal,
    ) -> Duration {
        if self.is_shutting_down() {
            return Duration::from_secs_f64(self.cfg.shutdown_fill_wait_seconds);
        }

        let base = self.cfg.maker_timeout_base_seconds;
        let depth = same_side_depth_usd.to_f64().unwrap_or(0.0);
        let trade = trade_size_usd.to_f64().unwrap_or(0.0);

        let mut timeout = if trade > 0.0 && depth > 0.0 {
            let ratio = depth / trade;
            if ratio >= 2.0 {
                base * self.cfg.liquidity_timeout_multiplier
            } else if ratio >= 1.0 {
                base
            } else {
                base * (2.0 - ratio)
            }
        } else {
            base
        };

        timeout *= self.volatility.regime(symbol).timeout_factor();
        timeout = timeout.clamp(
            self.cfg.maker_timeout_min_seconds,
            self.cfg.maker_timeout_max_seconds,
        );
        Duration::from_secs_f64(timeout)
    }

    /// Block until the maker position reaches the match fraction of
    /// `target`, the timeout expires, or shutdown tightens the budget.
    /// Returns the observed size on success.
    async fn wait_for_maker_fill(
        &self,
        venue: Venue,
        symbol: &str,
        target: Decimal,
        timeout: Duration,
        notify: &Arc<Notify>,
    ) -> Option<Decimal> {
        let adapter = self.venue(venue).clone();
        let fraction = self.fill_fraction();
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = Duration::from_secs_f64(self.cfg.fill_poll_interval_seconds);
        let shutdown_budget = Duration::from_secs_f64(self.cfg.shutdown_fill_wait_seconds);

        loop {
            if self.is_shutting_down() && started.elapsed() >= shutdown_budget {
                warn!(symbol, "⚡ shutdown: abandoning fill wait");
                return None;
            }

            if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
                if target > Decimal::ZERO && pos.abs_size() >= target * fraction {
                    debug!(symbol, size = %pos.signed_size, "fill detected");
                    return Some(pos.abs_size());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let nap = poll.min(deadline - now);
            tokio::select! {
                _ = notify.notified() => {}
                _ = sleep(nap) => {}
            }
        }
    }

    /// The maker timeout protocol: position first, micro-fill triage,
    /// cancel, authoritative status, trade history, then the ghost poll.
    async fn handle_maker_timeout(
        &self,
        venue: Venue,
        symbol: &str,
        order_id: &str,
        planned: Decimal,
        hedge_min: Decimal,
    ) -> MakerTimeoutOutcome {
        let adapter = self.venue(venue).clone();
        let fraction = self.fill_fraction();
        warn!(symbol, order_id, "⏰ maker timeout, resolving cancel/fill race");

        // 1. The position is the ground truth; check it before touching
        //    the order.
        if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
            let size = pos.abs_size();
            if size >= planned * fraction {
                info!(symbol, size = %size, "position present at planned size, cancelling residuals");
                let _ = adapter.cancel_order(symbol, order_id).await;
                return MakerTimeoutOutcome::filled(size);
            }
            if size > EXECUTION_DUST_EPSILON {
                if size < hedge_min {
                    warn!(
                        symbol,
                        size = %size,
                        hedge_min = %hedge_min,
                        "micro partial fill below hedge minimum, NOT cancelling"
                    );
                    return MakerTimeoutOutcome::wait_more();
                }
                warn!(symbol, size = %size, "partial fill large enough to hedge, cancelling remainder");
                let _ = adapter.cancel_order(symbol, order_id).await;
                let _ = adapter.cancel_all_orders(symbol).await;
                return MakerTimeoutOutcome::filled(size);
            }
        }

        // 2. Cancel, remembering a NOT_FOUND for the history check.
        let mut check_history = false;
        match adapter.cancel_order(symbol, order_id).await {
            Ok(_) => {}
            Err(VenueError::NotFound) => {
                warn!(symbol, order_id, "cancel reported NOT_FOUND, flagging history check");
                check_history = true;
            }
            Err(e) => {
                error!(symbol, order_id, error = %e, "cancel failed");
            }
        }

        // 3. Authoritative order status.
        match adapter.get_order_status(symbol, order_id).await {
            Ok(info) => match info.status {
                OrderState::Filled | OrderState::PartiallyFilled => {
                    let size = if info.filled_amount > Decimal::ZERO {
                        info.filled_amount
                    } else {
                        planned
                    };
                    warn!(symbol, size = %size, "order filled during cancel window");
                    return MakerTimeoutOutcome::filled(size);
                }
                OrderState::Canceled | OrderState::Rejected => {
                    if info.filled_amount > Decimal::ZERO {
                        return MakerTimeoutOutcome::filled(info.filled_amount);
                    }
                    debug!(symbol, "cancel confirmed with zero fills");
                }
                OrderState::Open => {
                    warn!(symbol, "order still open after cancel, force-cancelling");
                    let _ = adapter.cancel_all_orders(symbol).await;
                }
            },
            Err(VenueError::NotFound) => check_history = true,
            Err(e) => {
                warn!(symbol, error = %e, "order status check failed, assuming the worst");
                check_history = true;
            }
        }

        // 4. NOT_FOUND is never trusted as unfilled: the private trade
        //    history is the tiebreaker.
        if check_history {
            match adapter.fetch_my_trades(symbol, 10).await {
                Ok(trades) => {
                    let sum: Decimal = trades
                        .iter()
                        .filter(|t| t.order_id == order_id)
                        .map(|t| t.qty)
                        .sum();
                    if sum > EXECUTION_DUST_EPSILON {
                        warn!(symbol, filled = %sum, "🚨 NOT_FOUND order has fills in trade history");
                        return MakerTimeoutOutcome::filled(sum);
                    }
                    debug!(symbol, "trade history clean, cancel confirmed");
                }
                Err(e) => {
                    warn!(symbol, error = %e, "trade history unavailable, relying on position poll");
                }
            }
        }

        // 5. Ghost poll: a fill can surface in the position feed seconds
        //    after the cancel. Skipped during shutdown.
        if !self.is_shutting_down() {
            for attempt in 0..self.cfg.ghost_check_attempts {
                if self.is_shutting_down() {
                    warn!(symbol, "⚡ shutdown during ghost check, aborting");
                    break;
                }
                let delay = (self.cfg.ghost_check_initial_delay
                    + self.cfg.ghost_check_delay_step * attempt as f64)
                    .min(self.cfg.ghost_check_delay_cap);
                sleep(Duration::from_secs_f64(delay)).await;

                if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
                    let size = pos.abs_size();
                    if size > EXECUTION_DUST_EPSILON {
                        warn!(
                            symbol,
                            size = %size,
                            attempt = attempt + 1,
                            "⚠️ ghost fill detected after cancel"
                        );
                        let _ = adapter.cancel_all_orders(symbol).await;
                        if size < hedge_min {
                            return MakerTimeoutOutcome::wait_more();
                        }
                        return MakerTimeoutOutcome::filled(size);
                    }
                }
            }
        }

        info!(symbol, "cancel verified clean, no fill anywhere");
        MakerTimeoutOutcome::unfilled()
    }

    /// Cancel remaining order parts and flatten a position too small to
    /// hedge.
    async fn abort_microfill(&self, venue: Venue, symbol: &str, order_id: &str) {
        let adapter = self.venue(venue).clone();
        warn!(symbol, "🧹 aborting maker entry, flattening micro fill");
        let _ = adapter.cancel_order(symbol, order_id).await;
        let _ = adapter.cancel_all_orders(symbol).await;

        match position_for(&adapter, symbol).await {
            Ok(Some(pos)) if pos.abs_size() > EXECUTION_DUST_EPSILON => {
                let notional = pos.abs_size() * pos.mark_price;
                match adapter.close_position(symbol, pos.side(), notional).await {
                    Ok(_) => info!(symbol, "micro fill flattened"),
                    Err(e) => {
                        error!(symbol, error = %e, "failed to flatten micro fill");
                        self.bus.critical(
                            format!("micro-fill flatten failed for {symbol}"),
                            serde_json::json!({"size": pos.signed_size.to_string()}),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Maker retry with a price chase. Never places while a prior order's
    /// cancellation is unconfirmed.
    #[allow(clippy::too_many_arguments)]
    async fn retry_maker_with_chase(
        &self,
        venue: Venue,
        symbol: &str,
        side: Side,
        planned: Decimal,
        trade_usd: Decimal,
        tick: Decimal,
        old_order_id: &str,
    ) -> RetryOutcome {
        if self.cfg.maker_max_retries == 0 {
            return RetryOutcome::NotFilled;
        }
        let adapter = self.venue(venue).clone();
        let retry_delay = Duration::from_secs_f64(self.cfg.maker_retry_delay_seconds);

        for attempt in 1..=self.cfg.maker_max_retries {
            if self.is_shutting_down() {
                warn!(symbol, "shutdown: skipping maker retries");
                break;
            }

            // A fill may have landed in the race window since the last
            // check; a retry on top of it would double the position.
            if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
                if pos.abs_size() > EXECUTION_DUST_EPSILON {
                    info!(symbol, size = %pos.signed_size, "position appeared before retry, using it");
                    return RetryOutcome::Filled {
                        order_id: old_order_id.to_string(),
                        actual: pos.abs_size(),
                    };
                }
            }

            // Stacking guard: the previous order must be demonstrably gone.
            match adapter.get_open_orders(symbol).await {
                Ok(orders) if !orders.is_empty() => {
                    warn!(symbol, count = orders.len(), "orders still resting before retry, force-cancelling");
                    let _ = adapter.cancel_all_orders(symbol).await;
                    match adapter.get_open_orders(symbol).await {
                        Ok(remaining) if remaining.is_empty() => {}
                        _ => {
                            error!(symbol, "cancel unconfirmed, refusing to stack a retry order");
                            return RetryOutcome::NotFilled;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(symbol, error = %e, "cannot verify open orders, refusing retry");
                    return RetryOutcome::NotFilled;
                }
            }

            sleep(retry_delay).await;

            let validation = self
                .validator
                .validate_with_provider(&self.provider, venue, symbol, side, trade_usd)
                .await;
            if !validation.valid {
                warn!(symbol, attempt, reason = %validation.reason, "book invalid on retry");
                sleep(retry_delay * attempt).await;
                continue;
            }

            let mark = match adapter.fetch_mark_price(symbol).await {
                Ok(px) if px > Decimal::ZERO => px,
                _ => {
                    warn!(symbol, "no mark price for retry, skipping");
                    continue;
                }
            };
            let k = Decimal::from_f64(self.cfg.price_chase_increment * attempt as f64)
                .unwrap_or(Decimal::ZERO);
            let chased = match side {
                Side::Sell => mark * (Decimal::ONE - k),
                Side::Buy => mark * (Decimal::ONE + k),
            };
            // The chase moves toward the touch but must stay passive: a
            // post-only order that crosses just gets rejected.
            let chased = match side {
                Side::Sell => match validation.best_bid {
                    Some(bid) => chased.max(bid + tick),
                    None => chased,
                },
                Side::Buy => match validation.best_ask {
                    Some(ask) => chased.min(ask - tick),
                    None => chased,
                },
            };
            let price = round_to_tick(chased, tick, side);

            info!(symbol, attempt, price = %price, "🔄 maker retry with chased price");
            let notify = self.fills.watch(venue, symbol, planned, self.fill_fraction());
            let ack = match adapter
                .place_order(&OrderRequest {
                    symbol: symbol.to_string(),
                    side,
                    kind: OrderKind::LimitPostOnly,
                    size_coins: planned,
                    price: Some(price),
                    reduce_only: false,
                })
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "retry placement failed");
                    sleep(retry_delay * attempt).await;
                    continue;
                }
            };

            let timeout =
                self.dynamic_timeout(symbol, validation.same_side_depth_usd(side), trade_usd);
            if let Some(actual) = self
                .wait_for_maker_fill(venue, symbol, planned, timeout, &notify)
                .await
            {
                info!(symbol, attempt, "✅ retry order filled");
                return RetryOutcome::Filled {
                    order_id: ack.order_id,
                    actual,
                };
            }

            warn!(symbol, attempt, "retry order timed out, cancelling");
            let _ = adapter.cancel_order(symbol, &ack.order_id).await;
        }

        // Last race window: a retry cancel can itself ghost-fill.
        if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
            if pos.abs_size() > EXECUTION_DUST_EPSILON {
                return RetryOutcome::Filled {
                    order_id: old_order_id.to_string(),
                    actual: pos.abs_size(),
                };
            }
        }
        RetryOutcome::NotFilled
    }

    // ── Compliance ──────────────────────────────────────────────────────

    /// Self-match guard: an opposing resting order of ours on either venue
    /// blocks the entry. Results are cached briefly to survive bursts.
    pub(crate) async fn compliance_check(
        &self,
        symbol: &str,
        maker_venue: Venue,
        maker_side: Side,
        hedge_side: Side,
    ) -> bool {
        if !self.cfg.compliance_check_enabled {
            return true;
        }

        let ttl = Duration::from_secs_f64(self.cfg.compliance_cache_ttl_seconds);
        let key = normalize_symbol(symbol);
        if let Some((at, ok)) = self.compliance_cache.lock().get(&key).copied() {
            if at.elapsed() < ttl {
                debug!(symbol, cached = ok, "compliance check cache hit");
                return ok;
            }
        }

        let maker = self.venue(maker_venue);
        let hedge = self.venue(maker_venue.other());
        let (maker_orders, hedge_orders) = tokio::join!(
            maker.get_open_orders(symbol),
            hedge.get_open_orders(symbol)
        );
        let maker_orders = maker_orders.unwrap_or_else(|e| {
            warn!(symbol, error = %e, "compliance: maker open-orders fetch failed");
            Vec::new()
        });
        let hedge_orders = hedge_orders.unwrap_or_else(|e| {
            warn!(symbol, error = %e, "compliance: hedge open-orders fetch failed");
            Vec::new()
        });

        let mut risk = false;
        for order in &maker_orders {
            if order.side == maker_side.inverse() {
                warn!(
                    symbol,
                    order_id = %order.id,
                    "⛔ self-match risk: opposing resting order on maker venue"
                );
                risk = true;
            }
        }
        for order in &hedge_orders {
            if order.side == hedge_side.inverse() {
                warn!(
                    symbol,
                    order_id = %order.id,
                    "⛔ self-match risk: opposing resting order on hedge venue"
                );
                risk = true;
            }
        }

        let ok = !risk;
        self.compliance_cache
            .lock()
            .insert(key, (Instant::now(), ok));
        ok
    }

    // ── Exit ────────────────────────────────────────────────────────────

    /// Unwind a hedged trade: reduce-only market closes on both venues,
    /// verified through position reads.
    pub async fn execute_hedged_exit(&self, trade_id: &str, reason: &str) -> Result<(), ExecError> {
        let trade = self
            .store
            .get_trade(trade_id)
            .await
            .map_err(|e| ExecError::Internal(format!("store: {e}")))?
            .ok_or_else(|| ExecError::Internal(format!("unknown trade {trade_id}")))?;

        if !matches!(trade.status, TradeStatus::Open | TradeStatus::Closing) {
            return Err(ExecError::Internal(format!(
                "trade {trade_id} not open (status {})",
                trade.status
            )));
        }

        let symbol_key = normalize_symbol(&trade.symbol);
        let Some(_guard) = self.try_lock_symbol(&symbol_key) else {
            return Err(ExecError::Busy);
        };

        info!(trade_id, symbol = %trade.symbol, reason, "🔚 hedged exit start");
        let mut record = trade;
        record.status = TradeStatus::Closing;
        record.push_event("CLOSING", serde_json::json!({"reason": reason}));
        self.persist(&record).await;

        let mut realized = Decimal::ZERO;
        let mut all_flat = true;

        for venue in [Venue::VenueA, Venue::VenueB] {
            let adapter = self.venue(venue).clone();
            let pos = match position_for(&adapter, &record.symbol).await {
                Ok(Some(p)) if p.abs_size() > EXECUTION_DUST_EPSILON => p,
                Ok(_) => continue,
                Err(e) => {
                    error!(symbol = %record.symbol, %venue, error = %e, "exit: position fetch failed");
                    all_flat = false;
                    continue;
                }
            };

            let notional = pos.abs_size() * pos.mark_price;
            match adapter
                .close_position(&record.symbol, record.side_on(venue), notional)
                .await
            {
                Ok(ack) => {
                    let entry = match venue {
                        Venue::VenueA => record.entry_price_a,
                        Venue::VenueB => record.entry_price_b,
                    };
                    if entry > Decimal::ZERO && ack.avg_fill_price > Decimal::ZERO {
                        let per_coin = match record.side_on(venue) {
                            Side::Buy => ack.avg_fill_price - entry,
                            Side::Sell => entry - ack.avg_fill_price,
                        };
                        realized += per_coin * ack.filled_size - ack.fee_paid;
                    }
                }
                Err(e) => {
                    error!(symbol = %record.symbol, %venue, error = %e, "exit close failed");
                    all_flat = false;
                    continue;
                }
            }

            // Verify the venue actually went flat.
            let deadline = Instant::now() + Duration::from_secs(6);
            let mut flat = false;
            while Instant::now() < deadline {
                match position_for(&adapter, &record.symbol).await {
                    Ok(Some(p)) if p.abs_size() > EXECUTION_DUST_EPSILON => {
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        flat = true;
                        break;
                    }
                }
            }
            if !flat {
                warn!(symbol = %record.symbol, %venue, "position still open after exit close");
                all_flat = false;
            }
        }

        if !all_flat {
            record.push_event("CLOSE_INCOMPLETE", serde_json::json!({"reason": reason}));
            self.persist(&record).await;
            self.bus.critical(
                format!("hedged exit incomplete for {}", record.symbol),
                serde_json::json!({"trade_id": trade_id}),
            );
            return Err(ExecError::Internal("exit close incomplete".to_string()));
        }

        record.status = TradeStatus::Closed;
        record.closed_at = Some(Utc::now());
        record.close_reason = Some(reason.to_string());
        record.realized_pnl = realized;
        record.push_event("CLOSED", serde_json::json!({"pnl": realized.to_string()}));
        self.persist(&record).await;
        self.bus.publish(EngineEvent::TradeClosed {
            trade_id: trade_id.to_string(),
            symbol: record.symbol.clone(),
            pnl_usd: realized,
            reason: reason.to_string(),
        });
        info!(trade_id, symbol = %record.symbol, pnl = %realized, "✅ hedged exit complete");
        Ok(())
    }

    // ── Shutdown flatten ────────────────────────────────────────────────

    /// Close naked legs left behind by executions that missed the
    /// graceful window. Hedged pairs are left alone.
    async fn force_flatten(&self, symbols: &[String]) {
        for symbol in symbols {
            let mut sizes: HashMap<Venue, Decimal> = HashMap::new();
            for venue in [Venue::VenueA, Venue::VenueB] {
                let adapter = self.venue(venue);
                if let Ok(Some(pos)) = position_for(adapter, symbol).await {
                    sizes.insert(venue, pos.signed_size);
                }
            }

            let a = sizes.get(&Venue::VenueA).copied().unwrap_or(Decimal::ZERO);
            let b = sizes.get(&Venue::VenueB).copied().unwrap_or(Decimal::ZERO);
            let a_open = a.abs() > EXECUTION_DUST_EPSILON;
            let b_open = b.abs() > EXECUTION_DUST_EPSILON;

            let target = match (a_open, b_open) {
                (true, false) => Some(Venue::VenueA),
                (false, true) => Some(Venue::VenueB),
                (true, true) => {
                    info!(symbol, "both venues hold positions, hedge intact, leaving open");
                    None
                }
                (false, false) => None,
            };

            if let Some(venue) = target {
                warn!(symbol, %venue, "🔄 shutdown flatten of naked leg");
                let adapter = self.venue(venue).clone();
                if let Ok(Some(pos)) = position_for(&adapter, symbol).await {
                    let notional = pos.abs_size() * pos.mark_price;
                    if let Err(e) = adapter.close_position(symbol, pos.side(), notional).await {
                        error!(symbol, %venue, error = %e, "shutdown flatten failed");
                        self.bus.critical(
                            format!("shutdown flatten failed for {symbol}"),
                            serde_json::json!({"venue": venue.as_str()}),
                        );
                    }
                }
            }
        }
    }
}

/// Round a chased price onto the venue tick grid, in the direction that
/// keeps the order passive.
fn round_to_tick(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let rounded = match side {
        // SELL chases down, BUY chases up; round further in the chase
        // direction so the adjustment is never undone.
        Side::Sell => steps.floor(),
        Side::Buy => steps.ceil(),
    };
    rounded * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteTradeStore;
    use crate::venues::paper::{CancelBehavior, PaperVenue, PaperVenueConfig};
    use rust_decimal_macros::dec;

    struct Rig {
        engine: Arc<ExecutionEngine>,
        venue_a: Arc<PaperVenue>,
        venue_b: Arc<PaperVenue>,
        store: Arc<dyn TradeStore>,
        bus: EventBus,
    }

    fn fast_cfg() -> ExecutionConfig {
        ExecutionConfig {
            maker_timeout_base_seconds: 0.2,
            maker_timeout_min_seconds: 0.05,
            maker_timeout_max_seconds: 0.5,
            liquidity_timeout_multiplier: 0.5,
            maker_max_retries: 0,
            maker_retry_delay_seconds: 0.02,
            price_chase_increment: 0.001,
            fill_poll_interval_seconds: 0.02,
            hedge_settle_seconds: 0.01,
            max_entry_spread_pct: 0.01,
            auto_close_bad_entries: true,
            compliance_check_enabled: true,
            compliance_cache_ttl_seconds: 5.0,
            fill_match_fraction: 0.95,
            ghost_check_initial_delay: 0.01,
            ghost_check_delay_step: 0.005,
            ghost_check_delay_cap: 0.05,
            ghost_check_attempts: 5,
            graceful_timeout_seconds: 2.0,
            shutdown_fill_wait_seconds: 0.1,
        }
    }

    fn fast_rollback_cfg() -> RollbackConfig {
        RollbackConfig {
            max_attempts: 3,
            base_delay_seconds: 0.01,
            settle_delay_seconds: 0.01,
            verify_delay_seconds: 0.01,
            queue_capacity: 16,
        }
    }

    fn deep_book() -> (Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>) {
        (
            vec![
                (dec!(49995), dec!(1)),
                (dec!(49990), dec!(1)),
                (dec!(49985), dec!(1)),
            ],
            vec![
                (dec!(50005), dec!(1)),
                (dec!(50010), dec!(1)),
                (dec!(50015), dec!(1)),
            ],
        )
    }

    fn rig() -> Rig {
        let mut cfg_a = PaperVenueConfig::new(Venue::VenueA, "paper-a");
        cfg_a.lot_size = dec!(0.0001);
        cfg_a.min_order_size_coins = dec!(0.0001);
        cfg_a.maker_fill_delay = Some(Duration::from_millis(50));
        let venue_a = PaperVenue::new(cfg_a);

        let mut cfg_b = PaperVenueConfig::new(Venue::VenueB, "paper-b");
        cfg_b.lot_size = dec!(0.001);
        cfg_b.min_order_size_coins = dec!(0.001);
        let venue_b = PaperVenue::new(cfg_b);

        let (bids, asks) = deep_book();
        venue_a.set_orderbook("BTC", bids, asks);
        venue_a.set_mark_price("BTC", dec!(50000));
        venue_b.set_mark_price("BTC", dec!(50000));

        let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let bus = EventBus::default();
        let engine = ExecutionEngine::new(
            venue_a.clone(),
            venue_b.clone(),
            store.clone(),
            bus.clone(),
            fast_cfg(),
            fast_rollback_cfg(),
            ValidatorPolicy::default(),
        );
        engine.start();

        Rig {
            engine,
            venue_a,
            venue_b,
            store,
            bus,
        }
    }

    fn entry_request() -> EntryRequest {
        EntryRequest {
            symbol: "BTC".to_string(),
            maker_venue: Venue::VenueA,
            maker_side: Side::Buy,
            hedge_side: Side::Sell,
            target_usd: dec!(1000),
            maker_price: None,
            hedge_price: None,
            timeout: None,
        }
    }

    async fn wait_until_flat(venue: &Arc<PaperVenue>, symbol: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if venue.position_size(symbol).is_zero() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("venue never went flat for {symbol}");
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reaches_complete() {
        let rig = rig();
        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(outcome.success, "entry failed: {:?}", outcome.error);
        assert!(outcome.maker_order_id.is_some());
        assert!(outcome.hedge_order_id.is_some());

        // $1000 at 50k aligned to lot 0.001 -> exactly 0.02 coins.
        assert_eq!(rig.venue_a.position_size("BTC"), dec!(0.02));
        assert_eq!(rig.venue_b.position_size("BTC"), dec!(-0.02));

        let stats = rig.engine.get_execution_stats();
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active_executions, 0);

        let trade = rig
            .store
            .get_trade(outcome.trade_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.execution_state, "COMPLETE");
        assert!(trade.opened_at.is_some());
        assert!(trade.events.iter().any(|e| e.name == "LEG1_SENT"));
        assert!(trade.events.iter().any(|e| e.name == "COMPLETE"));
    }

    #[tokio::test(start_paused = true)]
    async fn hedge_remains_within_lot_tolerance_after_complete() {
        let rig = rig();
        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(outcome.success);
        let net = rig.venue_a.position_size("BTC") + rig.venue_b.position_size("BTC");
        assert!(net.abs() <= dec!(0.001), "net exposure {net} beyond lot tolerance");
    }

    #[tokio::test(start_paused = true)]
    async fn leg2_failure_rolls_back_maker_leg() {
        let rig = rig();
        rig.venue_b
            .inject_failure(VenueError::Network("connection reset".into()));

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(ExecError::Leg2PlaceFailed(_))));
        assert!(outcome.maker_order_id.is_some());

        wait_until_flat(&rig.venue_a, "BTC").await;
        assert!(rig.venue_b.position_size("BTC").is_zero());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let stats = rig.engine.get_execution_stats();
            if stats.rollbacks_successful == 1 {
                assert_eq!(stats.rollbacks_triggered, 1);
                assert_eq!(stats.failed, 1);
                break;
            }
            assert!(Instant::now() < deadline, "rollback never completed");
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_entry_for_same_symbol_returns_busy() {
        let rig = rig();
        let engine = rig.engine.clone();
        let first = tokio::spawn(async move { engine.execute_hedged_entry(entry_request()).await });

        // Give the first entry time to take the symbol lock.
        sleep(Duration::from_millis(10)).await;

        let second = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!second.success);
        assert_eq!(second.error, Some(ExecError::Busy));

        let first = first.await.unwrap();
        assert!(first.success);

        // The busy rejection left no trace: one execution total.
        let stats = rig.engine.get_execution_stats();
        assert_eq!(stats.total_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_fill_after_cancel_proceeds_to_hedge() {
        let rig = rig();
        // The maker order rests forever and the cancel races with a fill.
        rig.venue_a.set_maker_fill_delay(None);
        rig.venue_a.set_cancel_behavior(CancelBehavior::GhostFill);

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(outcome.success, "ghost fill should continue to hedge: {:?}", outcome.error);
        assert_eq!(rig.venue_a.position_size("BTC"), dec!(0.02));
        assert_eq!(rig.venue_b.position_size("BTC"), dec!(-0.02));
    }

    #[tokio::test(start_paused = true)]
    async fn ghost_fill_found_via_trade_history_when_status_unavailable() {
        let rig = rig();
        rig.venue_a.set_maker_fill_delay(None);
        rig.venue_a.set_cancel_behavior(CancelBehavior::GhostFill);
        rig.venue_a.set_order_status_unavailable(true);

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(outcome.success, "history check should confirm fill: {:?}", outcome.error);
        assert_eq!(rig.venue_b.position_size("BTC"), dec!(-0.02));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_timeout_fails_without_rollback() {
        let rig = rig();
        rig.venue_a.set_maker_fill_delay(None); // never fills

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(ExecError::Leg1Unfilled));

        // Both venues flat and no rollback was needed.
        assert!(rig.venue_a.position_size("BTC").is_zero());
        assert!(rig.venue_b.position_size("BTC").is_zero());
        assert_eq!(rig.venue_a.open_order_count("BTC"), 0);
        let stats = rig.engine.get_execution_stats();
        assert_eq!(stats.rollbacks_triggered, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn micro_partial_fill_waits_then_aborts_and_flattens() {
        let rig = rig();
        // 2.5% of 0.02 = 0.0005 coins, below the hedge minimum of 0.001.
        rig.venue_a.set_maker_partial_fill(Some(dec!(0.025)));
        rig.venue_a.set_maker_fill_delay(Some(Duration::from_millis(30)));

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(ExecError::Leg1Unfilled));

        // The crumb was flattened and nothing rests.
        assert!(rig.venue_a.position_size("BTC").is_zero());
        assert!(rig.venue_b.position_size("BTC").is_zero());
        assert_eq!(rig.venue_a.open_order_count("BTC"), 0);

        let trade = rig
            .store
            .get_trade(outcome.trade_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);
        assert_eq!(trade.close_reason.as_deref(), Some("micro_fill_abort"));
        assert!(trade.events.iter().any(|e| e.name == "PARTIAL_FILL"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_entry_spread_triggers_auto_flatten() {
        let rig = rig();
        // Hedge fills ~2% away from the maker price.
        rig.venue_b.set_mark_price("BTC", dec!(51000));

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(ExecError::BadEntrySpread(_))));

        wait_until_flat(&rig.venue_a, "BTC").await;
        wait_until_flat(&rig.venue_b, "BTC").await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_orderbook_rejects_entry() {
        let rig = rig();
        // One-level book fails the level minimum.
        rig.venue_a
            .set_orderbook("BTC", vec![(dec!(49995), dec!(1))], vec![(dec!(50005), dec!(1))]);

        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(ExecError::OrderbookInvalid(_))));
        assert!(rig.venue_a.position_size("BTC").is_zero());

        let trade = rig
            .store
            .get_trade(outcome.trade_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade.status, TradeStatus::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn compliance_detects_opposing_resting_order() {
        let rig = rig();
        // A resting SELL on the maker venue conflicts with a BUY entry.
        rig.venue_a
            .place_order(&OrderRequest {
                symbol: "BTC".to_string(),
                side: Side::Sell,
                kind: OrderKind::Limit,
                size_coins: dec!(0.01),
                price: Some(dec!(50100)),
                reduce_only: false,
            })
            .await
            .unwrap();

        let ok = rig
            .engine
            .compliance_check("BTC", Venue::VenueA, Side::Buy, Side::Sell)
            .await;
        assert!(!ok);

        // Result is cached: clearing the order does not flip it inside the TTL.
        rig.venue_a.cancel_all_orders("BTC").await.unwrap();
        let cached = rig
            .engine
            .compliance_check("BTC", Venue::VenueA, Side::Buy, Side::Sell)
            .await;
        assert!(!cached);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_entries() {
        let rig = rig();
        rig.engine.stop(false).await;
        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(ExecError::ShuttingDown));
        assert_eq!(rig.engine.get_execution_stats().total_executions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_then_exit_restores_flat_books() {
        let rig = rig();
        let outcome = rig.engine.execute_hedged_entry(entry_request()).await;
        assert!(outcome.success);
        let trade_id = outcome.trade_id.unwrap();

        let mut rx = rig.bus.subscribe();
        rig.engine
            .execute_hedged_exit(&trade_id, "funding_flip")
            .await
            .unwrap();

        assert!(rig.venue_a.position_size("BTC").is_zero());
        assert!(rig.venue_b.position_size("BTC").is_zero());

        let trade = rig.store.get_trade(&trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.close_reason.as_deref(), Some("funding_flip"));

        let mut saw_closed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::TradeClosed { .. }) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_chase_fills_after_initial_timeout() {
        let rig = rig();
        // First maker order never fills; the retry (placed after the
        // timeout protocol confirms a clean cancel) fills quickly.
        rig.venue_a.set_maker_fill_delay(None);

        let mut cfg = fast_cfg();
        cfg.maker_max_retries = 1;
        let engine = ExecutionEngine::new(
            rig.venue_a.clone(),
            rig.venue_b.clone(),
            rig.store.clone(),
            rig.bus.clone(),
            cfg,
            fast_rollback_cfg(),
            ValidatorPolicy::default(),
        );
        engine.start();

        let venue_a = rig.venue_a.clone();
        let flipper = tokio::spawn(async move {
            // After the first timeout window passes, future maker orders fill.
            sleep(Duration::from_millis(150)).await;
            venue_a.set_maker_fill_delay(Some(Duration::from_millis(10)));
        });

        let outcome = engine.execute_hedged_entry(entry_request()).await;
        flipper.await.unwrap();
        assert!(outcome.success, "retry should have filled: {:?}", outcome.error);
        assert_eq!(rig.venue_a.position_size("BTC"), dec!(0.02));
        assert_eq!(rig.venue_b.position_size("BTC"), dec!(-0.02));
    }

    #[test]
    fn tick_rounding_follows_chase_direction() {
        assert_eq!(
            round_to_tick(dec!(100.0049), dec!(0.01), Side::Sell),
            dec!(100.00)
        );
        assert_eq!(
            round_to_tick(dec!(100.0001), dec!(0.01), Side::Buy),
            dec!(100.01)
        );
    }
}
