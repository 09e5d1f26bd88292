//! Reconciliation.
//!
//! Periodic and startup sweep aligning the persisted trade set with the
//! positions both venues actually hold. Zombies (trades without
//! positions) are closed in the store, ghosts (positions without trades)
//! are adopted or flattened, and conflicts (side or quantity drift) are
//! flattened on both venues and resolved in the store. The reconciler
//! never opens a position.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionConfig, ReconcilerConfig};
use crate::events::{EngineEvent, EventBus};
use crate::models::{
    normalize_symbol, OrderKind, OrderRequest, OrderState, Position, Side, TradeRecord,
    TradeStatus, Venue,
};
use crate::store::{TradePatch, TradeStore};
use crate::venues::VenueAdapter;

/// Positions at or below this are invisible to reconciliation. Looser
/// than the execution-path epsilon on purpose: reconciliation must not
/// chase dust.
pub const RECONCILE_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 4); // 1e-4

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub zombies_closed: u32,
    pub ghosts_adopted: u32,
    pub ghosts_closed: u32,
    pub conflicts_resolved: u32,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.zombies_closed == 0
            && self.ghosts_adopted == 0
            && self.ghosts_closed == 0
            && self.conflicts_resolved == 0
            && self.errors.is_empty()
    }
}

pub struct Reconciler {
    venues: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<dyn TradeStore>,
    bus: EventBus,
    cfg: ReconcilerConfig,
    /// OPENING trades older than this with no position are orphaned.
    opening_stale_seconds: f64,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        store: Arc<dyn TradeStore>,
        bus: EventBus,
        cfg: ReconcilerConfig,
        exec_cfg: &ExecutionConfig,
    ) -> Arc<Self> {
        let mut venues: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(Venue::VenueA, venue_a);
        venues.insert(Venue::VenueB, venue_b);
        let opening_stale_seconds = f64::max(
            600.0,
            exec_cfg.maker_timeout_base_seconds * f64::max(1.0, exec_cfg.maker_max_retries as f64)
                + cfg.opening_stale_buffer_seconds,
        );
        Arc::new(Self {
            venues,
            store,
            bus,
            cfg,
            opening_stale_seconds,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Startup pass, then the periodic loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting reconciler");
        self.run_once(true).await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let interval = Duration::from_secs_f64(this.cfg.interval_seconds);
            while this.running.load(Ordering::SeqCst) {
                sleep(interval).await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.run_once(false).await;
                let handled = this.check_late_fills().await;
                if handled > 0 {
                    warn!(count = handled, "late fills handled");
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = { self.task.lock().take() };
        if let Some(task) = task {
            task.abort();
        }
        info!("reconciler stopped");
    }

    pub async fn run_once(&self, startup: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        info!(startup, "reconciliation pass starting");

        let db_trades = match self.store.list_open_trades().await {
            Ok(trades) => trades,
            Err(e) => {
                report.errors.push(format!("store: {e}"));
                return report;
            }
        };
        let db_symbols: HashSet<String> = db_trades
            .iter()
            .map(|t| normalize_symbol(&t.symbol))
            .collect();

        let Some(positions_a) = self.safe_positions(Venue::VenueA).await else {
            report.errors.push("failed to fetch venue A positions".into());
            return report;
        };
        let Some(positions_b) = self.safe_positions(Venue::VenueB).await else {
            report.errors.push("failed to fetch venue B positions".into());
            return report;
        };

        let zombie_candidates = self.identify_zombie_candidates(&db_trades, startup);
        let zombie_symbols: HashSet<String> = zombie_candidates
            .iter()
            .map(|t| normalize_symbol(&t.symbol))
            .collect();

        let exchange = aggregate_positions(&positions_a, &positions_b);
        let exchange_symbols: HashSet<String> = exchange.keys().cloned().collect();

        debug!(
            db_trades = db_trades.len(),
            venue_a = positions_a.len(),
            venue_b = positions_b.len(),
            "reconciler inputs"
        );

        let zombies: HashSet<&String> = zombie_symbols
            .iter()
            .filter(|s| !exchange_symbols.contains(*s))
            .collect();
        let ghosts: HashSet<&String> = exchange_symbols
            .iter()
            .filter(|s| !db_symbols.contains(*s))
            .collect();
        let conflicts = self.detect_conflicts(&db_trades, &exchange).await;

        for (symbol, reason) in &conflicts {
            match self.resolve_conflict(symbol, reason, &exchange, &db_trades, startup).await {
                Ok(()) => report.conflicts_resolved += 1,
                Err(e) => report.errors.push(format!("conflict {symbol}: {e}")),
            }
        }

        for symbol in zombies {
            match self.handle_zombie(symbol, &db_trades, startup).await {
                Ok(()) => report.zombies_closed += 1,
                Err(e) => report.errors.push(format!("zombie {symbol}: {e}")),
            }
        }

        for symbol in ghosts {
            match self.handle_ghost(symbol, &exchange).await {
                Ok(closed) => {
                    if closed {
                        report.ghosts_closed += 1;
                    } else {
                        report.ghosts_adopted += 1;
                    }
                }
                Err(e) => report.errors.push(format!("ghost {symbol}: {e}")),
            }
        }

        if report.is_noop() {
            debug!("reconciliation complete: no discrepancies");
        } else {
            info!(
                zombies = report.zombies_closed,
                ghosts_closed = report.ghosts_closed,
                ghosts_adopted = report.ghosts_adopted,
                conflicts = report.conflicts_resolved,
                errors = report.errors.len(),
                "reconciliation complete"
            );
            for err in &report.errors {
                warn!(error = %err, "reconciliation error");
            }
        }
        report
    }

    async fn safe_positions(&self, venue: Venue) -> Option<Vec<Position>> {
        match self.venues[&venue].fetch_open_positions().await {
            Ok(positions) => Some(positions),
            Err(e) => {
                warn!(%venue, error = %e, "failed to list positions");
                None
            }
        }
    }

    /// Trades that ought to have on-exchange positions. OPEN and CLOSING
    /// always qualify; PENDING and OPENING only once stale, except at
    /// startup where any of them without a position is orphaned.
    fn identify_zombie_candidates(
        &self,
        db_trades: &[TradeRecord],
        startup: bool,
    ) -> Vec<TradeRecord> {
        let now = Utc::now();
        db_trades
            .iter()
            .filter(|t| match t.status {
                TradeStatus::Open | TradeStatus::Closing => true,
                TradeStatus::Pending => {
                    startup
                        || (now - t.created_at).num_seconds() as f64
                            > self.cfg.pending_stale_seconds
                }
                TradeStatus::Opening => {
                    startup
                        || (now - t.created_at).num_seconds() as f64 > self.opening_stale_seconds
                }
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Side or quantity drift between an open trade and the venues.
    /// Quantity alerts are published as they are detected.
    async fn detect_conflicts(
        &self,
        db_trades: &[TradeRecord],
        exchange: &HashMap<String, HashMap<Venue, Position>>,
    ) -> HashMap<String, String> {
        let mut conflicts: HashMap<String, String> = HashMap::new();

        for trade in db_trades {
            if !matches!(trade.status, TradeStatus::Open | TradeStatus::Closing) {
                continue;
            }
            let symbol = normalize_symbol(&trade.symbol);
            let Some(by_venue) = exchange.get(&symbol) else {
                continue;
            };

            let pos_a = by_venue.get(&Venue::VenueA);
            let pos_b = by_venue.get(&Venue::VenueB);

            let mut side_mismatch = false;
            if let Some(p) = pos_a {
                if p.side() != trade.side_a {
                    warn!(symbol = %symbol, venue = %Venue::VenueA, expected = %trade.side_a, observed = %p.side(), "side mismatch");
                    side_mismatch = true;
                }
            }
            if let Some(p) = pos_b {
                if p.side() != trade.side_b {
                    warn!(symbol = %symbol, venue = %Venue::VenueB, expected = %trade.side_b, observed = %p.side(), "side mismatch");
                    side_mismatch = true;
                }
            }
            if side_mismatch {
                conflicts
                    .entry(symbol)
                    .or_insert_with(|| "reconciliation_side_mismatch".to_string());
                continue;
            }

            let qty_a = pos_a.map(|p| p.abs_size()).unwrap_or(Decimal::ZERO);
            let qty_b = pos_b.map(|p| p.abs_size()).unwrap_or(Decimal::ZERO);
            let max_qty = qty_a.max(qty_b);
            let delta = (qty_a - qty_b).abs();
            let tolerance = Decimal::try_from(self.cfg.qty_tolerance_pct).unwrap_or_default();

            let mark = pos_a
                .or(pos_b)
                .map(|p| p.mark_price)
                .unwrap_or(Decimal::ZERO);
            let delta_usd = delta * mark;
            let min_usd = Decimal::try_from(self.cfg.min_mismatch_usd).unwrap_or_default();

            if max_qty > Decimal::ZERO && delta > tolerance * max_qty && delta_usd > min_usd {
                warn!(
                    symbol = %symbol,
                    qty_a = %qty_a,
                    qty_b = %qty_b,
                    delta = %delta,
                    "quantity mismatch"
                );
                conflicts
                    .entry(symbol.clone())
                    .or_insert_with(|| "reconciliation_quantity_mismatch".to_string());
                self.bus.publish(EngineEvent::PositionReconciled {
                    symbol: symbol.clone(),
                    venue: Venue::VenueA,
                    action: "quantity_mismatch".to_string(),
                    details: json!({
                        "venue_a_qty": qty_a.to_string(),
                        "venue_b_qty": qty_b.to_string(),
                        "delta": delta.to_string(),
                    }),
                });
            }
        }

        conflicts
    }

    /// Flatten both venues and resolve every matching store record.
    async fn resolve_conflict(
        &self,
        symbol: &str,
        reason: &str,
        exchange: &HashMap<String, HashMap<Venue, Position>>,
        db_trades: &[TradeRecord],
        startup: bool,
    ) -> anyhow::Result<()> {
        warn!(symbol, reason, "flattening conflict position");
        if let Some(by_venue) = exchange.get(symbol) {
            for (venue, pos) in by_venue {
                if pos.abs_size() > RECONCILE_DUST {
                    self.close_position_verified(*venue, pos).await?;
                }
            }
        }
        self.mark_trades_resolved(symbol, db_trades, reason, startup)
            .await?;
        self.bus.publish(EngineEvent::PositionReconciled {
            symbol: symbol.to_string(),
            venue: Venue::VenueA,
            action: "closed_conflict".to_string(),
            details: json!({"reason": reason}),
        });
        Ok(())
    }

    async fn mark_trades_resolved(
        &self,
        symbol: &str,
        db_trades: &[TradeRecord],
        reason: &str,
        startup: bool,
    ) -> anyhow::Result<()> {
        for trade in db_trades {
            if normalize_symbol(&trade.symbol) != symbol {
                continue;
            }
            let mut record = trade.clone();
            match record.status {
                TradeStatus::Open | TradeStatus::Closing => {
                    record.push_event("CLOSED", json!({"reason": reason}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Closed),
                                close_reason: Some(reason.to_string()),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                TradeStatus::Opening => {
                    let full_reason = if startup {
                        format!("{reason}_opening")
                    } else {
                        reason.to_string()
                    };
                    record.push_event("ABORTED", json!({"reason": full_reason}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Failed),
                                close_reason: Some(full_reason),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                TradeStatus::Pending => {
                    record.push_event("REJECTED", json!({"reason": reason}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Rejected),
                                close_reason: Some(reason.to_string()),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A trade the store believes is live with nothing on either venue.
    async fn handle_zombie(
        &self,
        symbol: &str,
        db_trades: &[TradeRecord],
        startup: bool,
    ) -> anyhow::Result<()> {
        warn!(symbol, "zombie detected: trade in store, no position on any venue");

        for trade in db_trades {
            if normalize_symbol(&trade.symbol) != symbol {
                continue;
            }
            let mut record = trade.clone();
            match record.status {
                TradeStatus::Opening => {
                    let reason = if startup {
                        "startup_orphaned_opening"
                    } else {
                        "reconciliation_stale_opening"
                    };
                    info!(symbol, trade_id = %record.trade_id, reason, "aborting orphaned opening trade");
                    // Leftover maker orders would otherwise fill later.
                    for adapter in self.venues.values() {
                        if let Err(e) = adapter.cancel_all_orders(&record.symbol).await {
                            debug!(symbol, error = %e, "residual order cancel failed");
                        }
                    }
                    record.push_event("ABORTED", json!({"reason": reason}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Failed),
                                close_reason: Some(reason.to_string()),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                TradeStatus::Pending => {
                    let reason = if startup {
                        "startup_orphaned_pending"
                    } else {
                        "reconciliation_stale_pending"
                    };
                    info!(symbol, trade_id = %record.trade_id, reason, "rejecting orphaned pending trade");
                    record.push_event("REJECTED", json!({"reason": reason}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Rejected),
                                close_reason: Some(reason.to_string()),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                _ => {
                    info!(symbol, trade_id = %record.trade_id, "closing zombie trade");
                    record.push_event("CLOSED", json!({"reason": "reconciliation_zombie"}));
                    self.store
                        .update_trade(
                            &record.trade_id,
                            TradePatch {
                                status: Some(TradeStatus::Closed),
                                close_reason: Some("reconciliation_zombie".to_string()),
                                closed_at: Some(Utc::now()),
                                events: Some(record.events.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }

            self.bus.publish(EngineEvent::PositionReconciled {
                symbol: symbol.to_string(),
                venue: Venue::VenueA,
                action: "closed_zombie".to_string(),
                details: json!({"trade_id": record.trade_id}),
            });
        }
        Ok(())
    }

    /// On-exchange position with no matching trade. Adopt it into the
    /// store when the pair still forms a hedge and policy allows,
    /// otherwise flatten. Returns true when closed.
    async fn handle_ghost(
        &self,
        symbol: &str,
        exchange: &HashMap<String, HashMap<Venue, Position>>,
    ) -> anyhow::Result<bool> {
        warn!(symbol, "ghost detected: position on exchange, no trade in store");
        let Some(by_venue) = exchange.get(symbol) else {
            return Ok(false);
        };

        if !self.cfg.auto_import_ghosts && !self.cfg.auto_close_ghosts {
            warn!(symbol, "ghost handling disabled by policy, skipping");
            return Ok(false);
        }

        if self.cfg.auto_import_ghosts {
            if let Some(record) = self.import_ghost(symbol, by_venue).await? {
                self.bus.publish(EngineEvent::PositionReconciled {
                    symbol: symbol.to_string(),
                    venue: Venue::VenueA,
                    action: "imported_ghost".to_string(),
                    details: json!({"trade_id": record.trade_id}),
                });
                return Ok(false);
            }
        }

        let mut closed = false;
        for (venue, pos) in by_venue {
            if pos.abs_size() > RECONCILE_DUST {
                self.close_position_verified(*venue, pos).await?;
                closed = true;
            }
        }
        self.bus.publish(EngineEvent::PositionReconciled {
            symbol: symbol.to_string(),
            venue: Venue::VenueA,
            action: "closed_ghost".to_string(),
            details: json!({}),
        });
        Ok(closed)
    }

    /// Adoption requires a real hedge: both venues populated, opposite
    /// sides, sizes within tolerance.
    async fn import_ghost(
        &self,
        symbol: &str,
        by_venue: &HashMap<Venue, Position>,
    ) -> anyhow::Result<Option<TradeRecord>> {
        let (Some(pos_a), Some(pos_b)) =
            (by_venue.get(&Venue::VenueA), by_venue.get(&Venue::VenueB))
        else {
            warn!(symbol, "ghost import needs positions on both venues");
            return Ok(None);
        };

        if pos_a.side() == pos_b.side() {
            warn!(symbol, side = %pos_a.side(), "ghost import rejected: both positions on the same side");
            return Ok(None);
        }

        let qty_a = pos_a.abs_size();
        let qty_b = pos_b.abs_size();
        let max_qty = qty_a.max(qty_b);
        if max_qty.is_zero() {
            return Ok(None);
        }
        let tolerance = Decimal::try_from(self.cfg.qty_tolerance_pct).unwrap_or_default();
        if (qty_a - qty_b).abs() / max_qty > tolerance {
            warn!(symbol, qty_a = %qty_a, qty_b = %qty_b, "ghost import rejected: size divergence");
            return Ok(None);
        }

        let avg_entry = (pos_a.entry_price + pos_b.entry_price) / Decimal::TWO;
        let notional = qty_a * avg_entry;

        let mut record = TradeRecord::new(symbol, pos_a.side(), pos_b.side(), notional);
        record.status = TradeStatus::Open;
        record.execution_state = "COMPLETE".to_string();
        record.entry_price_a = pos_a.entry_price;
        record.entry_price_b = pos_b.entry_price;
        record.opened_at = Some(Utc::now());
        record.metadata = json!({
            "imported_as_ghost": true,
            "imported_at": Utc::now().to_rfc3339(),
            "venue_a_qty": qty_a.to_string(),
            "venue_b_qty": qty_b.to_string(),
        });
        record.push_event("IMPORTED", json!({"source": "reconciler"}));
        self.store.create_trade(&record).await?;

        info!(
            symbol,
            trade_id = %record.trade_id,
            notional = %notional,
            "ghost hedge adopted into store"
        );
        Ok(Some(record))
    }

    /// Verified close of a single leg: optionally a passive reduce-only
    /// attempt near mid, then a market close re-checked against the
    /// position feed.
    async fn close_position_verified(&self, venue: Venue, pos: &Position) -> anyhow::Result<()> {
        let adapter = self.venues[&venue].clone();

        if self.cfg.soft_close_enabled && self.attempt_soft_close(&adapter, pos).await {
            info!(symbol = %pos.symbol, %venue, "soft close succeeded");
            return Ok(());
        }

        adapter
            .close_position(&pos.symbol, pos.side(), pos.abs_size() * pos.mark_price)
            .await
            .map_err(|e| anyhow::anyhow!("market close on {venue} failed: {e}"))?;

        let deadline = Instant::now() + Duration::from_secs(6);
        while Instant::now() < deadline {
            match crate::venues::position_for(&adapter, &pos.symbol).await {
                Ok(Some(p)) if p.abs_size() > RECONCILE_DUST => {
                    sleep(Duration::from_millis(500)).await;
                }
                _ => return Ok(()),
            }
        }
        Err(anyhow::anyhow!(
            "position still open after market close on {venue}"
        ))
    }

    /// One or two passive POST_ONLY reduce-only orders at a tick-rounded
    /// mid-derived price. Falls back to the caller on timeout.
    async fn attempt_soft_close(&self, adapter: &Arc<dyn VenueAdapter>, pos: &Position) -> bool {
        let attempts = self.cfg.soft_close_max_attempts;
        if attempts == 0 {
            return false;
        }
        let timeout = Duration::from_secs_f64(self.cfg.soft_close_timeout_seconds.clamp(1.0, 60.0));
        let close_side = pos.side().inverse();

        for attempt in 0..attempts {
            let book = match adapter.fetch_orderbook(&pos.symbol, 5).await {
                Ok(b) => b,
                Err(e) => {
                    debug!(symbol = %pos.symbol, error = %e, "soft close: no book");
                    return false;
                }
            };
            let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
                return false;
            };
            if ask <= bid {
                return false;
            }

            let tick = adapter
                .get_market_info(&pos.symbol)
                .await
                .map(|i| i.tick_size)
                .unwrap_or_else(|_| Decimal::new(1, 2));
            let mid = (bid + ask) / Decimal::TWO;
            // Round away from the touch so the order rests.
            let price = match close_side {
                Side::Sell => {
                    let p = round_up_to_tick(mid, tick);
                    if p <= bid {
                        round_up_to_tick(ask, tick)
                    } else {
                        p
                    }
                }
                Side::Buy => {
                    let p = round_down_to_tick(mid, tick);
                    if p >= ask {
                        round_down_to_tick(bid, tick)
                    } else {
                        p
                    }
                }
            };

            info!(
                symbol = %pos.symbol,
                attempt = attempt + 1,
                price = %price,
                "attempting soft close with passive reduce-only order"
            );
            let order = match adapter
                .place_order(&OrderRequest {
                    symbol: pos.symbol.clone(),
                    side: close_side,
                    kind: OrderKind::LimitPostOnly,
                    size_coins: pos.abs_size(),
                    price: Some(price),
                    reduce_only: true,
                })
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    debug!(symbol = %pos.symbol, error = %e, "soft close order rejected");
                    continue;
                }
            };

            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                match adapter.get_order_status(&pos.symbol, &order.order_id).await {
                    Ok(info) if info.status == OrderState::Filled => return true,
                    Ok(info)
                        if matches!(info.status, OrderState::Canceled | OrderState::Rejected) =>
                    {
                        break;
                    }
                    _ => sleep(Duration::from_millis(500)).await,
                }
            }
            let _ = adapter.cancel_order(&pos.symbol, &order.order_id).await;
        }
        false
    }

    /// Sweep recently failed or rolled-back trades for fills that landed
    /// after the abort; any position found is flattened.
    pub async fn check_late_fills(&self) -> usize {
        let mut trades = Vec::new();
        for status in [TradeStatus::Failed, TradeStatus::Rollback] {
            match self.store.list_trades(status, 50).await {
                Ok(mut batch) => trades.append(&mut batch),
                Err(e) => {
                    warn!(error = %e, "late-fill sweep: store read failed");
                    return 0;
                }
            }
        }

        let mut handled = 0;
        let window = self.cfg.late_fill_window_seconds;
        for trade in trades {
            let age = (Utc::now() - trade.created_at).num_seconds() as f64;
            if age > window {
                continue;
            }

            for venue in [Venue::VenueA, Venue::VenueB] {
                let adapter = &self.venues[&venue];
                match crate::venues::position_for(adapter, &trade.symbol).await {
                    Ok(Some(pos)) if pos.abs_size() > RECONCILE_DUST => {
                        warn!(
                            symbol = %trade.symbol,
                            %venue,
                            size = %pos.signed_size,
                            "late fill detected after abort, closing"
                        );
                        if let Err(e) = self.close_position_verified(venue, &pos).await {
                            error!(symbol = %trade.symbol, error = %e, "late-fill close failed");
                        } else {
                            handled += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
        handled
    }
}

fn aggregate_positions(
    positions_a: &[Position],
    positions_b: &[Position],
) -> HashMap<String, HashMap<Venue, Position>> {
    let mut by_symbol: HashMap<String, HashMap<Venue, Position>> = HashMap::new();
    for (venue, positions) in [(Venue::VenueA, positions_a), (Venue::VenueB, positions_b)] {
        for pos in positions {
            if pos.abs_size() <= RECONCILE_DUST {
                debug!(symbol = %pos.symbol, size = %pos.signed_size, "ignoring dust position");
                continue;
            }
            by_symbol
                .entry(normalize_symbol(&pos.symbol))
                .or_default()
                .insert(venue, pos.clone());
        }
    }
    by_symbol
}

fn round_up_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).ceil() * tick
}

fn round_down_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).floor() * tick
}
