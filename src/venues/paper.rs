//! Paper venue.
//!
//! In-process simulation of a perpetual-futures venue: resting maker
//! orders with configurable fill delay and partial fills, immediate taker
//! fills with slippage, a position ledger, private trade history and
//! scriptable failure injection. Used by the binary in paper mode and by
//! the execution tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use super::{PositionCallback, VenueAdapter, VenueError, VenueResult};
use crate::models::{
    FillRecord, MarketInfo, OpenOrder, OrderKind, OrderRequest, OrderResult, OrderState,
    OrderStatusInfo, OrderbookSnapshot, Position, PositionUpdate, Side, Venue,
};

/// How `cancel_order` behaves. The non-honest modes reproduce the races a
/// live venue exhibits around the cancel/fill boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelBehavior {
    /// Cancel removes the resting order and reports success.
    Honest,
    /// The order fills in the cancel window: position and trade history
    /// appear, cancel reports NOT_FOUND.
    GhostFill,
    /// Cancel reports NOT_FOUND with no fill (order already gone).
    NotFound,
}

#[derive(Debug, Clone)]
pub struct PaperVenueConfig {
    pub venue: Venue,
    pub name: String,
    /// Base simulated request latency
    pub latency_ms: u64,
    /// Extra random latency on top of the base
    pub latency_jitter_ms: u64,
    /// Maker orders fill this long after placement; `None` rests forever
    pub maker_fill_delay: Option<Duration>,
    /// When set, maker orders fill only this fraction at the fill deadline
    pub maker_partial_fill: Option<Decimal>,
    /// Adverse taker slippage in basis points
    pub taker_slippage_bps: f64,
    pub fee_rate: Decimal,
    pub lot_size: Decimal,
    pub tick_size: Decimal,
    pub min_order_size_coins: Decimal,
    pub min_notional_usd: Decimal,
}

impl PaperVenueConfig {
    pub fn new(venue: Venue, name: &str) -> Self {
        Self {
            venue,
            name: name.to_string(),
            latency_ms: 0,
            latency_jitter_ms: 0,
            maker_fill_delay: Some(Duration::from_secs(2)),
            maker_partial_fill: None,
            taker_slippage_bps: 2.0,
            fee_rate: Decimal::new(225, 6), // 0.0225% taker
            lot_size: Decimal::new(1, 4),   // 0.0001
            tick_size: Decimal::new(1, 2),  // 0.01
            min_order_size_coins: Decimal::new(1, 4),
            min_notional_usd: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    symbol: String,
    side: Side,
    size: Decimal,
    filled: Decimal,
    price: Option<Decimal>,
    fill_due: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    signed_size: Decimal,
    entry_price: Decimal,
}

#[derive(Default)]
struct PaperState {
    marks: HashMap<String, Decimal>,
    books: HashMap<String, OrderbookSnapshot>,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<String, PaperOrder>,
    fills: HashMap<String, Vec<FillRecord>>,
    injected_failures: VecDeque<VenueError>,
    cancel_behavior: Option<CancelBehavior>,
    market_info: HashMap<String, MarketInfo>,
    order_status_unavailable: bool,
    order_seq: u64,
}

pub struct PaperVenue {
    name: String,
    cfg: Mutex<PaperVenueConfig>,
    state: Mutex<PaperState>,
    callbacks: Mutex<Vec<PositionCallback>>,
}

impl PaperVenue {
    pub fn new(cfg: PaperVenueConfig) -> Arc<Self> {
        Arc::new(Self {
            name: cfg.name.clone(),
            cfg: Mutex::new(cfg),
            state: Mutex::new(PaperState::default()),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    // ── Scripting surface (paper mode wiring and tests) ─────────────────

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    pub fn set_orderbook(
        &self,
        symbol: &str,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    ) {
        let venue = self.cfg.lock().venue;
        let snapshot = OrderbookSnapshot {
            symbol: symbol.to_string(),
            venue,
            bids,
            asks,
            timestamp: Instant::now(),
            sequence: None,
        };
        self.state.lock().books.insert(symbol.to_string(), snapshot);
    }

    pub fn set_market_info(&self, symbol: &str, info: MarketInfo) {
        self.state
            .lock()
            .market_info
            .insert(symbol.to_string(), info);
    }

    pub fn inject_position(&self, symbol: &str, signed_size: Decimal, entry_price: Decimal) {
        self.state.lock().positions.insert(
            symbol.to_string(),
            PaperPosition {
                signed_size,
                entry_price,
            },
        );
    }

    /// Queue a failure for the next `place_order` call.
    pub fn inject_failure(&self, err: VenueError) {
        self.state.lock().injected_failures.push_back(err);
    }

    pub fn set_cancel_behavior(&self, behavior: CancelBehavior) {
        self.state.lock().cancel_behavior = Some(behavior);
    }

    /// Simulate a venue whose order-status endpoint 404s after cancel.
    pub fn set_order_status_unavailable(&self, unavailable: bool) {
        self.state.lock().order_status_unavailable = unavailable;
    }

    pub fn set_maker_fill_delay(&self, delay: Option<Duration>) {
        self.cfg.lock().maker_fill_delay = delay;
    }

    pub fn set_maker_partial_fill(&self, fraction: Option<Decimal>) {
        self.cfg.lock().maker_partial_fill = fraction;
    }

    pub fn position_size(&self, symbol: &str) -> Decimal {
        self.settle();
        self.state
            .lock()
            .positions
            .get(symbol)
            .map(|p| p.signed_size)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.settle();
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .count()
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn simulate_latency(&self) {
        let (base, jitter) = {
            let cfg = self.cfg.lock();
            (cfg.latency_ms, cfg.latency_jitter_ms)
        };
        if base == 0 && jitter == 0 {
            return;
        }
        let extra = if jitter > 0 {
            rand::thread_rng().gen_range(0..=jitter)
        } else {
            0
        };
        sleep(Duration::from_millis(base + extra)).await;
    }

    fn mark_for(state: &PaperState, symbol: &str) -> Option<Decimal> {
        if let Some(px) = state.marks.get(symbol) {
            return Some(*px);
        }
        let book = state.books.get(symbol)?;
        match (book.best_bid(), book.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            _ => None,
        }
    }

    /// Apply a fill to the position ledger and trade history. Returns the
    /// position update to broadcast after the state lock is released.
    fn apply_fill(
        state: &mut PaperState,
        venue: Venue,
        order_id: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> PositionUpdate {
        let pos = state.positions.entry(symbol.to_string()).or_default();
        let delta = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let prev = pos.signed_size;
        pos.signed_size += delta;
        if prev.is_zero() || prev.signum() != pos.signed_size.signum() {
            pos.entry_price = price;
        }

        state
            .fills
            .entry(symbol.to_string())
            .or_default()
            .push(FillRecord {
                order_id: order_id.to_string(),
                qty,
                price,
            });

        PositionUpdate {
            venue,
            symbol: symbol.to_string(),
            signed_size: pos.signed_size,
        }
    }

    fn fire_callbacks(&self, updates: Vec<PositionUpdate>) {
        if updates.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock().clone();
        for update in updates {
            for cb in &callbacks {
                cb(update.clone());
            }
        }
    }

    /// Apply fills for any resting order whose deadline has passed.
    fn settle(&self) {
        let now = Instant::now();
        let venue = self.cfg.lock().venue;
        let partial = self.cfg.lock().maker_partial_fill;
        let mut updates = Vec::new();
        {
            let mut state = self.state.lock();
            let due: Vec<String> = state
                .orders
                .values()
                .filter(|o| o.fill_due.map(|t| t <= now).unwrap_or(false))
                .map(|o| o.id.clone())
                .collect();

            for id in due {
                let Some(mut order) = state.orders.remove(&id) else {
                    continue;
                };
                let remaining = order.size - order.filled;
                let fill_qty = match partial {
                    Some(fraction) => (remaining * fraction).max(Decimal::ZERO),
                    None => remaining,
                };
                if fill_qty.is_zero() {
                    continue;
                }
                let price = order
                    .price
                    .or_else(|| Self::mark_for(&state, &order.symbol))
                    .unwrap_or(Decimal::ZERO);
                updates.push(Self::apply_fill(
                    &mut state,
                    venue,
                    &order.id,
                    &order.symbol,
                    order.side,
                    fill_qty,
                    price,
                ));
                order.filled += fill_qty;
                if order.filled < order.size {
                    // Partial fill: the remainder keeps resting with no
                    // further deadline until cancelled.
                    order.fill_due = None;
                    state.orders.insert(id, order);
                }
            }
        }
        self.fire_callbacks(updates);
    }

    fn next_order_id(state: &mut PaperState, prefix: &str) -> String {
        state.order_seq += 1;
        format!("{}-{}", prefix, state.order_seq)
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<OrderResult> {
        self.settle();
        self.simulate_latency().await;

        let cfg = self.cfg.lock().clone();
        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();

            if let Some(err) = state.injected_failures.pop_front() {
                warn!(venue = %cfg.name, symbol = %req.symbol, error = %err, "paper venue rejecting order (injected)");
                return Err(err);
            }

            if req.size_coins < cfg.min_order_size_coins {
                return Err(VenueError::BadRequest(format!(
                    "size {} below venue minimum {}",
                    req.size_coins, cfg.min_order_size_coins
                )));
            }

            match req.kind {
                OrderKind::MarketIoc => {
                    let mark = Self::mark_for(&state, &req.symbol)
                        .ok_or_else(|| VenueError::BadRequest("no price for symbol".into()))?;
                    let slip = Decimal::from_f64(cfg.taker_slippage_bps / 10_000.0)
                        .unwrap_or(Decimal::ZERO);
                    let price = match req.side {
                        Side::Buy => mark * (Decimal::ONE + slip),
                        Side::Sell => mark * (Decimal::ONE - slip),
                    };

                    let mut qty = req.size_coins;
                    if req.reduce_only {
                        let held = state
                            .positions
                            .get(&req.symbol)
                            .map(|p| p.signed_size.abs())
                            .unwrap_or(Decimal::ZERO);
                        qty = qty.min(held);
                    }

                    let id = Self::next_order_id(&mut state, "mkt");
                    if qty > Decimal::ZERO {
                        updates.push(Self::apply_fill(
                            &mut state,
                            cfg.venue,
                            &id,
                            &req.symbol,
                            req.side,
                            qty,
                            price,
                        ));
                    }
                    Ok(OrderResult {
                        order_id: id,
                        filled_size: qty,
                        avg_fill_price: price,
                        fee_paid: qty * price * cfg.fee_rate,
                    })
                }
                OrderKind::LimitPostOnly | OrderKind::Limit => {
                    let price = req
                        .price
                        .ok_or_else(|| VenueError::BadRequest("limit order requires price".into()))?;

                    if req.kind == OrderKind::LimitPostOnly {
                        if let Some(book) = state.books.get(&req.symbol) {
                            let crosses = match req.side {
                                Side::Sell => book.best_bid().map(|b| price <= b).unwrap_or(false),
                                Side::Buy => book.best_ask().map(|a| price >= a).unwrap_or(false),
                            };
                            if crosses {
                                return Err(VenueError::BadRequest(
                                    "post-only order would cross the book".into(),
                                ));
                            }
                        }
                    }

                    let id = Self::next_order_id(&mut state, "lim");
                    let order = PaperOrder {
                        id: id.clone(),
                        symbol: req.symbol.clone(),
                        side: req.side,
                        size: req.size_coins,
                        filled: Decimal::ZERO,
                        price: Some(price),
                        fill_due: cfg.maker_fill_delay.map(|d| Instant::now() + d),
                    };
                    state.orders.insert(id.clone(), order);
                    Ok(OrderResult {
                        order_id: id,
                        filled_size: Decimal::ZERO,
                        avg_fill_price: price,
                        fee_paid: Decimal::ZERO,
                    })
                }
            }
        };
        self.fire_callbacks(updates);
        result
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<bool> {
        self.settle();
        self.simulate_latency().await;

        let venue = self.cfg.lock().venue;
        let behavior = self
            .state
            .lock()
            .cancel_behavior
            .unwrap_or(CancelBehavior::Honest);

        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();
            match behavior {
                CancelBehavior::Honest => match state.orders.remove(order_id) {
                    Some(_) => {
                        debug!(symbol, order_id, "paper cancel confirmed");
                        Ok(true)
                    }
                    None => Err(VenueError::NotFound),
                },
                CancelBehavior::GhostFill => {
                    if let Some(order) = state.orders.remove(order_id) {
                        let remaining = order.size - order.filled;
                        let price = order
                            .price
                            .or_else(|| Self::mark_for(&state, symbol))
                            .unwrap_or(Decimal::ZERO);
                        if remaining > Decimal::ZERO {
                            updates.push(Self::apply_fill(
                                &mut state,
                                venue,
                                &order.id,
                                symbol,
                                order.side,
                                remaining,
                                price,
                            ));
                        }
                    }
                    Err(VenueError::NotFound)
                }
                CancelBehavior::NotFound => {
                    state.orders.remove(order_id);
                    Err(VenueError::NotFound)
                }
            }
        };
        self.fire_callbacks(updates);
        result
    }

    async fn cancel_all_orders(&self, symbol: &str) -> VenueResult<bool> {
        self.settle();
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let before = state.orders.len();
        state.orders.retain(|_, o| o.symbol != symbol);
        let removed = before - state.orders.len();
        if removed > 0 {
            debug!(symbol, removed, "paper cancel-all");
        }
        Ok(true)
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> VenueResult<OrderStatusInfo> {
        self.settle();
        self.simulate_latency().await;
        let state = self.state.lock();

        if state.order_status_unavailable {
            return Err(VenueError::NotFound);
        }

        if let Some(order) = state.orders.get(order_id) {
            let status = if order.filled > Decimal::ZERO {
                OrderState::PartiallyFilled
            } else {
                OrderState::Open
            };
            return Ok(OrderStatusInfo {
                status,
                filled_amount: order.filled,
            });
        }

        let filled: Decimal = state
            .fills
            .get(symbol)
            .map(|fills| {
                fills
                    .iter()
                    .filter(|f| f.order_id == order_id)
                    .map(|f| f.qty)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO);

        if filled > Decimal::ZERO {
            Ok(OrderStatusInfo {
                status: OrderState::Filled,
                filled_amount: filled,
            })
        } else {
            Err(VenueError::NotFound)
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>> {
        self.settle();
        self.simulate_latency().await;
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .map(|o| OpenOrder {
                id: o.id.clone(),
                side: o.side,
                price: o.price.unwrap_or(Decimal::ZERO),
                size: o.size - o.filled,
            })
            .collect())
    }

    async fn fetch_open_positions(&self) -> VenueResult<Vec<Position>> {
        self.settle();
        self.simulate_latency().await;
        let state = self.state.lock();
        Ok(state
            .positions
            .iter()
            .filter(|(_, p)| !p.signed_size.is_zero())
            .map(|(symbol, p)| {
                let mark = Self::mark_for(&state, symbol).unwrap_or(p.entry_price);
                Position {
                    symbol: symbol.clone(),
                    signed_size: p.signed_size,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.entry_price) * p.signed_size,
                    leverage: Decimal::ONE,
                }
            })
            .collect())
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<Decimal> {
        self.simulate_latency().await;
        let state = self.state.lock();
        Self::mark_for(&state, symbol).ok_or(VenueError::NotFound)
    }

    async fn fetch_orderbook(&self, symbol: &str, _depth: usize) -> VenueResult<OrderbookSnapshot> {
        self.simulate_latency().await;
        let state = self.state.lock();
        state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::Network("no orderbook for symbol".into()))
    }

    async fn fetch_my_trades(&self, symbol: &str, limit: usize) -> VenueResult<Vec<FillRecord>> {
        self.settle();
        self.simulate_latency().await;
        let state = self.state.lock();
        let fills = state.fills.get(symbol).cloned().unwrap_or_default();
        Ok(fills.into_iter().rev().take(limit).collect())
    }

    async fn get_market_info(&self, symbol: &str) -> VenueResult<MarketInfo> {
        self.simulate_latency().await;
        let state = self.state.lock();
        if let Some(info) = state.market_info.get(symbol) {
            return Ok(info.clone());
        }
        let cfg = self.cfg.lock();
        Ok(MarketInfo {
            lot_size: cfg.lot_size,
            tick_size: cfg.tick_size,
            min_order_size_coins: cfg.min_order_size_coins,
            min_notional_usd: cfg.min_notional_usd,
        })
    }

    fn register_position_callback(&self, callback: PositionCallback) {
        self.callbacks.lock().push(callback);
    }

    async fn close_position(
        &self,
        symbol: &str,
        original_side: Side,
        _notional_usd: Decimal,
    ) -> VenueResult<OrderResult> {
        self.settle();
        self.simulate_latency().await;

        let venue = self.cfg.lock().venue;
        let fee_rate = self.cfg.lock().fee_rate;
        let mut updates = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let held = state
                .positions
                .get(symbol)
                .map(|p| p.signed_size)
                .unwrap_or(Decimal::ZERO);

            if held.is_zero() {
                let id = Self::next_order_id(&mut state, "cls");
                return Ok(OrderResult {
                    order_id: id,
                    filled_size: Decimal::ZERO,
                    avg_fill_price: Decimal::ZERO,
                    fee_paid: Decimal::ZERO,
                });
            }

            let close_side = if held > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            if (held > Decimal::ZERO) != (original_side == Side::Buy) {
                warn!(symbol, %original_side, held = %held, "close_position side hint disagrees with ledger");
            }

            let price = Self::mark_for(&state, symbol)
                .ok_or_else(|| VenueError::BadRequest("no price for symbol".into()))?;
            let qty = held.abs();
            let id = Self::next_order_id(&mut state, "cls");
            updates.push(Self::apply_fill(
                &mut state,
                venue,
                &id,
                symbol,
                close_side,
                qty,
                price,
            ));
            Ok(OrderResult {
                order_id: id,
                filled_size: qty,
                avg_fill_price: price,
                fee_paid: qty * price * fee_rate,
            })
        };
        self.fire_callbacks(updates);
        result
    }

    async fn shutdown(&self) {
        info!(venue = %self.cfg.lock().name, "paper venue shut down");
    }
}
