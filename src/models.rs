use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn inverse(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Taker order, unfilled remainder is cancelled
    MarketIoc,
    /// Maker order, rejected by the venue if it would immediately match
    LimitPostOnly,
    Limit,
}

/// Venue identity. The maker role is assigned per opportunity, not per venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    VenueA,
    VenueB,
}

impl Venue {
    pub fn other(self) -> Venue {
        match self {
            Venue::VenueA => Venue::VenueB,
            Venue::VenueB => Venue::VenueA,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::VenueA => "venue_a",
            Venue::VenueB => "venue_b",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position as observed on a venue. Positive size = long, negative = short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub signed_size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
}

impl Position {
    pub fn side(&self) -> Side {
        if self.signed_size >= Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn abs_size(&self) -> Decimal {
        self.signed_size.abs()
    }
}

/// Order placement request, passed to a venue adapter.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub size_coins: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

/// Ack for a successfully submitted order. Transport and venue rejections
/// surface as `VenueError` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub fee_paid: Decimal,
}

/// Terminal-or-live state of an order as reported by a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState {
    Open,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusInfo {
    pub status: OrderState,
    pub filled_amount: Decimal,
}

/// A resting order as reported by `get_open_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// One fill out of the venue's private trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub order_id: String,
    pub qty: Decimal,
    pub price: Decimal,
}

/// Static per-market trading constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub lot_size: Decimal,
    pub tick_size: Decimal,
    pub min_order_size_coins: Decimal,
    pub min_notional_usd: Decimal,
}

/// Orderbook snapshot. Bids descending by price, asks ascending.
/// Invariant when healthy: asks[0].0 > bids[0].0.
#[derive(Debug, Clone)]
pub struct OrderbookSnapshot {
    pub symbol: String,
    pub venue: Venue,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp: Instant,
    pub sequence: Option<u64>,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask <= bid,
            _ => false,
        }
    }

    pub fn age_seconds(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.timestamp).as_secs_f64()
    }

    /// Sum of price * size over all levels on one side.
    pub fn depth_usd(levels: &[(Decimal, Decimal)]) -> Decimal {
        levels.iter().map(|(p, s)| p * s).sum()
    }

    pub fn bid_depth_usd(&self) -> Decimal {
        Self::depth_usd(&self.bids)
    }

    pub fn ask_depth_usd(&self) -> Decimal {
        Self::depth_usd(&self.asks)
    }
}

/// Persisted lifecycle of a hedged trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
    Rejected,
    Rollback,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Opening => "opening",
            TradeStatus::Open => "open",
            TradeStatus::Closing => "closing",
            TradeStatus::Closed => "closed",
            TradeStatus::Failed => "failed",
            TradeStatus::Rejected => "rejected",
            TradeStatus::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Option<TradeStatus> {
        Some(match s {
            "pending" => TradeStatus::Pending,
            "opening" => TradeStatus::Opening,
            "open" => TradeStatus::Open,
            "closing" => TradeStatus::Closing,
            "closed" => TradeStatus::Closed,
            "failed" => TradeStatus::Failed,
            "rejected" => TradeStatus::Rejected,
            "rollback" => TradeStatus::Rollback,
            _ => return None,
        })
    }

    /// Statuses that may still have on-exchange state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TradeStatus::Pending | TradeStatus::Opening | TradeStatus::Open | TradeStatus::Closing
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry on a trade record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub details: serde_json::Value,
}

impl TradeEvent {
    pub fn new(name: &str, details: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            name: name.to_string(),
            details,
        }
    }
}

/// Persisted trade record. Sides are keyed by venue identity; the execution
/// engine tracks the maker/hedge role separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side_a: Side,
    pub side_b: Side,
    pub size_usd: Decimal,
    pub entry_price_a: Decimal,
    pub entry_price_b: Decimal,
    pub status: TradeStatus,
    pub execution_state: String,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Decimal,
    pub close_reason: Option<String>,
    pub events: Vec<TradeEvent>,
    pub metadata: serde_json::Value,
}

impl TradeRecord {
    pub fn new(symbol: &str, side_a: Side, side_b: Side, size_usd: Decimal) -> Self {
        Self {
            trade_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side_a,
            side_b,
            size_usd,
            entry_price_a: Decimal::ZERO,
            entry_price_b: Decimal::ZERO,
            status: TradeStatus::Pending,
            execution_state: "PENDING".to_string(),
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            realized_pnl: Decimal::ZERO,
            close_reason: None,
            events: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Record an audit event. Must be called before any blocking I/O that
    /// the transition depends on.
    pub fn push_event(&mut self, name: &str, details: serde_json::Value) {
        self.events.push(TradeEvent::new(name, details));
    }

    pub fn side_on(&self, venue: Venue) -> Side {
        match venue {
            Venue::VenueA => self.side_a,
            Venue::VenueB => self.side_b,
        }
    }
}

/// Push update from a venue's position stream, used for fill detection.
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub venue: Venue,
    pub symbol: String,
    pub signed_size: Decimal,
}

/// Normalize a market symbol to its canonical form ("SEI-USD" -> "SEI").
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim_end_matches("-USD").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_inverse_roundtrips() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse().inverse(), Side::Sell);
    }

    #[test]
    fn orderbook_depth_and_cross_detection() {
        let book = OrderbookSnapshot {
            symbol: "BTC".to_string(),
            venue: Venue::VenueA,
            bids: vec![(dec!(100.00), dec!(5)), (dec!(99.00), dec!(10))],
            asks: vec![(dec!(101.00), dec!(3)), (dec!(102.00), dec!(2))],
            timestamp: Instant::now(),
            sequence: None,
        };
        assert_eq!(book.bid_depth_usd(), dec!(1490));
        assert_eq!(book.ask_depth_usd(), dec!(507));
        assert!(!book.is_crossed());

        let crossed = OrderbookSnapshot {
            bids: vec![(dec!(101.00), dec!(1))],
            asks: vec![(dec!(100.00), dec!(1))],
            ..book
        };
        assert!(crossed.is_crossed());
    }

    #[test]
    fn trade_status_string_roundtrip() {
        for status in [
            TradeStatus::Pending,
            TradeStatus::Opening,
            TradeStatus::Open,
            TradeStatus::Closing,
            TradeStatus::Closed,
            TradeStatus::Failed,
            TradeStatus::Rejected,
            TradeStatus::Rollback,
        ] {
            assert_eq!(TradeStatus::from_str(status.as_str()), Some(status));
        }
        assert!(TradeStatus::from_str("bogus").is_none());
    }

    #[test]
    fn symbol_normalization_strips_quote_suffix() {
        assert_eq!(normalize_symbol("SEI-USD"), "SEI");
        assert_eq!(normalize_symbol("BTC"), "BTC");
    }
}
