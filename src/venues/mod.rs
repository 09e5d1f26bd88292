//! Venue adapter surface.
//!
//! The engine drives both exchanges through `VenueAdapter`; one
//! implementation exists per venue. Adapters never call back into the
//! engine directly — fill detection hands them a narrow position callback
//! at registration time.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    FillRecord, MarketInfo, OpenOrder, OrderRequest, OrderResult, OrderStatusInfo,
    OrderbookSnapshot, Position, PositionUpdate, Side,
};

pub mod paper;

pub use paper::{PaperVenue, PaperVenueConfig};

/// Adapter-level failure taxonomy. The engine maps these onto its own
/// error kinds; `NotFound` in particular is never trusted as "unfilled"
/// without a trade-history check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    #[error("not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("crossed book")]
    CrossedBook,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("network error: {0}")]
    Network(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("venue error: {0}")]
    Unknown(String),
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Callback invoked by an adapter whenever its position stream reports a
/// change for a subscribed symbol.
pub type PositionCallback = Arc<dyn Fn(PositionUpdate) + Send + Sync>;

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Human-readable venue name for logs.
    fn name(&self) -> &str;

    async fn place_order(&self, req: &OrderRequest) -> VenueResult<OrderResult>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<bool>;

    async fn cancel_all_orders(&self, symbol: &str) -> VenueResult<bool>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> VenueResult<OrderStatusInfo>;

    async fn get_open_orders(&self, symbol: &str) -> VenueResult<Vec<OpenOrder>>;

    async fn fetch_open_positions(&self) -> VenueResult<Vec<Position>>;

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<Decimal>;

    async fn fetch_orderbook(&self, symbol: &str, depth: usize) -> VenueResult<OrderbookSnapshot>;

    async fn fetch_my_trades(&self, symbol: &str, limit: usize) -> VenueResult<Vec<FillRecord>>;

    async fn get_market_info(&self, symbol: &str) -> VenueResult<MarketInfo>;

    fn register_position_callback(&self, callback: PositionCallback);

    /// Reduce-only close of the current position; `original_side` is the
    /// side of the POSITION being closed, not of the close order.
    async fn close_position(
        &self,
        symbol: &str,
        original_side: Side,
        notional_usd: Decimal,
    ) -> VenueResult<OrderResult>;

    async fn shutdown(&self);
}

/// Fetch the position for one symbol, treating errors as absence is the
/// caller's decision.
pub async fn position_for(
    adapter: &Arc<dyn VenueAdapter>,
    symbol: &str,
) -> VenueResult<Option<Position>> {
    let positions = adapter.fetch_open_positions().await?;
    let target = crate::models::normalize_symbol(symbol);
    Ok(positions
        .into_iter()
        .find(|p| crate::models::normalize_symbol(&p.symbol) == target))
}
