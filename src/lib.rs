//! HedgeBot Backend Library
//!
//! Exposes the hedged execution core for use by binaries and tests:
//! venue adapters, the execution state machine, the rollback worker and
//! the reconciler.

pub mod config;
pub mod events;
pub mod execution;
pub mod models;
pub mod orderbook;
pub mod reconcile;
pub mod store;
pub mod venues;
pub mod volatility;

pub use config::AppConfig;
pub use events::{EngineEvent, EventBus};
pub use execution::{
    EntryOutcome, EntryRequest, ExecError, ExecutionEngine, ExecutionState, StatsSnapshot,
};
pub use reconcile::Reconciler;
pub use store::{SqliteTradeStore, TradeStore};
pub use venues::{PaperVenue, PaperVenueConfig, VenueAdapter, VenueError};
