//! Hedged execution.
//!
//! One entry = one maker leg rested on the designated maker venue and one
//! taker hedge on the other venue, driven by a per-symbol state machine
//! with verified rollback on partial failure.

pub mod engine;
pub mod fills;
pub mod rollback;
pub mod sizing;
pub mod state;
pub mod validator;

pub use engine::{EntryOutcome, EntryRequest, ExecutionEngine};
pub use rollback::{RollbackEngine, RollbackHandle, RollbackJob, EXECUTION_DUST_EPSILON};
pub use state::{ExecutionState, ExecutionStats, StatsSnapshot, TradeExecution};

use thiserror::Error;

/// Caller-facing outcome taxonomy for the execution engine. Everything
/// retryable or rollback-able is recovered internally; these are the
/// terminal shapes an entry or exit can take.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// An execution for this symbol is already active
    #[error("busy: execution already active for symbol")]
    Busy,
    /// An opposing resting order of ours would self-match
    #[error("self-match risk: opposing open order detected")]
    SelfMatchRisk,
    #[error("orderbook invalid: {0}")]
    OrderbookInvalid(String),
    /// Maker placement rejected; no position was opened
    #[error("leg1 placement failed: {0}")]
    Leg1PlaceFailed(String),
    /// Maker order timed out with a confirmed cancel; no rollback needed
    #[error("leg1 unfilled after timeout")]
    Leg1Unfilled,
    /// Maker filled but the hedge could not be placed; rollback queued
    #[error("leg2 placement failed: {0}")]
    Leg2PlaceFailed(String),
    /// Entry legs filled too far apart; flatten queued
    #[error("entry spread too wide: {0}")]
    BadEntrySpread(String),
    #[error("rollback failed: manual intervention required")]
    RollbackFailed,
    #[error("shutting down: no new entries accepted")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}
