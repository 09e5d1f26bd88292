//! Execution state machine types and counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Instant;

use crate::models::{Side, Venue};

/// States of one hedged entry. Transitions are strictly forward:
/// PENDING -> LEG1_SENT -> LEG1_FILLED -> LEG2_SENT -> COMPLETE, with
/// FAILED and the rollback chain as the only exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Leg1Sent,
    Leg1Filled,
    Leg2Sent,
    Complete,
    /// Transient label for a micro partial fill still awaiting either
    /// enough size to hedge or an abort-and-flatten.
    PartialFill,
    RollbackQueued,
    RollbackInProgress,
    RollbackDone,
    RollbackFailed,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Leg1Sent => "LEG1_SENT",
            ExecutionState::Leg1Filled => "LEG1_FILLED",
            ExecutionState::Leg2Sent => "LEG2_SENT",
            ExecutionState::Complete => "COMPLETE",
            ExecutionState::PartialFill => "PARTIAL_FILL",
            ExecutionState::RollbackQueued => "ROLLBACK_QUEUED",
            ExecutionState::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            ExecutionState::RollbackDone => "ROLLBACK_DONE",
            ExecutionState::RollbackFailed => "ROLLBACK_FAILED",
            ExecutionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Complete
                | ExecutionState::RollbackDone
                | ExecutionState::RollbackFailed
                | ExecutionState::Failed
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory tracker for one hedged execution. Owned exclusively by the
/// task driving the entry; other components only ever see snapshots.
#[derive(Debug, Clone)]
pub struct TradeExecution {
    pub trade_id: String,
    pub symbol: String,
    pub state: ExecutionState,
    pub maker_venue: Venue,
    pub maker_side: Side,
    pub hedge_side: Side,
    pub maker_order_id: Option<String>,
    pub hedge_order_id: Option<String>,
    pub maker_filled: bool,
    pub hedge_filled: bool,
    pub planned_size_usd: Decimal,
    pub planned_quantity_coins: Decimal,
    pub actual_filled_quantity: Decimal,
    pub entry_price_maker: Decimal,
    pub entry_price_hedge: Decimal,
    pub started: Instant,
    pub error: Option<String>,
    pub rollback_attempts: u32,
}

impl TradeExecution {
    pub fn new(
        trade_id: &str,
        symbol: &str,
        maker_venue: Venue,
        maker_side: Side,
        hedge_side: Side,
        planned_size_usd: Decimal,
        planned_quantity_coins: Decimal,
    ) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            symbol: symbol.to_string(),
            state: ExecutionState::Pending,
            maker_venue,
            maker_side,
            hedge_side,
            maker_order_id: None,
            hedge_order_id: None,
            maker_filled: false,
            hedge_filled: false,
            planned_size_usd,
            planned_quantity_coins,
            actual_filled_quantity: Decimal::ZERO,
            entry_price_maker: Decimal::ZERO,
            entry_price_hedge: Decimal::ZERO,
            started: Instant::now(),
            error: None,
            rollback_attempts: 0,
        }
    }

    pub fn hedge_venue(&self) -> Venue {
        self.maker_venue.other()
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Side held on `venue` once both legs are in.
    pub fn side_on(&self, venue: Venue) -> Side {
        if venue == self.maker_venue {
            self.maker_side
        } else {
            self.hedge_side
        }
    }
}

/// Engine-wide counters, shared with the rollback worker.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub total: AtomicU64,
    pub successful: AtomicU64,
    pub failed: AtomicU64,
    pub rollbacks_triggered: AtomicU64,
    pub rollbacks_successful: AtomicU64,
    pub rollbacks_failed: AtomicU64,
    pub pending_rollbacks: AtomicU64,
}

impl ExecutionStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_states: HashMap<String, ExecutionState>) -> StatsSnapshot {
        let mut per_state: HashMap<&'static str, u64> = HashMap::new();
        for state in active_states.values() {
            *per_state.entry(state.as_str()).or_insert(0) += 1;
        }
        StatsSnapshot {
            total_executions: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rollbacks_triggered: self.rollbacks_triggered.load(Ordering::Relaxed),
            rollbacks_successful: self.rollbacks_successful.load(Ordering::Relaxed),
            rollbacks_failed: self.rollbacks_failed.load(Ordering::Relaxed),
            pending_rollbacks: self.pending_rollbacks.load(Ordering::Relaxed),
            active_executions: active_states.len() as u64,
            active_states: per_state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_executions: u64,
    pub successful: u64,
    pub failed: u64,
    pub rollbacks_triggered: u64,
    pub rollbacks_successful: u64,
    pub rollbacks_failed: u64,
    pub pending_rollbacks: u64,
    pub active_executions: u64,
    pub active_states: HashMap<&'static str, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(ExecutionState::Complete.is_terminal());
        assert!(ExecutionState::RollbackDone.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Leg1Sent.is_terminal());
        assert!(!ExecutionState::RollbackQueued.is_terminal());
    }

    #[test]
    fn execution_tracks_maker_and_hedge_roles() {
        let exec = TradeExecution::new(
            "t1",
            "BTC",
            Venue::VenueA,
            Side::Buy,
            Side::Sell,
            dec!(1000),
            dec!(0.02),
        );
        assert_eq!(exec.hedge_venue(), Venue::VenueB);
        assert_eq!(exec.side_on(Venue::VenueA), Side::Buy);
        assert_eq!(exec.side_on(Venue::VenueB), Side::Sell);
    }

    #[test]
    fn stats_snapshot_counts_active_states() {
        let stats = ExecutionStats::default();
        ExecutionStats::bump(&stats.total);
        ExecutionStats::bump(&stats.successful);

        let mut active = HashMap::new();
        active.insert("BTC".to_string(), ExecutionState::Leg1Sent);
        active.insert("ETH".to_string(), ExecutionState::Leg1Sent);

        let snap = stats.snapshot(active);
        assert_eq!(snap.total_executions, 1);
        assert_eq!(snap.active_executions, 2);
        assert_eq!(snap.active_states.get("LEG1_SENT"), Some(&2));
    }
}
