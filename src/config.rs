//! Engine configuration.
//!
//! Every knob has a production default and an env-var override, following
//! the `Default` + `from_env()` pattern used across the codebase.

use std::env;

fn env_f64(var: &str, default: f64) -> f64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn env_u32(var: &str, default: u32) -> u32 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_bool(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Orderbook quality thresholds for maker-order validation.
#[derive(Debug, Clone)]
pub struct ValidatorPolicy {
    /// Minimum depth (USD) on the side our resting order fills against
    pub min_depth_usd: f64,
    /// Minimum depth (USD) on the opposite side
    pub min_opposite_depth_usd: f64,
    pub min_bid_levels: usize,
    pub min_ask_levels: usize,
    /// Maximum bid/ask spread as a fraction of mid (0.01 = 1%)
    pub max_spread_percent: f64,
    pub warn_spread_percent: f64,
    pub max_staleness_seconds: f64,
    pub warn_staleness_seconds: f64,
    pub excellent_depth_multiple: f64,
    pub good_depth_multiple: f64,
    pub marginal_depth_multiple: f64,
    /// Window after a websocket reconnect during which cached books are distrusted
    pub post_reconnect_cooldown_seconds: f64,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            min_depth_usd: 500.0,
            min_opposite_depth_usd: 250.0,
            min_bid_levels: 3,
            min_ask_levels: 3,
            max_spread_percent: 0.01,
            warn_spread_percent: 0.005,
            max_staleness_seconds: 10.0,
            warn_staleness_seconds: 5.0,
            excellent_depth_multiple: 10.0,
            good_depth_multiple: 5.0,
            marginal_depth_multiple: 2.0,
            post_reconnect_cooldown_seconds: 30.0,
        }
    }
}

impl ValidatorPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_depth_usd: env_f64("OB_MIN_DEPTH_USD", d.min_depth_usd),
            min_opposite_depth_usd: env_f64("OB_MIN_OPPOSITE_DEPTH_USD", d.min_opposite_depth_usd),
            min_bid_levels: env_u32("OB_MIN_BID_LEVELS", d.min_bid_levels as u32) as usize,
            min_ask_levels: env_u32("OB_MIN_ASK_LEVELS", d.min_ask_levels as u32) as usize,
            max_spread_percent: env_f64("OB_MAX_SPREAD_PCT", d.max_spread_percent),
            warn_spread_percent: env_f64("OB_WARN_SPREAD_PCT", d.warn_spread_percent),
            max_staleness_seconds: env_f64("OB_MAX_STALENESS_SECONDS", d.max_staleness_seconds),
            warn_staleness_seconds: env_f64("OB_WARN_STALENESS_SECONDS", d.warn_staleness_seconds),
            excellent_depth_multiple: d.excellent_depth_multiple,
            good_depth_multiple: d.good_depth_multiple,
            marginal_depth_multiple: d.marginal_depth_multiple,
            post_reconnect_cooldown_seconds: env_f64(
                "OB_POST_RECONNECT_COOLDOWN_SECONDS",
                d.post_reconnect_cooldown_seconds,
            ),
        }
    }
}

/// Hedged-entry execution knobs.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Base maker fill-wait timeout before liquidity/volatility scaling
    pub maker_timeout_base_seconds: f64,
    pub maker_timeout_min_seconds: f64,
    pub maker_timeout_max_seconds: f64,
    /// Timeout multiplier when same-side depth is >= 2x the trade size
    pub liquidity_timeout_multiplier: f64,
    /// Maker retries with price chase after a confirmed-unfilled timeout
    pub maker_max_retries: u32,
    pub maker_retry_delay_seconds: f64,
    /// Per-attempt price adjustment fraction for the chase (0.001 = 0.1%)
    pub price_chase_increment: f64,
    /// Position polling cadence inside fill-wait loops
    pub fill_poll_interval_seconds: f64,
    /// How long the hedge leg gets to reflect in the position feed
    pub hedge_settle_seconds: f64,
    /// Post-fill entry spread gate
    pub max_entry_spread_pct: f64,
    pub auto_close_bad_entries: bool,
    pub compliance_check_enabled: bool,
    pub compliance_cache_ttl_seconds: f64,
    /// Fraction of planned size at which a position counts as a fill
    pub fill_match_fraction: f64,
    /// Ghost-fill poll schedule after a cancel: start, per-attempt increment, cap, attempts
    pub ghost_check_initial_delay: f64,
    pub ghost_check_delay_step: f64,
    pub ghost_check_delay_cap: f64,
    pub ghost_check_attempts: u32,
    /// Graceful shutdown budget for active executions
    pub graceful_timeout_seconds: f64,
    /// Fill-wait ceiling once shutdown is in progress
    pub shutdown_fill_wait_seconds: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            maker_timeout_base_seconds: 60.0,
            maker_timeout_min_seconds: 30.0,
            maker_timeout_max_seconds: 90.0,
            liquidity_timeout_multiplier: 0.5,
            maker_max_retries: 2,
            maker_retry_delay_seconds: 2.0,
            price_chase_increment: 0.001,
            fill_poll_interval_seconds: 0.5,
            hedge_settle_seconds: 0.5,
            max_entry_spread_pct: 0.005,
            auto_close_bad_entries: true,
            compliance_check_enabled: true,
            compliance_cache_ttl_seconds: 5.0,
            fill_match_fraction: 0.95,
            ghost_check_initial_delay: 0.3,
            ghost_check_delay_step: 0.05,
            ghost_check_delay_cap: 1.0,
            ghost_check_attempts: 20,
            graceful_timeout_seconds: 30.0,
            shutdown_fill_wait_seconds: 2.0,
        }
    }
}

impl ExecutionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            maker_timeout_base_seconds: env_f64(
                "MAKER_ORDER_TIMEOUT_SECONDS",
                d.maker_timeout_base_seconds,
            ),
            maker_timeout_min_seconds: env_f64(
                "MAKER_ORDER_MIN_TIMEOUT_SECONDS",
                d.maker_timeout_min_seconds,
            ),
            maker_timeout_max_seconds: env_f64(
                "MAKER_ORDER_MAX_TIMEOUT_SECONDS",
                d.maker_timeout_max_seconds,
            ),
            liquidity_timeout_multiplier: env_f64(
                "MAKER_ORDER_LIQUIDITY_TIMEOUT_MULTIPLIER",
                d.liquidity_timeout_multiplier,
            ),
            maker_max_retries: env_u32("MAKER_ORDER_MAX_RETRIES", d.maker_max_retries),
            maker_retry_delay_seconds: env_f64(
                "MAKER_ORDER_RETRY_DELAY_SECONDS",
                d.maker_retry_delay_seconds,
            ),
            price_chase_increment: env_f64(
                "MAKER_ORDER_PRICE_ADJUSTMENT_PCT",
                d.price_chase_increment,
            ),
            fill_poll_interval_seconds: env_f64(
                "FILL_POLL_INTERVAL_SECONDS",
                d.fill_poll_interval_seconds,
            ),
            hedge_settle_seconds: env_f64("HEDGE_SETTLE_SECONDS", d.hedge_settle_seconds),
            max_entry_spread_pct: env_f64("MAX_ENTRY_SPREAD_PCT", d.max_entry_spread_pct),
            auto_close_bad_entries: env_bool("AUTO_CLOSE_BAD_ENTRIES", d.auto_close_bad_entries),
            compliance_check_enabled: env_bool(
                "COMPLIANCE_CHECK_ENABLED",
                d.compliance_check_enabled,
            ),
            compliance_cache_ttl_seconds: d.compliance_cache_ttl_seconds,
            fill_match_fraction: d.fill_match_fraction,
            ghost_check_initial_delay: d.ghost_check_initial_delay,
            ghost_check_delay_step: d.ghost_check_delay_step,
            ghost_check_delay_cap: d.ghost_check_delay_cap,
            ghost_check_attempts: env_u32("GHOST_CHECK_ATTEMPTS", d.ghost_check_attempts),
            graceful_timeout_seconds: env_f64(
                "GRACEFUL_SHUTDOWN_TIMEOUT_SECONDS",
                d.graceful_timeout_seconds,
            ),
            shutdown_fill_wait_seconds: d.shutdown_fill_wait_seconds,
        }
    }
}

/// Rollback retry policy.
#[derive(Debug, Clone)]
pub struct RollbackConfig {
    pub max_attempts: u32,
    /// Exponential backoff base: delay = base * 2^attempt
    pub base_delay_seconds: f64,
    /// Initial wait so in-flight orders can land before the first attempt
    pub settle_delay_seconds: f64,
    /// Pause between a close order and its position re-verification
    pub verify_delay_seconds: f64,
    pub queue_capacity: usize,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 2.0,
            settle_delay_seconds: 3.0,
            verify_delay_seconds: 1.0,
            queue_capacity: 64,
        }
    }
}

impl RollbackConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_u32("ROLLBACK_MAX_ATTEMPTS", d.max_attempts),
            base_delay_seconds: env_f64("ROLLBACK_DELAY_SECONDS", d.base_delay_seconds),
            settle_delay_seconds: env_f64("ROLLBACK_SETTLE_SECONDS", d.settle_delay_seconds),
            verify_delay_seconds: d.verify_delay_seconds,
            queue_capacity: d.queue_capacity,
        }
    }
}

/// Reconciler cadence and drift-handling policy.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval_seconds: f64,
    /// Adopt hedged ghost pairs into the store instead of closing them
    pub auto_import_ghosts: bool,
    pub auto_close_ghosts: bool,
    /// PENDING trades older than this are zombie candidates
    pub pending_stale_seconds: f64,
    /// Extra buffer on top of maker_timeout * retries for OPENING staleness
    pub opening_stale_buffer_seconds: f64,
    /// Quantity mismatch tolerance as a fraction of the larger side
    pub qty_tolerance_pct: f64,
    /// Mismatches below this notional are ignored
    pub min_mismatch_usd: f64,
    pub soft_close_enabled: bool,
    pub soft_close_max_attempts: u32,
    pub soft_close_timeout_seconds: f64,
    /// Age ceiling for the late-fill sweep
    pub late_fill_window_seconds: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300.0,
            auto_import_ghosts: false,
            auto_close_ghosts: true,
            pending_stale_seconds: 120.0,
            opening_stale_buffer_seconds: 120.0,
            qty_tolerance_pct: 0.05,
            min_mismatch_usd: 5.0,
            soft_close_enabled: true,
            soft_close_max_attempts: 2,
            soft_close_timeout_seconds: 15.0,
            late_fill_window_seconds: 3600.0,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval_seconds: env_f64("RECONCILE_INTERVAL_SECONDS", d.interval_seconds),
            auto_import_ghosts: env_bool("RECONCILE_AUTO_IMPORT_GHOSTS", d.auto_import_ghosts),
            auto_close_ghosts: env_bool("RECONCILE_AUTO_CLOSE_GHOSTS", d.auto_close_ghosts),
            pending_stale_seconds: d.pending_stale_seconds,
            opening_stale_buffer_seconds: d.opening_stale_buffer_seconds,
            qty_tolerance_pct: env_f64("RECONCILE_QTY_TOLERANCE_PCT", d.qty_tolerance_pct),
            min_mismatch_usd: d.min_mismatch_usd,
            soft_close_enabled: env_bool("RECONCILE_SOFT_CLOSE_ENABLED", d.soft_close_enabled),
            soft_close_max_attempts: env_u32(
                "RECONCILE_SOFT_CLOSE_MAX_ATTEMPTS",
                d.soft_close_max_attempts,
            ),
            soft_close_timeout_seconds: env_f64(
                "RECONCILE_SOFT_CLOSE_TIMEOUT_SECONDS",
                d.soft_close_timeout_seconds,
            ),
            late_fill_window_seconds: d.late_fill_window_seconds,
        }
    }
}

/// Top-level runtime configuration for the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub execution: ExecutionConfig,
    pub rollback: RollbackConfig,
    pub reconciler: ReconcilerConfig,
    pub validator: ValidatorPolicy,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./hedgebot.db".to_string()),
            execution: ExecutionConfig::from_env(),
            rollback: RollbackConfig::from_env(),
            reconciler: ReconcilerConfig::from_env(),
            validator: ValidatorPolicy::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = ExecutionConfig::default();
        assert!(cfg.maker_timeout_min_seconds <= cfg.maker_timeout_base_seconds);
        assert!(cfg.maker_timeout_base_seconds <= cfg.maker_timeout_max_seconds);
        assert!(cfg.fill_match_fraction > 0.5 && cfg.fill_match_fraction <= 1.0);

        let policy = ValidatorPolicy::default();
        assert!(policy.marginal_depth_multiple < policy.good_depth_multiple);
        assert!(policy.good_depth_multiple < policy.excellent_depth_multiple);
        assert!(policy.warn_spread_percent < policy.max_spread_percent);
    }
}
