//! Orderbook validation for maker placement.
//!
//! Before resting a post-only order the book is graded against the policy
//! thresholds: emptiness, crossedness, staleness, level counts, depth on
//! both sides, depth relative to the trade size and spread. The first
//! failing check short-circuits with a recommended action; passing books
//! are classified EXCELLENT / GOOD / MARGINAL by the worst of their depth,
//! spread and staleness buckets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ValidatorPolicy;
use crate::models::{OrderbookSnapshot, Side, Venue};
use crate::orderbook::OrderbookProvider;
use crate::venues::VenueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderbookQuality {
    Excellent,
    Good,
    Marginal,
    Insufficient,
    Crossed,
    Stale,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    Proceed,
    Wait,
    UseMarketOrder,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub quality: OrderbookQuality,
    pub reason: String,
    pub bid_depth_usd: Decimal,
    pub ask_depth_usd: Decimal,
    /// Spread as a fraction of mid
    pub spread_percent: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub staleness_seconds: f64,
    pub action: RecommendedAction,
}

impl ValidationOutcome {
    fn rejected(
        quality: OrderbookQuality,
        reason: impl Into<String>,
        action: RecommendedAction,
    ) -> Self {
        Self {
            valid: false,
            quality,
            reason: reason.into(),
            bid_depth_usd: Decimal::ZERO,
            ask_depth_usd: Decimal::ZERO,
            spread_percent: None,
            best_bid: None,
            best_ask: None,
            bid_levels: 0,
            ask_levels: 0,
            staleness_seconds: 0.0,
            action,
        }
    }

    /// Depth on the side our resting order will fill against.
    pub fn same_side_depth_usd(&self, side: Side) -> Decimal {
        match side {
            // A resting SELL is lifted by buyers: the bid side is ours.
            Side::Sell => self.bid_depth_usd,
            Side::Buy => self.ask_depth_usd,
        }
    }
}

pub struct OrderbookValidator {
    policy: ValidatorPolicy,
    /// Short-TTL dedup of identical-outcome log lines; never short-circuits
    /// a fresh evaluation.
    log_cache: Mutex<HashMap<(String, Side, u64), (Instant, OrderbookQuality)>>,
}

impl OrderbookValidator {
    pub fn new(policy: ValidatorPolicy) -> Self {
        Self {
            policy,
            log_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &ValidatorPolicy {
        &self.policy
    }

    /// Full validation against a provider-managed book: applies the
    /// post-reconnect cooldown and crossed-book REST refresh before the
    /// pure snapshot checks.
    pub async fn validate_with_provider(
        &self,
        provider: &Arc<OrderbookProvider>,
        venue: Venue,
        symbol: &str,
        side: Side,
        trade_size_usd: Decimal,
    ) -> ValidationOutcome {
        if provider.is_in_cooldown() {
            let remaining = provider.cooldown_remaining();
            info!(
                symbol,
                remaining_secs = remaining,
                "post-reconnect cooldown, refreshing via REST"
            );
            match provider.fetch_rest(venue, symbol, true).await {
                Ok(snapshot) => {
                    return self.validate_for_maker(
                        symbol,
                        side,
                        trade_size_usd,
                        &snapshot,
                        Instant::now(),
                    );
                }
                Err(VenueError::CrossedBook) => {
                    return ValidationOutcome::rejected(
                        OrderbookQuality::Crossed,
                        "post-reconnect cooldown and the book is still crossed",
                        RecommendedAction::Wait,
                    );
                }
                Err(e) => {
                    return ValidationOutcome::rejected(
                        OrderbookQuality::Empty,
                        format!("post-reconnect cooldown, REST refresh failed: {e}"),
                        RecommendedAction::Wait,
                    );
                }
            }
        }

        let snapshot = match provider.get(venue, symbol).await {
            Ok(s) => s,
            Err(e) => {
                return ValidationOutcome::rejected(
                    OrderbookQuality::Empty,
                    format!("no orderbook available: {e}"),
                    RecommendedAction::Wait,
                );
            }
        };

        // A crossed cached snapshot forces a REST refresh once before
        // giving up; the stale entry must not be served again.
        if snapshot.is_crossed() {
            warn!(symbol, %venue, "cached book crossed, forcing REST refresh");
            provider.invalidate(venue, symbol);
            match provider.fetch_rest(venue, symbol, true).await {
                Ok(fresh) => {
                    return self.validate_for_maker(
                        symbol,
                        side,
                        trade_size_usd,
                        &fresh,
                        Instant::now(),
                    );
                }
                Err(_) => {
                    return ValidationOutcome::rejected(
                        OrderbookQuality::Crossed,
                        "crossed book persists after REST refresh",
                        RecommendedAction::Wait,
                    );
                }
            }
        }

        self.validate_for_maker(symbol, side, trade_size_usd, &snapshot, Instant::now())
    }

    /// Pure snapshot validation. `now` is injected so staleness is
    /// deterministic under test.
    pub fn validate_for_maker(
        &self,
        symbol: &str,
        side: Side,
        trade_size_usd: Decimal,
        snapshot: &OrderbookSnapshot,
        now: Instant,
    ) -> ValidationOutcome {
        let outcome = self.evaluate(side, trade_size_usd, snapshot, now);
        self.log_outcome(symbol, side, trade_size_usd, &outcome);
        outcome
    }

    fn evaluate(
        &self,
        side: Side,
        trade_size_usd: Decimal,
        snapshot: &OrderbookSnapshot,
        now: Instant,
    ) -> ValidationOutcome {
        let p = &self.policy;

        if snapshot.bids.is_empty() && snapshot.asks.is_empty() {
            return ValidationOutcome::rejected(
                OrderbookQuality::Empty,
                "orderbook is empty",
                RecommendedAction::Skip,
            );
        }

        // Counterparties for our resting order must exist.
        if side == Side::Sell && snapshot.bids.is_empty() {
            return ValidationOutcome::rejected(
                OrderbookQuality::Empty,
                "No bids: nobody to fill a resting SELL",
                RecommendedAction::Skip,
            );
        }
        if side == Side::Buy && snapshot.asks.is_empty() {
            return ValidationOutcome::rejected(
                OrderbookQuality::Empty,
                "No asks: nobody to fill a resting BUY",
                RecommendedAction::Skip,
            );
        }

        let best_bid = snapshot.best_bid();
        let best_ask = snapshot.best_ask();

        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            if ask <= bid {
                let mut outcome = ValidationOutcome::rejected(
                    OrderbookQuality::Crossed,
                    format!("crossed book: ask {ask} <= bid {bid}"),
                    RecommendedAction::Wait,
                );
                outcome.best_bid = best_bid;
                outcome.best_ask = best_ask;
                return outcome;
            }
        }

        let staleness = snapshot.age_seconds(now);
        if staleness > p.max_staleness_seconds {
            let mut outcome = ValidationOutcome::rejected(
                OrderbookQuality::Stale,
                format!(
                    "stale orderbook: {staleness:.1}s old (max {:.1}s)",
                    p.max_staleness_seconds
                ),
                RecommendedAction::Wait,
            );
            outcome.staleness_seconds = staleness;
            return outcome;
        }

        let bid_levels = snapshot.bids.len();
        let ask_levels = snapshot.asks.len();
        if bid_levels < p.min_bid_levels || ask_levels < p.min_ask_levels {
            return ValidationOutcome::rejected(
                OrderbookQuality::Insufficient,
                format!(
                    "too few levels: {bid_levels} bids / {ask_levels} asks (need {}/{})",
                    p.min_bid_levels, p.min_ask_levels
                ),
                RecommendedAction::Skip,
            );
        }

        let bid_depth = snapshot.bid_depth_usd();
        let ask_depth = snapshot.ask_depth_usd();
        let (same_depth, opposite_depth) = match side {
            Side::Sell => (bid_depth, ask_depth),
            Side::Buy => (ask_depth, bid_depth),
        };

        let min_depth = Decimal::from_f64(p.min_depth_usd).unwrap_or(Decimal::ZERO);
        let min_opp = Decimal::from_f64(p.min_opposite_depth_usd).unwrap_or(Decimal::ZERO);
        let mut base = ValidationOutcome {
            valid: false,
            quality: OrderbookQuality::Insufficient,
            reason: String::new(),
            bid_depth_usd: bid_depth,
            ask_depth_usd: ask_depth,
            spread_percent: None,
            best_bid,
            best_ask,
            bid_levels,
            ask_levels,
            staleness_seconds: staleness,
            action: RecommendedAction::Skip,
        };

        if same_depth < min_depth {
            base.reason = format!("same-side depth ${same_depth:.2} below minimum ${min_depth}");
            return base;
        }
        if opposite_depth < min_opp {
            base.reason =
                format!("opposite depth ${opposite_depth:.2} below minimum ${min_opp}");
            return base;
        }

        // Depth relative to the trade: too thin means our maker order
        // would dominate the book and never fill cleanly.
        let depth_multiple = if trade_size_usd > Decimal::ZERO {
            (same_depth / trade_size_usd).to_f64().unwrap_or(0.0)
        } else {
            f64::INFINITY
        };
        if depth_multiple < p.marginal_depth_multiple {
            base.reason = format!(
                "depth {depth_multiple:.1}x trade size (need {:.1}x): book too thin for maker",
                p.marginal_depth_multiple
            );
            base.action = RecommendedAction::UseMarketOrder;
            return base;
        }

        let spread_pct = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                let mid = (bid + ask) / Decimal::TWO;
                if mid > Decimal::ZERO {
                    Some((ask - bid) / mid)
                } else {
                    None
                }
            }
            _ => None,
        };
        base.spread_percent = spread_pct;

        let spread_f = spread_pct.and_then(|s| s.to_f64()).unwrap_or(0.0);
        if spread_f > p.max_spread_percent {
            base.quality = OrderbookQuality::Insufficient;
            base.reason = format!(
                "Spread {:.3}% above maximum {:.3}%",
                spread_f * 100.0,
                p.max_spread_percent * 100.0
            );
            base.action = RecommendedAction::Wait;
            return base;
        }

        // Worst-of classification across depth, spread and staleness.
        let depth_bucket = if depth_multiple >= p.excellent_depth_multiple {
            OrderbookQuality::Excellent
        } else if depth_multiple >= p.good_depth_multiple {
            OrderbookQuality::Good
        } else {
            OrderbookQuality::Marginal
        };
        let spread_bucket = if spread_f > p.warn_spread_percent {
            OrderbookQuality::Marginal
        } else {
            OrderbookQuality::Excellent
        };
        let staleness_bucket = if staleness > p.warn_staleness_seconds {
            OrderbookQuality::Marginal
        } else {
            OrderbookQuality::Excellent
        };

        base.valid = true;
        base.quality = worst_of(&[depth_bucket, spread_bucket, staleness_bucket]);
        base.reason = format!(
            "depth {depth_multiple:.1}x, spread {:.3}%, age {staleness:.1}s",
            spread_f * 100.0
        );
        base.action = RecommendedAction::Proceed;
        base
    }

    /// Post-only placement price: one tick inside our side's best, clamped
    /// so a SELL stays strictly above best bid and a BUY strictly below
    /// best ask.
    pub fn recommended_price(
        &self,
        side: Side,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        tick_size: Decimal,
    ) -> Option<Decimal> {
        let tick = if tick_size > Decimal::ZERO {
            tick_size
        } else {
            Decimal::new(1, 2)
        };
        match side {
            Side::Sell => {
                let price = match (best_ask, best_bid) {
                    (Some(ask), _) => ask - tick,
                    (None, Some(bid)) => bid + tick,
                    (None, None) => return None,
                };
                let floor = best_bid.map(|b| b + tick).unwrap_or(price);
                Some(price.max(floor))
            }
            Side::Buy => {
                let price = match (best_bid, best_ask) {
                    (Some(bid), _) => bid + tick,
                    (None, Some(ask)) => ask - tick,
                    (None, None) => return None,
                };
                let ceiling = best_ask.map(|a| a - tick).unwrap_or(price);
                Some(price.min(ceiling))
            }
        }
    }

    fn log_outcome(
        &self,
        symbol: &str,
        side: Side,
        trade_size_usd: Decimal,
        outcome: &ValidationOutcome,
    ) {
        // Bucket the size so near-identical requests share a dedup slot.
        let bucket = (trade_size_usd.to_f64().unwrap_or(0.0) / 100.0).round() as u64;
        let key = (symbol.to_string(), side, bucket);
        let now = Instant::now();

        let mut cache = self.log_cache.lock();
        cache.retain(|_, (at, _)| now.duration_since(*at) < Duration::from_secs(1));
        if let Some((_, quality)) = cache.get(&key) {
            if *quality == outcome.quality {
                return;
            }
        }
        cache.insert(key, (now, outcome.quality));
        drop(cache);

        if outcome.valid {
            debug!(
                symbol,
                %side,
                quality = ?outcome.quality,
                reason = %outcome.reason,
                "orderbook validation passed"
            );
        } else {
            warn!(
                symbol,
                %side,
                quality = ?outcome.quality,
                action = ?outcome.action,
                reason = %outcome.reason,
                "orderbook validation failed"
            );
        }
    }
}

fn worst_of(buckets: &[OrderbookQuality]) -> OrderbookQuality {
    fn rank(q: OrderbookQuality) -> u8 {
        match q {
            OrderbookQuality::Excellent => 0,
            OrderbookQuality::Good => 1,
            OrderbookQuality::Marginal => 2,
            OrderbookQuality::Insufficient => 3,
            OrderbookQuality::Crossed => 4,
            OrderbookQuality::Stale => 5,
            OrderbookQuality::Empty => 6,
        }
    }
    *buckets
        .iter()
        .max_by_key(|q| rank(**q))
        .unwrap_or(&OrderbookQuality::Insufficient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_policy() -> ValidatorPolicy {
        ValidatorPolicy {
            min_depth_usd: 100.0,
            min_opposite_depth_usd: 50.0,
            min_bid_levels: 2,
            min_ask_levels: 2,
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

    fn validator() -> OrderbookValidator {
        OrderbookValidator::new(test_policy())
    }

    fn snapshot(bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> OrderbookSnapshot {
        OrderbookSnapshot {
            symbol: "TEST".to_string(),
            venue: Venue::VenueA,
            bids,
            asks,
            timestamp: Instant::now(),
            sequence: None,
        }
    }

    #[test]
    fn empty_orderbook_rejected() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(vec![], vec![]),
            Instant::now(),
        );
        assert!(!out.valid);
        assert_eq!(out.quality, OrderbookQuality::Empty);
        assert_eq!(out.action, RecommendedAction::Skip);
    }

    #[test]
    fn missing_bids_for_sell_rejected() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(vec![], vec![(dec!(100), dec!(10))]),
            Instant::now(),
        );
        assert!(!out.valid);
        assert!(out.reason.contains("No bids"));
        assert_eq!(out.action, RecommendedAction::Skip);
    }

    #[test]
    fn missing_asks_for_buy_rejected() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Buy,
            dec!(50),
            &snapshot(vec![(dec!(100), dec!(10))], vec![]),
            Instant::now(),
        );
        assert!(!out.valid);
        assert!(out.reason.contains("No asks"));
    }

    #[test]
    fn crossed_book_waits() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![(dec!(101), dec!(10)), (dec!(100), dec!(10))],
                vec![(dec!(100.5), dec!(10)), (dec!(102), dec!(10))],
            ),
            Instant::now(),
        );
        assert!(!out.valid);
        assert_eq!(out.quality, OrderbookQuality::Crossed);
        assert_eq!(out.action, RecommendedAction::Wait);
    }

    #[test]
    fn healthy_orderbook_accepted() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![
                    (dec!(100.00), dec!(5)),
                    (dec!(99.99), dec!(10)),
                    (dec!(99.98), dec!(20)),
                ],
                vec![
                    (dec!(100.05), dec!(5)),
                    (dec!(100.10), dec!(10)),
                    (dec!(100.15), dec!(20)),
                ],
            ),
            Instant::now(),
        );
        assert!(out.valid);
        assert!(matches!(
            out.quality,
            OrderbookQuality::Excellent | OrderbookQuality::Good
        ));
        assert_eq!(out.action, RecommendedAction::Proceed);
    }

    #[test]
    fn wide_spread_rejected_with_wait() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![(dec!(100.00), dec!(10)), (dec!(99.00), dec!(10))],
                vec![(dec!(102.00), dec!(10)), (dec!(103.00), dec!(10))],
            ),
            Instant::now(),
        );
        assert!(!out.valid);
        assert!(out.reason.contains("Spread"));
        assert_eq!(out.action, RecommendedAction::Wait);
    }

    #[test]
    fn thin_depth_suggests_market_order() {
        let v = validator();
        // $200 of bid depth against a $500 trade: multiple is 0.4.
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(500),
            &snapshot(
                vec![(dec!(100.00), dec!(1)), (dec!(99.99), dec!(1))],
                vec![(dec!(100.01), dec!(10)), (dec!(100.02), dec!(10))],
            ),
            Instant::now(),
        );
        assert!(!out.valid);
        assert_eq!(out.action, RecommendedAction::UseMarketOrder);
    }

    #[test]
    fn insufficient_levels_rejected() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![(dec!(100.00), dec!(100))],
                vec![(dec!(100.01), dec!(100)), (dec!(100.02), dec!(100))],
            ),
            Instant::now(),
        );
        assert!(!out.valid);
        assert!(out.reason.contains("levels"));
    }

    #[test]
    fn stale_orderbook_waits() {
        let v = validator();
        let mut snap = snapshot(
            vec![(dec!(100.00), dec!(10)), (dec!(99.99), dec!(10))],
            vec![(dec!(100.01), dec!(10)), (dec!(100.02), dec!(10))],
        );
        let now = Instant::now();
        snap.timestamp = now;
        let later = now + Duration::from_secs(15);
        let out = v.validate_for_maker("TEST", Side::Sell, dec!(50), &snap, later);
        assert!(!out.valid);
        assert_eq!(out.quality, OrderbookQuality::Stale);
        assert_eq!(out.action, RecommendedAction::Wait);
    }

    #[test]
    fn elevated_spread_is_marginal_but_valid() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![(dec!(100.00), dec!(20)), (dec!(99.90), dec!(20))],
                vec![(dec!(100.60), dec!(20)), (dec!(100.70), dec!(20))],
            ),
            Instant::now(),
        );
        assert!(out.valid);
        assert_eq!(out.quality, OrderbookQuality::Marginal);
    }

    #[test]
    fn tight_book_at_exact_minimum_depth_is_valid() {
        // Best ask one tick above best bid, depth exactly at the minimum.
        let policy = ValidatorPolicy {
            min_depth_usd: 1000.0,
            min_opposite_depth_usd: 0.0,
            min_bid_levels: 2,
            min_ask_levels: 2,
            marginal_depth_multiple: 2.0,
            ..test_policy()
        };
        let v = OrderbookValidator::new(policy);
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(150),
            &snapshot(
                vec![(dec!(100.00), dec!(5)), (dec!(100.00), dec!(5))], // $1000
                vec![(dec!(100.01), dec!(5)), (dec!(100.02), dec!(5))],
            ),
            Instant::now(),
        );
        assert!(out.valid);
        assert!(matches!(
            out.quality,
            OrderbookQuality::Good | OrderbookQuality::Marginal
        ));
    }

    #[test]
    fn depth_totals_are_exact() {
        let v = validator();
        let out = v.validate_for_maker(
            "TEST",
            Side::Sell,
            dec!(50),
            &snapshot(
                vec![(dec!(100.00), dec!(5)), (dec!(99.00), dec!(10))],
                vec![(dec!(101.00), dec!(3)), (dec!(102.00), dec!(2))],
            ),
            Instant::now(),
        );
        assert_eq!(out.bid_depth_usd, dec!(1490));
        assert_eq!(out.ask_depth_usd, dec!(507));
    }

    #[test]
    fn recommended_price_sell_sits_inside_spread() {
        let v = validator();
        let price = v
            .recommended_price(
                Side::Sell,
                Some(dec!(99.90)),
                Some(dec!(100.10)),
                dec!(0.01),
            )
            .unwrap();
        assert!(price < dec!(100.10));
        assert!(price > dec!(99.90));
    }

    #[test]
    fn recommended_price_buy_sits_inside_spread() {
        let v = validator();
        let price = v
            .recommended_price(
                Side::Buy,
                Some(dec!(99.90)),
                Some(dec!(100.10)),
                dec!(0.01),
            )
            .unwrap();
        assert!(price > dec!(99.90));
        assert!(price < dec!(100.10));
    }

    #[test]
    fn recommended_price_degrades_to_one_side() {
        let v = validator();
        let sell = v
            .recommended_price(Side::Sell, Some(dec!(99.90)), None, dec!(0.01))
            .unwrap();
        assert!(sell > dec!(99.90));

        let buy = v
            .recommended_price(Side::Buy, None, Some(dec!(100.10)), dec!(0.01))
            .unwrap();
        assert!(buy < dec!(100.10));

        assert!(v.recommended_price(Side::Buy, None, None, dec!(0.01)).is_none());
    }
}
