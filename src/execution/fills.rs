//! Event-driven fill detection.
//!
//! Venue adapters push position updates into the watcher through the
//! narrow callback they receive at registration; the engine's fill-wait
//! loops block on the per-symbol notify and fall back to polling. The
//! adapter side never learns about the engine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::debug;

use crate::models::{normalize_symbol, PositionUpdate, Venue};
use crate::venues::PositionCallback;

struct WatchEntry {
    /// Coin quantity at which the position counts as filled
    target: Decimal,
    /// Fraction of target that triggers the notify (0.95 by default)
    match_fraction: Decimal,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct FillWatcher {
    watches: Mutex<HashMap<(Venue, String), WatchEntry>>,
}

impl FillWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arm a watch; the returned notify fires once the venue reports a
    /// position of at least `match_fraction * target` coins.
    pub fn watch(
        &self,
        venue: Venue,
        symbol: &str,
        target: Decimal,
        match_fraction: Decimal,
    ) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.watches.lock().insert(
            (venue, normalize_symbol(symbol)),
            WatchEntry {
                target,
                match_fraction,
                notify: notify.clone(),
            },
        );
        notify
    }

    pub fn clear(&self, venue: Venue, symbol: &str) {
        self.watches.lock().remove(&(venue, normalize_symbol(symbol)));
    }

    pub fn on_position_update(&self, update: PositionUpdate) {
        let key = (update.venue, normalize_symbol(&update.symbol));
        let watches = self.watches.lock();
        let Some(entry) = watches.get(&key) else {
            return;
        };
        if entry.target <= Decimal::ZERO {
            return;
        }
        if update.signed_size.abs() >= entry.target * entry.match_fraction {
            debug!(
                symbol = %update.symbol,
                venue = %update.venue,
                size = %update.signed_size,
                target = %entry.target,
                "position update satisfied fill watch"
            );
            entry.notify.notify_waiters();
            entry.notify.notify_one();
        }
    }

    /// Callback handed to a venue adapter at registration time.
    pub fn callback(self: &Arc<Self>) -> PositionCallback {
        let watcher = Arc::clone(self);
        Arc::new(move |update: PositionUpdate| {
            watcher.on_position_update(update);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::time::{timeout, Duration};

    fn update(size: Decimal) -> PositionUpdate {
        PositionUpdate {
            venue: Venue::VenueA,
            symbol: "BTC-USD".to_string(),
            signed_size: size,
        }
    }

    #[tokio::test]
    async fn notify_fires_at_match_fraction() {
        let watcher = FillWatcher::new();
        let notify = watcher.watch(Venue::VenueA, "BTC", dec!(0.02), dec!(0.95));

        // 90% of target: below the match fraction, no notify.
        watcher.on_position_update(update(dec!(0.018)));
        assert!(
            timeout(Duration::from_millis(20), notify.notified())
                .await
                .is_err()
        );

        watcher.on_position_update(update(dec!(0.02)));
        timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("notify should fire at full size");
    }

    #[tokio::test]
    async fn short_positions_count_by_magnitude() {
        let watcher = FillWatcher::new();
        let notify = watcher.watch(Venue::VenueA, "BTC", dec!(0.02), dec!(0.95));
        watcher.on_position_update(update(dec!(-0.02)));
        timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("short fills notify too");
    }

    #[tokio::test]
    async fn cleared_watch_is_inert() {
        let watcher = FillWatcher::new();
        let notify = watcher.watch(Venue::VenueA, "BTC", dec!(0.02), dec!(0.95));
        watcher.clear(Venue::VenueA, "BTC");
        watcher.on_position_update(update(dec!(0.02)));
        assert!(
            timeout(Duration::from_millis(20), notify.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn symbols_normalize_across_venue_conventions() {
        let watcher = FillWatcher::new();
        // Watch armed with the canonical symbol, update arrives suffixed.
        let notify = watcher.watch(Venue::VenueA, "BTC", dec!(0.02), dec!(0.95));
        watcher.on_position_update(PositionUpdate {
            venue: Venue::VenueA,
            symbol: "BTC-USD".to_string(),
            signed_size: dec!(0.02),
        });
        timeout(Duration::from_millis(100), notify.notified())
            .await
            .expect("suffixed symbol should match");
    }
}
