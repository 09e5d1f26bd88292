//! Orderbook provider.
//!
//! Caches the freshest snapshot per (venue, symbol), tracks a distrust
//! window after websocket reconnects, and falls back to a REST fetch when
//! the cached book is missing, stale or crossed. A crossed snapshot is
//! never served; the cache entry is invalidated so the next read refetches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::models::{OrderbookSnapshot, Venue};
use crate::venues::{VenueAdapter, VenueError, VenueResult};

const REST_FETCH_DEPTH: usize = 20;

pub struct OrderbookProvider {
    venues: HashMap<Venue, Arc<dyn VenueAdapter>>,
    cache: Mutex<HashMap<(Venue, String), OrderbookSnapshot>>,
    cooldown_until: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl OrderbookProvider {
    pub fn new(
        venue_a: Arc<dyn VenueAdapter>,
        venue_b: Arc<dyn VenueAdapter>,
        cooldown_seconds: f64,
    ) -> Arc<Self> {
        let mut venues: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(Venue::VenueA, venue_a);
        venues.insert(Venue::VenueB, venue_b);
        Arc::new(Self {
            venues,
            cache: Mutex::new(HashMap::new()),
            cooldown_until: Mutex::new(None),
            cooldown: Duration::from_secs_f64(cooldown_seconds),
        })
    }

    /// Record a websocket-stream update.
    pub fn update_snapshot(&self, snapshot: OrderbookSnapshot) {
        let key = (snapshot.venue, snapshot.symbol.clone());
        self.cache.lock().insert(key, snapshot);
    }

    /// Start the post-reconnect distrust window.
    pub fn note_reconnect(&self) {
        info!(
            cooldown_secs = self.cooldown.as_secs_f64(),
            "orderbook stream reconnected, entering cooldown"
        );
        *self.cooldown_until.lock() = Some(Instant::now() + self.cooldown);
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .lock()
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn cooldown_remaining(&self) -> f64 {
        self.cooldown_until
            .lock()
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn invalidate(&self, venue: Venue, symbol: &str) {
        self.cache.lock().remove(&(venue, symbol.to_string()));
    }

    /// Cached snapshot, if any. Staleness is the caller's call to make.
    pub fn cached(&self, venue: Venue, symbol: &str) -> Option<OrderbookSnapshot> {
        self.cache.lock().get(&(venue, symbol.to_string())).cloned()
    }

    /// Best available snapshot: cache first, REST otherwise.
    pub async fn get(&self, venue: Venue, symbol: &str) -> VenueResult<OrderbookSnapshot> {
        if let Some(snapshot) = self.cached(venue, symbol) {
            return Ok(snapshot);
        }
        self.fetch_rest(venue, symbol, false).await
    }

    /// Fresh REST snapshot, bypassing the cache. With `retry_on_crossed`
    /// a crossed response is retried once after a short pause.
    pub async fn fetch_rest(
        &self,
        venue: Venue,
        symbol: &str,
        retry_on_crossed: bool,
    ) -> VenueResult<OrderbookSnapshot> {
        let adapter = self
            .venues
            .get(&venue)
            .ok_or_else(|| VenueError::Unknown("unknown venue".into()))?;

        let mut snapshot = adapter.fetch_orderbook(symbol, REST_FETCH_DEPTH).await?;
        if snapshot.is_crossed() && retry_on_crossed {
            warn!(symbol, %venue, "REST snapshot crossed, retrying once");
            tokio::time::sleep(Duration::from_millis(250)).await;
            snapshot = adapter.fetch_orderbook(symbol, REST_FETCH_DEPTH).await?;
        }

        if snapshot.is_crossed() {
            self.invalidate(venue, symbol);
            return Err(VenueError::CrossedBook);
        }

        debug!(
            symbol,
            %venue,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "REST orderbook snapshot"
        );
        self.update_snapshot(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::{PaperVenue, PaperVenueConfig};
    use rust_decimal_macros::dec;

    fn provider_with_paper() -> (Arc<OrderbookProvider>, Arc<PaperVenue>) {
        let a = PaperVenue::new(PaperVenueConfig::new(Venue::VenueA, "paper-a"));
        let b = PaperVenue::new(PaperVenueConfig::new(Venue::VenueB, "paper-b"));
        let provider = OrderbookProvider::new(a.clone(), b.clone(), 30.0);
        (provider, a)
    }

    #[tokio::test]
    async fn cache_hit_avoids_rest() {
        let (provider, _venue) = provider_with_paper();
        provider.update_snapshot(OrderbookSnapshot {
            symbol: "BTC".to_string(),
            venue: Venue::VenueA,
            bids: vec![(dec!(100), dec!(1))],
            asks: vec![(dec!(101), dec!(1))],
            timestamp: Instant::now(),
            sequence: Some(1),
        });
        // No book configured on the paper venue: a REST fetch would fail.
        let snapshot = provider.get(Venue::VenueA, "BTC").await.unwrap();
        assert_eq!(snapshot.best_bid(), Some(dec!(100)));
    }

    #[tokio::test]
    async fn rest_fallback_populates_cache() {
        let (provider, venue) = provider_with_paper();
        venue.set_orderbook("BTC", vec![(dec!(100), dec!(1))], vec![(dec!(101), dec!(1))]);
        let snapshot = provider.get(Venue::VenueA, "BTC").await.unwrap();
        assert_eq!(snapshot.best_ask(), Some(dec!(101)));
        assert!(provider.cached(Venue::VenueA, "BTC").is_some());
    }

    #[tokio::test]
    async fn crossed_rest_snapshot_is_rejected_and_invalidated() {
        let (provider, venue) = provider_with_paper();
        venue.set_orderbook("BTC", vec![(dec!(102), dec!(1))], vec![(dec!(101), dec!(1))]);
        let err = provider
            .fetch_rest(Venue::VenueA, "BTC", false)
            .await
            .unwrap_err();
        assert_eq!(err, VenueError::CrossedBook);
        assert!(provider.cached(Venue::VenueA, "BTC").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_window_expires() {
        let (provider, _venue) = provider_with_paper();
        assert!(!provider.is_in_cooldown());
        provider.note_reconnect();
        assert!(provider.is_in_cooldown());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!provider.is_in_cooldown());
    }
}
