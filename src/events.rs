//! In-process event bus.
//!
//! Engine components publish lifecycle and alert events; subscribers
//! (notification transports, monitors) attach via `subscribe()`. Built on a
//! broadcast channel so a slow or absent subscriber never blocks execution.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::Venue;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeOpened {
        trade_id: String,
        symbol: String,
        size_usd: Decimal,
    },
    TradeClosed {
        trade_id: String,
        symbol: String,
        pnl_usd: Decimal,
        reason: String,
    },
    PositionReconciled {
        symbol: String,
        venue: Venue,
        action: String,
        details: serde_json::Value,
    },
    CriticalError {
        message: String,
        details: serde_json::Value,
    },
    Notification {
        level: String,
        message: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. A send error only means nobody is listening.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn critical(&self, message: impl Into<String>, details: serde_json::Value) {
        self.publish(EngineEvent::CriticalError {
            message: message.into(),
            details,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::TradeOpened {
            trade_id: "t1".to_string(),
            symbol: "BTC".to_string(),
            size_usd: dec!(1000),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::TradeOpened { symbol, .. } => assert_eq!(symbol, "BTC"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.critical("naked leg", serde_json::json!({"symbol": "BTC"}));
    }
}
