//! Trade persistence.
//!
//! The engine and reconciler talk to `TradeStore`; the SQLite
//! implementation keeps one serialized connection in WAL mode. Events and
//! metadata are stored as JSON columns. No store transaction is ever held
//! across venue I/O.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::models::{Side, TradeEvent, TradeRecord, TradeStatus};

/// Partial update applied to a trade row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TradePatch {
    pub status: Option<TradeStatus>,
    pub execution_state: Option<String>,
    pub entry_price_a: Option<Decimal>,
    pub entry_price_b: Option<Decimal>,
    pub size_usd: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub close_reason: Option<String>,
    pub events: Option<Vec<TradeEvent>>,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// Returns false when no row matched `trade_id`.
    async fn update_trade(&self, trade_id: &str, patch: TradePatch) -> Result<bool>;

    async fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>>;

    /// Trades whose status may still map to on-exchange state.
    async fn list_open_trades(&self) -> Result<Vec<TradeRecord>>;

    async fn list_trades(&self, status: TradeStatus, limit: usize) -> Result<Vec<TradeRecord>>;
}

pub struct SqliteTradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open trade db")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory trade db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side_a TEXT NOT NULL,
                side_b TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                entry_price_a TEXT NOT NULL,
                entry_price_b TEXT NOT NULL,
                status TEXT NOT NULL,
                execution_state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                opened_at INTEGER,
                closed_at INTEGER,
                realized_pnl TEXT NOT NULL,
                close_reason TEXT,
                events TEXT NOT NULL,
                metadata TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol, created_at DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
        let side = |s: String| {
            if s == "BUY" {
                Side::Buy
            } else {
                Side::Sell
            }
        };
        let decimal = |s: String| s.parse::<Decimal>().unwrap_or(Decimal::ZERO);
        let millis =
            |v: Option<i64>| v.and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let events_json: String = row.get("events")?;
        let metadata_json: Option<String> = row.get("metadata")?;
        let status_str: String = row.get("status")?;

        Ok(TradeRecord {
            trade_id: row.get("trade_id")?,
            symbol: row.get("symbol")?,
            side_a: side(row.get("side_a")?),
            side_b: side(row.get("side_b")?),
            size_usd: decimal(row.get("size_usd")?),
            entry_price_a: decimal(row.get("entry_price_a")?),
            entry_price_b: decimal(row.get("entry_price_b")?),
            status: TradeStatus::from_str(&status_str).unwrap_or(TradeStatus::Failed),
            execution_state: row.get("execution_state")?,
            created_at: millis(row.get("created_at")?).unwrap_or_else(Utc::now),
            opened_at: millis(row.get("opened_at")?),
            closed_at: millis(row.get("closed_at")?),
            realized_pnl: decimal(row.get("realized_pnl")?),
            close_reason: row.get("close_reason")?,
            events: serde_json::from_str(&events_json).unwrap_or_default(),
            metadata: metadata_json
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn create_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (
                trade_id, symbol, side_a, side_b, size_usd,
                entry_price_a, entry_price_b, status, execution_state,
                created_at, opened_at, closed_at, realized_pnl,
                close_reason, events, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                trade.trade_id,
                trade.symbol,
                trade.side_a.as_str(),
                trade.side_b.as_str(),
                trade.size_usd.to_string(),
                trade.entry_price_a.to_string(),
                trade.entry_price_b.to_string(),
                trade.status.as_str(),
                trade.execution_state,
                trade.created_at.timestamp_millis(),
                trade.opened_at.map(|t| t.timestamp_millis()),
                trade.closed_at.map(|t| t.timestamp_millis()),
                trade.realized_pnl.to_string(),
                trade.close_reason,
                serde_json::to_string(&trade.events)?,
                if trade.metadata.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&trade.metadata)?)
                },
            ],
        )
        .context("insert trade")?;
        Ok(())
    }

    async fn update_trade(&self, trade_id: &str, patch: TradePatch) -> Result<bool> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        let mut push = |column: &str, value: Box<dyn rusqlite::ToSql + Send>| {
            sets.push(format!("{} = ?{}", column, sets.len() + 1));
            values.push(value);
        };

        if let Some(status) = patch.status {
            push("status", Box::new(status.as_str().to_string()));
        }
        if let Some(state) = patch.execution_state {
            push("execution_state", Box::new(state));
        }
        if let Some(px) = patch.entry_price_a {
            push("entry_price_a", Box::new(px.to_string()));
        }
        if let Some(px) = patch.entry_price_b {
            push("entry_price_b", Box::new(px.to_string()));
        }
        if let Some(size) = patch.size_usd {
            push("size_usd", Box::new(size.to_string()));
        }
        if let Some(at) = patch.opened_at {
            push("opened_at", Box::new(at.timestamp_millis()));
        }
        if let Some(at) = patch.closed_at {
            push("closed_at", Box::new(at.timestamp_millis()));
        }
        if let Some(pnl) = patch.realized_pnl {
            push("realized_pnl", Box::new(pnl.to_string()));
        }
        if let Some(reason) = patch.close_reason {
            push("close_reason", Box::new(reason));
        }
        if let Some(events) = patch.events {
            push("events", Box::new(serde_json::to_string(&events)?));
        }
        if let Some(metadata) = patch.metadata {
            push("metadata", Box::new(serde_json::to_string(&metadata)?));
        }

        if sets.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE trades SET {} WHERE trade_id = ?{}",
            sets.join(", "),
            sets.len() + 1
        );
        values.push(Box::new(trade_id.to_string()));

        let conn = self.conn.lock().await;
        let params_ref: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql).collect();
        let changed = conn
            .execute(&sql, params_ref.as_slice())
            .context("update trade")?;
        Ok(changed > 0)
    }

    async fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT * FROM trades WHERE trade_id = ?1")?;
        let mut rows = stmt.query(params![trade_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_record(row)?)),
            None => Ok(None),
        }
    }

    async fn list_open_trades(&self) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades
             WHERE status IN ('pending', 'opening', 'open', 'closing')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn list_trades(&self, status: TradeStatus, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM trades WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], Self::row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(symbol: &str, status: TradeStatus) -> TradeRecord {
        let mut trade = TradeRecord::new(symbol, Side::Buy, Side::Sell, dec!(1000));
        trade.status = status;
        trade
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let store = SqliteTradeStore::in_memory().unwrap();
        let mut trade = record("BTC", TradeStatus::Open);
        trade.push_event("OPENED", serde_json::json!({"qty": "0.02"}));
        store.create_trade(&trade).await.unwrap();

        let loaded = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "BTC");
        assert_eq!(loaded.status, TradeStatus::Open);
        assert_eq!(loaded.side_a, Side::Buy);
        assert_eq!(loaded.size_usd, dec!(1000));
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.events[0].name, "OPENED");
    }

    #[tokio::test]
    async fn update_patch_applies_only_given_fields() {
        let store = SqliteTradeStore::in_memory().unwrap();
        let trade = record("BTC", TradeStatus::Opening);
        store.create_trade(&trade).await.unwrap();

        let updated = store
            .update_trade(
                &trade.trade_id,
                TradePatch {
                    status: Some(TradeStatus::Closed),
                    close_reason: Some("reconciliation_zombie".to_string()),
                    closed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let loaded = store.get_trade(&trade.trade_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Closed);
        assert_eq!(loaded.close_reason.as_deref(), Some("reconciliation_zombie"));
        assert_eq!(loaded.size_usd, dec!(1000));
        assert!(loaded.closed_at.is_some());
    }

    #[tokio::test]
    async fn update_unknown_trade_returns_false() {
        let store = SqliteTradeStore::in_memory().unwrap();
        let updated = store
            .update_trade(
                "missing",
                TradePatch {
                    status: Some(TradeStatus::Closed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn list_open_filters_terminal_statuses() {
        let store = SqliteTradeStore::in_memory().unwrap();
        for status in [
            TradeStatus::Pending,
            TradeStatus::Opening,
            TradeStatus::Open,
            TradeStatus::Closing,
            TradeStatus::Closed,
            TradeStatus::Failed,
            TradeStatus::Rejected,
        ] {
            store.create_trade(&record("BTC", status)).await.unwrap();
        }
        let open = store.list_open_trades().await.unwrap();
        assert_eq!(open.len(), 4);
        assert!(open.iter().all(|t| t.status.is_active()));
    }

    #[tokio::test]
    async fn list_trades_by_status_respects_limit() {
        let store = SqliteTradeStore::in_memory().unwrap();
        for _ in 0..5 {
            store
                .create_trade(&record("BTC", TradeStatus::Failed))
                .await
                .unwrap();
        }
        let failed = store.list_trades(TradeStatus::Failed, 3).await.unwrap();
        assert_eq!(failed.len(), 3);
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.db");
        let path_str = path.to_str().unwrap();

        let trade = record("ETH", TradeStatus::Open);
        {
            let store = SqliteTradeStore::new(path_str).unwrap();
            store.create_trade(&trade).await.unwrap();
        }
        let reopened = SqliteTradeStore::new(path_str).unwrap();
        let loaded = reopened.get_trade(&trade.trade_id).await.unwrap();
        assert!(loaded.is_some());
    }
}
