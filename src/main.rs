//! HedgeBot - Cross-Venue Funding-Rate Arbitrage Engine
//! Mission: capture funding spreads with delta-neutral two-leg positions
//! Philosophy: maker-first entries, verified rollback, never a naked leg

mod config;
mod events;
mod execution;
mod models;
mod orderbook;
mod reconcile;
mod store;
mod venues;
mod volatility;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::AppConfig,
    events::{EngineEvent, EventBus},
    execution::{EntryRequest, ExecutionEngine},
    models::{Side, Venue},
    reconcile::Reconciler,
    store::{SqliteTradeStore, TradeStore},
    venues::{PaperVenue, PaperVenueConfig, VenueAdapter},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hedgebot=info,hedgebot_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AppConfig::from_env();
    info!(db = %cfg.database_path, "🤖 HedgeBot starting");

    // Paper venues: the engine drives both exchanges through the adapter
    // trait, so live adapters slot in here without touching the core.
    let paper_a = PaperVenue::new(PaperVenueConfig::new(Venue::VenueA, "venue-a"));
    let paper_b = {
        let mut venue_cfg = PaperVenueConfig::new(Venue::VenueB, "venue-b");
        venue_cfg.lot_size = Decimal::new(1, 3); // 0.001
        venue_cfg.min_order_size_coins = Decimal::new(1, 3);
        PaperVenue::new(venue_cfg)
    };
    seed_paper_market(&paper_a, &paper_b);

    let venue_a: Arc<dyn VenueAdapter> = paper_a.clone();
    let venue_b: Arc<dyn VenueAdapter> = paper_b.clone();

    let store: Arc<dyn TradeStore> = Arc::new(
        SqliteTradeStore::new(&cfg.database_path).context("open trade store")?,
    );
    let bus = EventBus::default();

    // Log every engine event; notification transports subscribe the same way.
    let mut event_rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match &event {
                EngineEvent::CriticalError { message, details } => {
                    error!(%message, %details, "🚨 CRITICAL");
                }
                other => info!(event = ?other, "engine event"),
            }
        }
    });

    let engine = ExecutionEngine::new(
        venue_a.clone(),
        venue_b.clone(),
        store.clone(),
        bus.clone(),
        cfg.execution.clone(),
        cfg.rollback.clone(),
        cfg.validator.clone(),
    );
    engine.start();

    let reconciler = Reconciler::new(
        venue_a,
        venue_b,
        store,
        bus.clone(),
        cfg.reconciler.clone(),
        &cfg.execution,
    );
    reconciler.start().await;

    if env::var("PAPER_DEMO")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(false)
    {
        run_paper_demo(&engine).await;
    }

    info!("engine running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    warn!("🛑 shutdown signal received");
    reconciler.stop().await;
    engine.stop(false).await;
    info!("goodbye");
    Ok(())
}

fn seed_paper_market(paper_a: &Arc<PaperVenue>, paper_b: &Arc<PaperVenue>) {
    let bids = vec![
        (Decimal::new(49995, 0), Decimal::ONE),
        (Decimal::new(49990, 0), Decimal::ONE),
        (Decimal::new(49985, 0), Decimal::ONE),
    ];
    let asks = vec![
        (Decimal::new(50005, 0), Decimal::ONE),
        (Decimal::new(50010, 0), Decimal::ONE),
        (Decimal::new(50015, 0), Decimal::ONE),
    ];
    paper_a.set_orderbook("BTC", bids, asks);
    paper_a.set_mark_price("BTC", Decimal::new(50000, 0));
    paper_b.set_mark_price("BTC", Decimal::new(50000, 0));
}

/// One end-to-end hedged entry and exit against the paper venues.
async fn run_paper_demo(engine: &Arc<ExecutionEngine>) {
    info!("📄 paper demo: one hedged entry + exit on BTC");
    let outcome = engine
        .execute_hedged_entry(EntryRequest {
            symbol: "BTC".to_string(),
            maker_venue: Venue::VenueA,
            maker_side: Side::Buy,
            hedge_side: Side::Sell,
            target_usd: Decimal::new(1000, 0),
            maker_price: None,
            hedge_price: None,
            timeout: None,
        })
        .await;

    if !outcome.success {
        warn!(error = ?outcome.error, "paper demo entry failed");
        return;
    }
    info!(stats = ?engine.get_execution_stats(), "paper demo entry complete");

    if let Some(trade_id) = outcome.trade_id {
        match engine.execute_hedged_exit(&trade_id, "paper_demo_exit").await {
            Ok(()) => info!("paper demo exit complete, both venues flat"),
            Err(e) => warn!(error = %e, "paper demo exit failed"),
        }
    }
}
