//! End-to-end flow through the public API: hedged entry, reconciliation
//! no-op on a consistent book, hedged exit, and startup repair of a
//! record that lost its positions.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::Duration;

use hedgebot_backend::config::{ExecutionConfig, ReconcilerConfig, RollbackConfig, ValidatorPolicy};
use hedgebot_backend::models::{Side, TradeRecord, TradeStatus, Venue};
use hedgebot_backend::{
    EntryRequest, EventBus, ExecutionEngine, PaperVenue, PaperVenueConfig, Reconciler,
    SqliteTradeStore, TradeStore, VenueAdapter,
};

struct World {
    engine: Arc<ExecutionEngine>,
    reconciler: Arc<Reconciler>,
    venue_a: Arc<PaperVenue>,
    venue_b: Arc<PaperVenue>,
    store: Arc<dyn TradeStore>,
}

fn fast_exec_cfg() -> ExecutionConfig {
    ExecutionConfig {
        maker_timeout_base_seconds: 0.2,
        maker_timeout_min_seconds: 0.05,
        maker_timeout_max_seconds: 0.5,
        maker_max_retries: 0,
        fill_poll_interval_seconds: 0.02,
        hedge_settle_seconds: 0.01,
        ghost_check_initial_delay: 0.01,
        ghost_check_delay_step: 0.005,
        ghost_check_delay_cap: 0.05,
        ghost_check_attempts: 5,
        graceful_timeout_seconds: 2.0,
        ..ExecutionConfig::default()
    }
}

fn world() -> World {
    let mut cfg_a = PaperVenueConfig::new(Venue::VenueA, "paper-a");
    cfg_a.maker_fill_delay = Some(Duration::from_millis(40));
    let venue_a = PaperVenue::new(cfg_a);

    let mut cfg_b = PaperVenueConfig::new(Venue::VenueB, "paper-b");
    cfg_b.lot_size = dec!(0.001);
    cfg_b.min_order_size_coins = dec!(0.001);
    let venue_b = PaperVenue::new(cfg_b);

    venue_a.set_orderbook(
        "BTC",
        vec![
            (dec!(49995), dec!(1)),
            (dec!(49990), dec!(1)),
            (dec!(49985), dec!(1)),
        ],
        vec![
            (dec!(50005), dec!(1)),
            (dec!(50010), dec!(1)),
            (dec!(50015), dec!(1)),
        ],
    );
    venue_a.set_mark_price("BTC", dec!(50000));
    venue_b.set_mark_price("BTC", dec!(50000));

    let store: Arc<dyn TradeStore> = Arc::new(SqliteTradeStore::in_memory().unwrap());
    let bus = EventBus::default();

    let adapter_a: Arc<dyn VenueAdapter> = venue_a.clone();
    let adapter_b: Arc<dyn VenueAdapter> = venue_b.clone();

    let exec_cfg = fast_exec_cfg();
    let engine = ExecutionEngine::new(
        adapter_a.clone(),
        adapter_b.clone(),
        store.clone(),
        bus.clone(),
        exec_cfg.clone(),
        RollbackConfig {
            settle_delay_seconds: 0.01,
            base_delay_seconds: 0.01,
            verify_delay_seconds: 0.01,
            ..RollbackConfig::default()
        },
        ValidatorPolicy::default(),
    );
    engine.start();

    let reconciler = Reconciler::new(
        adapter_a,
        adapter_b,
        store.clone(),
        bus,
        ReconcilerConfig {
            soft_close_enabled: false,
            ..ReconcilerConfig::default()
        },
        &exec_cfg,
    );

    World {
        engine,
        reconciler,
        venue_a,
        venue_b,
        store,
    }
}

fn btc_entry() -> EntryRequest {
    EntryRequest {
        symbol: "BTC".to_string(),
        maker_venue: Venue::VenueA,
        maker_side: Side::Buy,
        hedge_side: Side::Sell,
        target_usd: dec!(1000),
        maker_price: None,
        hedge_price: None,
        timeout: None,
    }
}

#[tokio::test(start_paused = true)]
async fn entry_reconcile_exit_roundtrip() {
    let w = world();

    // Entry opens a hedged pair.
    let outcome = w.engine.execute_hedged_entry(btc_entry()).await;
    assert!(outcome.success, "entry failed: {:?}", outcome.error);
    assert_eq!(w.venue_a.position_size("BTC"), dec!(0.02));
    assert_eq!(w.venue_b.position_size("BTC"), dec!(-0.02));

    // A consistent world reconciles as a no-op.
    let report = w.reconciler.run_once(false).await;
    assert!(report.is_noop(), "expected no-op, got {report:?}");

    // Exit returns both venues to flat.
    let trade_id = outcome.trade_id.unwrap();
    w.engine
        .execute_hedged_exit(&trade_id, "roundtrip")
        .await
        .unwrap();
    assert_eq!(w.venue_a.position_size("BTC"), Decimal::ZERO);
    assert_eq!(w.venue_b.position_size("BTC"), Decimal::ZERO);

    let trade = w.store.get_trade(&trade_id).await.unwrap().unwrap();
    assert_eq!(trade.status, TradeStatus::Closed);

    // Reconciling again still changes nothing.
    let report = w.reconciler.run_once(false).await;
    assert!(report.is_noop());

    w.engine.stop(false).await;
}

#[tokio::test(start_paused = true)]
async fn startup_reconcile_repairs_orphaned_record() {
    let w = world();

    // A restart left an OPEN record with no positions anywhere.
    let mut orphan = TradeRecord::new("ETH", Side::Buy, Side::Sell, dec!(500));
    orphan.status = TradeStatus::Open;
    w.store.create_trade(&orphan).await.unwrap();

    let report = w.reconciler.run_once(true).await;
    assert_eq!(report.zombies_closed, 1);

    let repaired = w.store.get_trade(&orphan.trade_id).await.unwrap().unwrap();
    assert_eq!(repaired.status, TradeStatus::Closed);
    assert_eq!(
        repaired.close_reason.as_deref(),
        Some("reconciliation_zombie")
    );

    w.engine.stop(false).await;
}

#[tokio::test(start_paused = true)]
async fn failed_hedge_leaves_no_exposure_anywhere() {
    let w = world();
    w.venue_b
        .inject_failure(hedgebot_backend::VenueError::Network("down".into()));

    let outcome = w.engine.execute_hedged_entry(btc_entry()).await;
    assert!(!outcome.success);

    // The rollback worker flattens the maker leg.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if w.venue_a.position_size("BTC").is_zero() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(w.venue_a.position_size("BTC"), Decimal::ZERO);
    assert_eq!(w.venue_b.position_size("BTC"), Decimal::ZERO);

    // And the record ends closed, not dangling.
    let trade = w
        .store
        .get_trade(outcome.trade_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        trade.status,
        TradeStatus::Closed | TradeStatus::Rollback
    ));

    w.engine.stop(false).await;
}
