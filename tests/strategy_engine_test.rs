//! End-to-end engine scenarios over a fake transport: a balanced window
//! keeps the even/odd strategy waiting; a dominant window trades, settles,
//! and folds the result into the session counters.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use digitbot::connection::{ConnectionManager, ReconnectPolicy};
use digitbot::events::EventSink;
use digitbot::execution::Executor;
use digitbot::market::MarketRegistry;
use digitbot::risk::{RiskConfig, RiskManager, StakeRules, StrategyLimits};
use digitbot::session::AccountSession;
use digitbot::strategy::engine::{EngineCommand, StrategyEngine};
use digitbot::strategy::types::{EvenOddConfig, StrategyConfig, StrategyKind};
use digitbot::subscription::SubscriptionManager;
use digitbot::transport::Transport;

use common::{FakeFactory, FakeTransport};

fn tick_msg(digit: u8) -> Value {
    // Two-decimal default precision puts the digit in the hundredths place.
    let quote = 100.0 + digit as f64 / 100.0;
    json!({ "tick": { "symbol": "R_100", "quote": quote, "epoch": 1 } })
}

async fn engine_under_test(
    transport: Arc<FakeTransport>,
) -> (
    Arc<RiskManager>,
    mpsc::UnboundedSender<EngineCommand>,
    mpsc::UnboundedSender<Value>,
) {
    let factory = FakeFactory::new(vec![transport.clone()]);
    let connection =
        ConnectionManager::new(factory, ReconnectPolicy::default(), EventSink::disabled());
    connection.connect(false).await.expect("fake connect");
    let subscriptions = SubscriptionManager::new(EventSink::disabled());
    subscriptions.set_transport(transport.clone()).await;

    let session = AccountSession::new();
    let as_transport: Arc<dyn Transport> = transport;
    session
        .authorize(&as_transport, "test-token")
        .await
        .expect("authorize against fake");

    let risk = Arc::new(RiskManager::new(
        RiskConfig::default(),
        EventSink::disabled(),
    ));
    let executor = Executor::new(
        connection,
        subscriptions,
        risk.clone(),
        session.clone(),
        EventSink::disabled(),
        Duration::from_secs(1),
    );

    let strategies = vec![StrategyConfig {
        id: "even-odd-R_100".to_string(),
        symbol: "R_100".to_string(),
        kind: StrategyKind::EvenOdd(EvenOddConfig::default()),
        stake: StakeRules::default(),
        limits: StrategyLimits::default(),
        duration_ticks: 1,
    }];
    let engine = StrategyEngine::new(
        strategies,
        10,
        Arc::new(MarketRegistry::new()),
        session,
        executor,
        risk.clone(),
        EventSink::disabled(),
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(engine.run(cmd_rx));
    cmd_tx.send(EngineCommand::StartAll).unwrap();

    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    cmd_tx.send(EngineCommand::AttachTicks(tick_rx)).unwrap();

    (risk, cmd_tx, tick_tx)
}

#[tokio::test]
async fn test_balanced_window_keeps_strategy_waiting() {
    let transport = FakeTransport::new();
    let (_risk, _cmd_tx, tick_tx) = engine_under_test(transport.clone()).await;

    // 10 ticks, 5 even and 5 odd: 50% cannot clear the 55% threshold.
    for digit in [2u8, 4, 6, 8, 1, 3, 5, 7, 9, 0] {
        tick_tx.send(tick_msg(digit)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        transport.count_calls("proposal"),
        0,
        "no quote may be requested while the trigger is unmet"
    );
}

#[tokio::test]
async fn test_dominant_window_trades_and_folds_settlement() {
    let transport = FakeTransport::new();
    let (risk, _cmd_tx, tick_tx) = engine_under_test(transport.clone()).await;

    // Start balanced, then push even digits until the window tips past 55%.
    for digit in [2u8, 4, 6, 8, 1, 3, 5, 7, 9, 0] {
        tick_tx.send(tick_msg(digit)).unwrap();
    }
    for _ in 0..6 {
        tick_tx.send(tick_msg(6)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        transport.count_calls("proposal") >= 1,
        "dominant parity must trigger a quote"
    );
    assert!(transport.count_calls("buy") >= 1, "quote must be accepted");

    // The scripted settlement is a win; it must land in the session counters.
    let session = risk.session();
    assert!(session.wins >= 1, "settlement must fold into session stats");
    assert!(session.profit_loss > 0.0);
}

#[tokio::test]
async fn test_stopped_strategy_ignores_ticks() {
    let transport = FakeTransport::new();
    let (_risk, cmd_tx, tick_tx) = engine_under_test(transport.clone()).await;

    cmd_tx
        .send(EngineCommand::Stop("even-odd-R_100".to_string()))
        .unwrap();

    for digit in [2u8, 4, 6, 8, 0, 2, 4, 6, 8, 0] {
        tick_tx.send(tick_msg(digit)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        transport.count_calls("proposal"),
        0,
        "an idle strategy must not trade on any window"
    );
}
