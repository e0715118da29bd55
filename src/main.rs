use std::sync::Arc;

use tokio::sync::mpsc;

use digitbot::config::AppConfig;
use digitbot::connection::ConnectionManager;
use digitbot::events::{EventSink, StatusEvent};
use digitbot::execution::Executor;
use digitbot::market::MarketRegistry;
use digitbot::protocol;
use digitbot::risk::RiskManager;
use digitbot::session::AccountSession;
use digitbot::strategy::engine::{EngineCommand, StrategyEngine};
use digitbot::subscription::{StreamKey, SubscriptionManager};
use digitbot::transport::WsFactory;
use digitbot::utils;
use digitbot::DynError;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[CONFIG] {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "[{}] [START] digitbot | endpoint: {} | symbols: {} | sample: {}",
        utils::ts_hm(),
        config.endpoint,
        config.symbols.join(","),
        config.sample_size
    );

    let (events, mut events_rx) = EventSink::new();
    let market = Arc::new(MarketRegistry::new());
    let session = AccountSession::new();
    let risk = Arc::new(RiskManager::new(config.risk.clone(), events.clone()));
    let factory = Arc::new(WsFactory::new(config.endpoint.clone()));
    let connection = ConnectionManager::new(factory, config.reconnect.clone(), events.clone());
    let subscriptions = SubscriptionManager::new(events.clone());
    let executor = Executor::new(
        connection.clone(),
        subscriptions.clone(),
        risk.clone(),
        session.clone(),
        events.clone(),
        config.call_timeout,
    );

    let engine = StrategyEngine::new(
        config.build_strategies(),
        config.sample_size,
        market.clone(),
        session.clone(),
        executor,
        risk.clone(),
        events.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(engine.run(cmd_rx));
    let _ = cmd_tx.send(EngineCommand::StartAll);

    if let Err(e) = connection.connect(false).await {
        // Backoff reconnection is already scheduled; just report it.
        eprintln!("[{}] [CONN] initial connect failed: {}", utils::ts_hm(), e);
    }

    // Supervision loop: render status events and perform the post-open
    // bootstrap (authorize, resubscribe) the connection manager deliberately
    // leaves to its caller.
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                match event {
                    StatusEvent::ConnectionOpened { .. } => {
                        let connection = connection.clone();
                        let subscriptions = subscriptions.clone();
                        let session = session.clone();
                        let market = market.clone();
                        let cmd_tx = cmd_tx.clone();
                        let token = config.api_token.clone();
                        let symbols = config.symbols.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bootstrap(
                                connection,
                                subscriptions,
                                session,
                                market,
                                cmd_tx,
                                token,
                                symbols,
                            )
                            .await
                            {
                                eprintln!("[{}] [BOOT] bootstrap failed: {}", utils::ts_hm(), e);
                            }
                        });
                    }
                    StatusEvent::ConnectionClosed => session.mark_logged_out(),
                    StatusEvent::ReconnectExhausted { .. } => {
                        eprintln!(
                            "[{}] [FATAL] reconnect attempts exhausted, shutting down",
                            utils::ts_hm()
                        );
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] [SHUTDOWN] Ctrl-C received", utils::ts_hm());
                break;
            }
        }
    }

    let _ = cmd_tx.send(EngineCommand::StopAll);
    let _ = cmd_tx.send(EngineCommand::Shutdown);
    connection.terminate().await;
    engine_task.abort();
    println!("[{}] [SHUTDOWN] done", utils::ts_hm());
}

/// Everything that must be redone on a fresh socket: attach it to the
/// subscription registry, authorize, reload instrument metadata, restart the
/// balance and tick streams, and let the engine reconcile pending contracts.
#[allow(clippy::too_many_arguments)]
async fn bootstrap(
    connection: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    session: Arc<AccountSession>,
    market: Arc<MarketRegistry>,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    token: String,
    symbols: Vec<String>,
) -> Result<(), DynError> {
    let transport = connection.transport().await?;
    subscriptions.set_transport(transport.clone()).await;

    let info = session.authorize(&transport, &token).await?;
    println!(
        "[{}] [AUTH] logged in as {} | balance: {:.2} {}",
        utils::ts_hm(),
        info.loginid,
        info.balance,
        info.currency
    );

    let response = transport.call(protocol::active_symbols()).await?;
    let listing = protocol::parse_active_symbols(&response);
    market.load_symbols(&listing);
    println!(
        "[{}] [MARKET] loaded precision for {} instruments",
        utils::ts_hm(),
        market.len()
    );

    // Balance stream feeds the session for stake sizing.
    let mut balance = subscriptions.monitor(StreamKey::balance()).await?;
    {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(msg) = balance.updates.recv().await {
                session.apply_balance(&msg);
            }
        });
    }

    // Merge all instrument tick streams into the engine's single inbox.
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    for symbol in &symbols {
        let mut handle = subscriptions.monitor(StreamKey::ticks(symbol)).await?;
        let tick_tx = tick_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = handle.updates.recv().await {
                if tick_tx.send(msg).is_err() {
                    break;
                }
            }
        });
    }
    let _ = cmd_tx.send(EngineCommand::AttachTicks(tick_rx));
    let _ = cmd_tx.send(EngineCommand::Reconnected);

    Ok(())
}

fn print_event(event: &StatusEvent) {
    let ts = utils::ts_hm();
    match event {
        StatusEvent::ConnectionOpened { generation } => {
            println!("[{}] [CONN] opened (generation {})", ts, generation);
        }
        StatusEvent::ConnectionClosed => println!("[{}] [CONN] closed", ts),
        StatusEvent::ReconnectScheduled { attempt, delay_ms } => {
            println!(
                "[{}] [CONN] reconnect attempt {} in {}ms",
                ts, attempt, delay_ms
            );
        }
        StatusEvent::ReconnectExhausted { attempts } => {
            println!("[{}] [CONN] gave up after {} attempts", ts, attempts);
        }
        StatusEvent::DuplicateSubscribeAbsorbed { key } => {
            println!("[{}] [SUB] duplicate subscribe absorbed for {}", ts, key);
        }
        StatusEvent::DegradedQuote { symbol, quote } => {
            println!(
                "[{}] [STATS] degraded quote on {} ({}), digit defaulted to 0",
                ts, symbol, quote
            );
        }
        StatusEvent::TradeOpened {
            strategy_id,
            contract_id,
            stake,
        } => {
            println!(
                "[{}] [TRADE] {} opened contract {} | stake {:.2}",
                ts, strategy_id, contract_id, stake
            );
        }
        StatusEvent::TradeSettled {
            strategy_id,
            contract_id,
            won,
            profit,
        } => {
            let outcome = if *won { "WON" } else { "LOST" };
            println!(
                "[{}] [TRADE] {} contract {} {} | profit {:.2}",
                ts, strategy_id, contract_id, outcome, profit
            );
        }
        StatusEvent::TradeFailed {
            strategy_id,
            reason,
        } => {
            println!("[{}] [TRADE] {} failed: {}", ts, strategy_id, reason);
        }
        StatusEvent::StrategyStopped {
            strategy_id,
            reason,
        } => {
            println!("[{}] [STRATEGY] {} stopped: {}", ts, strategy_id, reason);
        }
        StatusEvent::CircuitBreakerTripped { cooldown_secs } => {
            println!(
                "[{}] [RISK] circuit breaker tripped, trading disabled for {}s",
                ts, cooldown_secs
            );
        }
        StatusEvent::CircuitBreakerReset => {
            println!("[{}] [RISK] circuit breaker reset", ts);
        }
    }
}
