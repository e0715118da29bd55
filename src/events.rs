use tokio::sync::mpsc;

/// Connectivity, trade-lifecycle and safety events emitted for display.
///
/// The core never prints trade state directly; it pushes events into the
/// sink and the binary renders them as timestamped log lines.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    ConnectionOpened { generation: u64 },
    ConnectionClosed,
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    ReconnectExhausted { attempts: u32 },
    DuplicateSubscribeAbsorbed { key: String },
    DegradedQuote { symbol: String, quote: f64 },
    TradeOpened { strategy_id: String, contract_id: u64, stake: f64 },
    TradeSettled { strategy_id: String, contract_id: u64, won: bool, profit: f64 },
    TradeFailed { strategy_id: String, reason: String },
    StrategyStopped { strategy_id: String, reason: String },
    CircuitBreakerTripped { cooldown_secs: u64 },
    CircuitBreakerReset,
}

/// Cheap clonable handle to the observability channel.
///
/// A disabled sink (tests, tools that don't care) drops events on the floor.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the process is shutting down; nothing to do.
            let _ = tx.send(event);
        }
    }
}
