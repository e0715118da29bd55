//! Request builders and response views for the trading API.
//!
//! The API is JSON-over-WebSocket: every request carries a client-assigned
//! `req_id` that the matching response echoes back, streaming messages carry
//! a server-assigned `subscription.id`, and failures arrive as an `error`
//! object inside an otherwise normal response envelope.

use serde::Deserialize;
use serde_json::{json, Value};

/// Contract types the strategies trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    DigitEven,
    DigitOdd,
    DigitOver,
    DigitUnder,
    DigitMatch,
    DigitDiff,
    Rise,
    Fall,
}

impl ContractKind {
    pub fn api_code(&self) -> &'static str {
        match self {
            ContractKind::DigitEven => "DIGITEVEN",
            ContractKind::DigitOdd => "DIGITODD",
            ContractKind::DigitOver => "DIGITOVER",
            ContractKind::DigitUnder => "DIGITUNDER",
            ContractKind::DigitMatch => "DIGITMATCH",
            ContractKind::DigitDiff => "DIGITDIFF",
            ContractKind::Rise => "CALL",
            ContractKind::Fall => "PUT",
        }
    }

}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_code())
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

pub fn tick_stream(symbol: &str) -> Value {
    json!({ "ticks": symbol, "subscribe": 1 })
}

pub fn balance_stream() -> Value {
    json!({ "balance": 1, "subscribe": 1 })
}

pub fn active_symbols() -> Value {
    json!({ "active_symbols": "brief", "product_type": "basic" })
}

pub fn forget(subscription_id: &str) -> Value {
    json!({ "forget": subscription_id })
}

pub fn forget_all(stream_type: &str) -> Value {
    json!({ "forget_all": stream_type })
}

pub fn ping() -> Value {
    json!({ "ping": 1 })
}

/// Price quote for a prospective contract.
pub fn quote(
    symbol: &str,
    contract: ContractKind,
    stake: f64,
    currency: &str,
    duration_ticks: u32,
    prediction: Option<u8>,
) -> Value {
    let mut req = json!({
        "proposal": 1,
        "amount": stake,
        "basis": "stake",
        "contract_type": contract.api_code(),
        "currency": currency,
        "duration": duration_ticks,
        "duration_unit": "t",
        "symbol": symbol,
    });
    if let Some(digit) = prediction {
        req["barrier"] = json!(digit.to_string());
    }
    req
}

/// Purchase a previously quoted contract at the quoted price.
pub fn accept(quote_id: &str, price: f64) -> Value {
    json!({ "buy": quote_id, "price": price })
}

/// Contract status; with `subscribe` the server streams updates until sold.
pub fn open_contract(contract_id: u64, subscribe: bool) -> Value {
    let mut req = json!({
        "proposal_open_contract": 1,
        "contract_id": contract_id,
    });
    if subscribe {
        req["subscribe"] = json!(1);
    }
    req
}

// ---------------------------------------------------------------------------
// Response views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Error envelope attached to a response, if any.
pub fn api_error(msg: &Value) -> Option<ApiError> {
    msg.get("error")
        .and_then(|e| serde_json::from_value(e.clone()).ok())
}

pub fn is_already_subscribed(err: &ApiError) -> bool {
    err.code == "AlreadySubscribed"
}

/// Server-assigned id of the stream this message belongs to.
pub fn subscription_id(msg: &Value) -> Option<&str> {
    msg.get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(|id| id.as_str())
}

pub fn req_id(msg: &Value) -> Option<u64> {
    msg.get("req_id").and_then(|id| id.as_u64())
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickMsg {
    pub symbol: String,
    pub quote: f64,
    pub epoch: i64,
}

pub fn parse_tick(msg: &Value) -> Option<TickMsg> {
    msg.get("tick")
        .and_then(|t| serde_json::from_value(t.clone()).ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteMsg {
    pub id: String,
    pub ask_price: f64,
    pub payout: f64,
}

pub fn parse_quote(msg: &Value) -> Option<QuoteMsg> {
    msg.get("proposal")
        .and_then(|p| serde_json::from_value(p.clone()).ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptMsg {
    pub contract_id: u64,
    pub buy_price: f64,
}

pub fn parse_accept(msg: &Value) -> Option<AcceptMsg> {
    msg.get("buy")
        .and_then(|b| serde_json::from_value(b.clone()).ok())
}

#[derive(Debug, Clone)]
pub struct ContractUpdate {
    pub is_sold: bool,
    pub status: String,
    pub profit: f64,
}

pub fn parse_contract_update(msg: &Value) -> Option<ContractUpdate> {
    let poc = msg.get("proposal_open_contract")?;
    Some(ContractUpdate {
        // The field arrives as 0/1 rather than a JSON bool.
        is_sold: poc.get("is_sold").and_then(|v| v.as_u64()).unwrap_or(0) == 1,
        status: poc
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("open")
            .to_string(),
        profit: poc.get("profit").and_then(|v| v.as_f64()).unwrap_or(0.0),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeMsg {
    pub loginid: String,
    pub currency: String,
    pub balance: f64,
}

pub fn parse_authorize(msg: &Value) -> Option<AuthorizeMsg> {
    msg.get("authorize")
        .and_then(|a| serde_json::from_value(a.clone()).ok())
}

pub fn parse_balance(msg: &Value) -> Option<f64> {
    msg.get("balance")
        .and_then(|b| b.get("balance"))
        .and_then(|v| v.as_f64())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub pip: f64,
    #[serde(default)]
    pub market: String,
}

pub fn parse_active_symbols(msg: &Value) -> Vec<SymbolInfo> {
    msg.get("active_symbols")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_request_shape() {
        let req = quote("R_100", ContractKind::DigitDiff, 1.5, "USD", 5, Some(7));
        assert_eq!(req["proposal"], 1);
        assert_eq!(req["contract_type"], "DIGITDIFF");
        assert_eq!(req["duration_unit"], "t");
        assert_eq!(req["barrier"], "7");
    }

    #[test]
    fn test_quote_request_omits_barrier_without_prediction() {
        let req = quote("R_100", ContractKind::DigitEven, 1.0, "USD", 1, None);
        assert!(req.get("barrier").is_none());
    }

    #[test]
    fn test_error_envelope() {
        let msg = serde_json::json!({
            "error": { "code": "AlreadySubscribed", "message": "dup" }
        });
        let err = api_error(&msg).expect("error should parse");
        assert!(is_already_subscribed(&err));
    }

    #[test]
    fn test_contract_update_sold_flag() {
        let msg = serde_json::json!({
            "proposal_open_contract": { "is_sold": 1, "status": "won", "profit": 0.95 }
        });
        let update = parse_contract_update(&msg).expect("update should parse");
        assert!(update.is_sold);
        assert_eq!(update.status, "won");
        assert!((update.profit - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_tick_parse() {
        let msg = serde_json::json!({
            "tick": { "symbol": "R_100", "quote": 1234.56, "epoch": 1700000000i64 },
            "subscription": { "id": "abc" }
        });
        let tick = parse_tick(&msg).expect("tick should parse");
        assert_eq!(tick.symbol, "R_100");
        assert_eq!(subscription_id(&msg), Some("abc"));
    }
}
