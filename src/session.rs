//! Account/session state: authorization and balance, re-established on every
//! reconnect. Trading is gated on a live authorization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::protocol;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub loginid: String,
    pub currency: String,
    pub balance: f64,
}

#[derive(Default)]
pub struct AccountSession {
    authorized: AtomicBool,
    info: Mutex<AccountInfo>,
}

impl AccountSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn authorize(
        &self,
        transport: &Arc<dyn Transport>,
        token: &str,
    ) -> Result<AccountInfo, TransportError> {
        let response = transport.call(protocol::authorize(token)).await?;
        if let Some(err) = protocol::api_error(&response) {
            self.authorized.store(false, Ordering::Release);
            return Err(TransportError::Api(err));
        }
        let Some(auth) = protocol::parse_authorize(&response) else {
            return Err(TransportError::Send("malformed authorize response".into()));
        };
        let info = AccountInfo {
            loginid: auth.loginid,
            currency: auth.currency,
            balance: auth.balance,
        };
        *self.info.lock().unwrap() = info.clone();
        self.authorized.store(true, Ordering::Release);
        Ok(info)
    }

    pub fn is_logged_in(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    /// Called when the connection drops; authorization does not survive a
    /// socket.
    pub fn mark_logged_out(&self) {
        self.authorized.store(false, Ordering::Release);
    }

    pub fn apply_balance(&self, msg: &Value) {
        if let Some(balance) = protocol::parse_balance(msg) {
            self.info.lock().unwrap().balance = balance;
        }
    }

    pub fn snapshot(&self) -> AccountInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn currency(&self) -> String {
        let info = self.info.lock().unwrap();
        if info.currency.is_empty() {
            "USD".to_string()
        } else {
            info.currency.clone()
        }
    }
}
