//! FastBTC bridge relay client

use crate::config::FastBtcConfig;
use crate::coordination::retry::{Sleeper, TokioSleeper};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const GET_DEPOSIT_ADDRESS: &str = "getDepositAddress";
pub const GET_DEPOSIT_HISTORY: &str = "getDepositHistory";
pub const TX_AMOUNT: &str = "txAmount";

/// Request/response transport to the relay
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn request(&self, event: &str, args: Vec<Value>) -> OrchestratorResult<Value>;
}

/// Posts `{"args": [...]}` to `<endpoint>/<event>`
pub struct HttpRelayTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRelayTransport {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn request(&self, event: &str, args: Vec<Value>) -> OrchestratorResult<Value> {
        let url = format!("{}/{}", self.endpoint, event);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "args": args }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    OrchestratorError::BridgeDisconnected(e.to_string())
                } else {
                    OrchestratorError::Bridge(e.to_string())
                }
            })?;

        let body: Value = response
            .error_for_status()
            .map_err(|e| OrchestratorError::Bridge(e.to_string()))?
            .json()
            .await
            .map_err(|e| OrchestratorError::Bridge(e.to_string()))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(OrchestratorError::Bridge(format!("{} failed: {}", event, error)));
        }
        Ok(body)
    }
}

fn decimal_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
    let value = Value::deserialize(deserializer)?;
    parse_decimal(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid amount {}", value)))
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

/// Allowed deposit range in BTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TxAmountRange {
    #[serde(deserialize_with = "decimal_from_json")]
    pub min: Decimal,
    #[serde(deserialize_with = "decimal_from_json")]
    pub max: Decimal,
}

impl TxAmountRange {
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// Entry of the relay's per-address history feed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositHistoryEntry {
    pub tx_hash: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "decimal_from_json")]
    pub value_btc: Decimal,
    pub date_added: DateTime<Utc>,
}

impl DepositHistoryEntry {
    pub fn is_confirmed(&self) -> bool {
        self.status == "confirmed"
    }
}

#[derive(Debug, Deserialize)]
struct DepositAddress {
    btcadr: String,
}

/// Typed relay API with timeout and reconnect policy
pub struct FastBtcBridge {
    transport: Arc<dyn RelayTransport>,
    timeout: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl FastBtcBridge {
    pub fn new(transport: Arc<dyn RelayTransport>, config: &FastBtcConfig) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(config.request_timeout_ms),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn call(&self, event: &str, args: Vec<Value>) -> OrchestratorResult<Value> {
        let mut reconnects = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.transport.request(event, args.clone())).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout {
                    operation: format!("bridge {}", event),
                }),
            };

            match result {
                Err(OrchestratorError::BridgeDisconnected(reason)) if reconnects < self.reconnect_attempts => {
                    reconnects += 1;
                    warn!(
                        event = event,
                        attempt = reconnects,
                        "FastBtc bridge disconnected: {}",
                        reason
                    );
                    self.sleeper.sleep(self.reconnect_delay).await;
                }
                other => return other,
            }
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(event: &str, value: Value) -> OrchestratorResult<T> {
        serde_json::from_value(value)
            .map_err(|e| OrchestratorError::Bridge(format!("unexpected {} response: {}", event, e)))
    }

    /// Relay-controlled BTC deposit address for an RSK receiver
    pub async fn deposit_address(&self, web3_address: &str) -> OrchestratorResult<String> {
        let value = self.call(GET_DEPOSIT_ADDRESS, vec![json!(web3_address)]).await?;
        let address: DepositAddress = Self::decode(GET_DEPOSIT_ADDRESS, value)?;
        debug!("FastBtc deposit address for {}: {}", web3_address, address.btcadr);
        Ok(address.btcadr)
    }

    pub async fn deposit_history(&self, web3_address: &str) -> OrchestratorResult<Vec<DepositHistoryEntry>> {
        let value = self.call(GET_DEPOSIT_HISTORY, vec![json!(web3_address)]).await?;
        Self::decode(GET_DEPOSIT_HISTORY, value)
    }

    pub async fn tx_amount(&self) -> OrchestratorResult<TxAmountRange> {
        let value = self.call(TX_AMOUNT, Vec::new()).await?;
        Self::decode(TX_AMOUNT, value)
    }
}
