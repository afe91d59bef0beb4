//! Persisted history records (swaps and sends)

use crate::assets::Network;
use crate::error::{OrchestratorError, OrchestratorResult};

use chrono::Utc;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal-string serialization for smallest-unit amounts
pub mod u256_dec {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Some(hex) = raw.strip_prefix("0x") {
            U256::from_str_radix(hex, 16).map_err(D::Error::custom)
        } else {
            U256::from_dec_str(&raw).map_err(D::Error::custom)
        }
    }
}

/// Status of a swap or send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    WaitingForApproveConfirmations,
    ApproveConfirmed,
    WaitingForSwapConfirmations,
    WaitingForSendConfirmations,
    WaitingForReceive,
    WaitingForConfirmations,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::WaitingForApproveConfirmations => "WAITING_FOR_APPROVE_CONFIRMATIONS",
            Status::ApproveConfirmed => "APPROVE_CONFIRMED",
            Status::WaitingForSwapConfirmations => "WAITING_FOR_SWAP_CONFIRMATIONS",
            Status::WaitingForSendConfirmations => "WAITING_FOR_SEND_CONFIRMATIONS",
            Status::WaitingForReceive => "WAITING_FOR_RECEIVE",
            Status::WaitingForConfirmations => "WAITING_FOR_CONFIRMATIONS",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Swap provider identifier as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "fastbtc")]
    FastBtc,
    #[serde(rename = "uniswapV2")]
    UniswapV2,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::FastBtc => "fastbtc",
            ProviderId::UniswapV2 => "uniswapV2",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRecord {
    pub id: String,
    pub provider: ProviderId,
    pub network: Network,
    pub wallet_id: String,
    pub from: String,
    pub to: String,
    #[serde(with = "u256_dec")]
    pub from_amount: U256,
    #[serde(with = "u256_dec")]
    pub to_amount: U256,
    /// Fee price chosen for the first transaction
    pub fee: Option<Decimal>,
    /// Basis points
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage: Option<u32>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_tx_hash: Option<String>,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub from_account_id: String,
    pub to_account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    pub network: Network,
    pub wallet_id: String,
    pub account_id: String,
    pub from: String,
    pub to: String,
    pub to_address: String,
    #[serde(with = "u256_dec")]
    pub amount: U256,
    pub fee: Option<Decimal>,
    pub tx_hash: String,
    pub status: Status,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_label: Option<String>,
}

/// Entry of a wallet's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum HistoryItem {
    Swap(SwapRecord),
    Send(TransactionRecord),
}

impl HistoryItem {
    pub fn id(&self) -> &str {
        match self {
            HistoryItem::Swap(s) => &s.id,
            HistoryItem::Send(t) => &t.id,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            HistoryItem::Swap(s) => s.status,
            HistoryItem::Send(t) => t.status,
        }
    }

    pub fn network(&self) -> Network {
        match self {
            HistoryItem::Swap(s) => s.network,
            HistoryItem::Send(t) => t.network,
        }
    }

    pub fn wallet_id(&self) -> &str {
        match self {
            HistoryItem::Swap(s) => &s.wallet_id,
            HistoryItem::Send(t) => &t.wallet_id,
        }
    }

    /// Source asset
    pub fn from(&self) -> &str {
        match self {
            HistoryItem::Swap(s) => &s.from,
            HistoryItem::Send(t) => &t.from,
        }
    }

    pub fn to(&self) -> &str {
        match self {
            HistoryItem::Swap(s) => &s.to,
            HistoryItem::Send(t) => &t.to,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Merge a partial update into the record
    pub fn apply(&mut self, update: &HistoryUpdate) {
        match self {
            HistoryItem::Swap(s) => {
                if let Some(status) = update.status {
                    s.status = status;
                }
                if let Some(hash) = &update.approve_tx_hash {
                    s.approve_tx_hash = Some(hash.clone());
                }
                if let Some(hash) = &update.swap_tx_hash {
                    s.swap_tx_hash = Some(hash.clone());
                }
                if update.end_time.is_some() {
                    s.end_time = update.end_time;
                }
            }
            HistoryItem::Send(t) => {
                if let Some(status) = update.status {
                    t.status = status;
                }
                if update.end_time.is_some() {
                    t.end_time = update.end_time;
                }
            }
        }
    }
}

/// Partial update returned by a state-machine step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryUpdate {
    pub status: Option<Status>,
    pub approve_tx_hash: Option<String>,
    pub swap_tx_hash: Option<String>,
    pub end_time: Option<i64>,
}

impl HistoryUpdate {
    pub fn status(status: Status) -> Self {
        let end_time = status.is_terminal().then(now_millis);
        Self {
            status: Some(status),
            end_time,
            ..Default::default()
        }
    }

    pub fn with_swap_tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.swap_tx_hash = Some(hash.into());
        self
    }

    pub fn with_approve_tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.approve_tx_hash = Some(hash.into());
        self
    }
}

/// Parse a persisted status name
pub fn parse_status(raw: &str) -> OrchestratorResult<Status> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| OrchestratorError::Storage(format!("unknown status {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap() -> SwapRecord {
        SwapRecord {
            id: "swap-1".to_string(),
            provider: ProviderId::UniswapV2,
            network: Network::Mainnet,
            wallet_id: "wallet-1".to_string(),
            from: "DAI".to_string(),
            to: "ETH".to_string(),
            from_amount: U256::from(10u64).pow(18.into()),
            to_amount: U256::from(1234u64),
            fee: Some(Decimal::new(50, 0)),
            slippage: Some(50),
            status: Status::WaitingForApproveConfirmations,
            approve_tx_hash: Some("0xapprove".to_string()),
            swap_tx_hash: None,
            start_time: 1_600_000_000_000,
            end_time: None,
            from_account_id: "acc-eth".to_string(),
            to_account_id: "acc-eth".to_string(),
        }
    }

    #[test]
    fn test_swap_record_uses_persisted_field_names() {
        let item = HistoryItem::Swap(swap());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["type"], "SWAP");
        assert_eq!(json["provider"], "uniswapV2");
        assert_eq!(json["status"], "WAITING_FOR_APPROVE_CONFIRMATIONS");
        assert_eq!(json["fromAmount"], "1000000000000000000");
        assert_eq!(json["approveTxHash"], "0xapprove");
        assert!(json.get("swapTxHash").is_none());

        let back: HistoryItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_hex_amounts_are_accepted() {
        let mut json = serde_json::to_value(HistoryItem::Swap(swap())).unwrap();
        json["toAmount"] = serde_json::Value::String("0xff".to_string());
        let item: HistoryItem = serde_json::from_value(json).unwrap();
        match item {
            HistoryItem::Swap(s) => assert_eq!(s.to_amount, U256::from(255u64)),
            _ => panic!("expected swap"),
        }
    }

    #[test]
    fn test_terminal_update_stamps_end_time() {
        let mut item = HistoryItem::Swap(swap());
        item.apply(&HistoryUpdate::status(Status::WaitingForSwapConfirmations).with_swap_tx_hash("0xswap"));
        assert_eq!(item.status(), Status::WaitingForSwapConfirmations);
        assert!(item.is_pending());

        item.apply(&HistoryUpdate::status(Status::Success));
        match &item {
            HistoryItem::Swap(s) => {
                assert_eq!(s.swap_tx_hash.as_deref(), Some("0xswap"));
                assert!(s.end_time.is_some());
            }
            _ => panic!("expected swap"),
        }
        assert!(!item.is_pending());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("WAITING_FOR_RECEIVE").unwrap(), Status::WaitingForReceive);
        assert!(parse_status("REFUNDED").is_err());
    }
}
