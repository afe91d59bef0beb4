//! User-facing notifications
//!
//! Swap providers attach a notification generator to some statuses; the
//! dispatcher and the transaction orchestrator hand the result to a
//! [`Notifier`]. Delivery is up to the host.

use crate::assets::pretty_balance;
use crate::state::{HistoryItem, TransactionRecord};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }

    /// Notification for a freshly submitted send
    pub fn transaction_sent(tx: &TransactionRecord) -> Self {
        Self::new(
            "New Transaction",
            format!(
                "Sending {} {} to {}",
                pretty_balance(tx.amount, &tx.from),
                tx.from,
                tx.to_address
            ),
        )
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, item: &HistoryItem, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, item: &HistoryItem, notification: Notification) {
        info!(
            id = item.id(),
            wallet_id = item.wallet_id(),
            "{}: {}",
            notification.title,
            notification.message
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Network;
    use crate::state::Status;
    use ethers::types::U256;

    #[test]
    fn test_transaction_sent_message() {
        let tx = TransactionRecord {
            id: "tx-1".to_string(),
            network: Network::Mainnet,
            wallet_id: "w1".to_string(),
            account_id: "a1".to_string(),
            from: "BTC".to_string(),
            to: "BTC".to_string(),
            to_address: "bc1qdest".to_string(),
            amount: U256::from(1_500_000u64),
            fee: None,
            tx_hash: "ab".to_string(),
            status: Status::WaitingForConfirmations,
            start_time: 0,
            end_time: None,
            fee_label: None,
        };
        let n = Notification::transaction_sent(&tx);
        assert_eq!(n.message, "Sending 0.015 BTC to bc1qdest");
    }
}
