//! Wallet state
//!
//! Handles:
//! - Account records (assets, addresses, balances)
//! - Swap and send history records with their persisted field names
//! - Per-provider status metadata and transition rules
//! - The store contract and a JSON-file backed implementation

pub mod history;
pub mod status;
pub mod store;

pub use history::{now_millis, HistoryItem, HistoryUpdate, ProviderId, Status, SwapRecord, TransactionRecord};
pub use status::{FilterBucket, StatusMeta, StatusTable};
pub use store::{Account, AccountUpdate, InMemoryStore, WalletData, WalletState, WalletStore};
