//! Error types for the swap orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown asset {0}")]
    UnknownAsset(String),

    #[error("Account {account_id} not found in wallet {wallet_id}")]
    AccountNotFound {
        wallet_id: String,
        account_id: String,
    },

    #[error("Mnemonic unavailable for wallet {0}")]
    MnemonicUnavailable(String),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Transaction {tx_hash} not found")]
    TransactionNotFound { tx_hash: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Bridge error: {0}")]
    Bridge(String),

    #[error("Bridge disconnected: {0}")]
    BridgeDisconnected(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("History item {id} not found")]
    HistoryItemNotFound { id: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid amount: {0}")]
    Amount(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Check if error is transient and the polling loop should keep going
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransactionNotFound { .. }
                | OrchestratorError::BridgeDisconnected(_)
                | OrchestratorError::Timeout { .. }
        )
    }

    /// Errors raised while building a client; never retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, OrchestratorError::Config(_))
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
