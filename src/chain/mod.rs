//! Chain module - uniform client contract over heterogeneous chain backends
//!
//! This module provides:
//! - The `ChainProvider` / `WalletProvider` capability traits every backend implements
//! - The `Client` bundle handed to swap providers and orchestrators
//! - Fee strategies (EIP-1559, RPC gas price with multipliers, bitcoin fee API)
//! - The per-chain client factory and the per-account client cache

pub mod bitcoin;
pub mod evm;
pub mod factory;
pub mod fees;
pub mod registry;

pub use factory::{BackendRequest, ChainBackendFactory, ChainClientFactory, HostProviders, WalletFactory, WalletRequest};
pub use fees::{FeeDetails, FeeLevel, FeeMultipliers, FeeProvider, FeeStrategy};
pub use registry::ClientRegistry;

use crate::assets::{AssetInfo, ChainId, Network};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Execution status of a transaction as seen on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

/// Transaction as returned by `ChainProvider::get_transaction_by_hash`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: String,
    pub value: U256,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub status: TxStatus,
}

impl ChainTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    /// Unix seconds
    pub timestamp: u64,
}

/// Parameters for a transfer or contract call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    pub to: String,
    pub value: U256,
    /// Hex-encoded call data
    pub data: Option<String>,
    /// Fee price in the chain's fee unit (gwei, sat/vB)
    pub fee: Option<Decimal>,
    pub gas_limit: Option<u64>,
}

/// Handle of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentTransaction {
    pub hash: String,
    pub to: String,
    pub value: U256,
    pub fee: Option<Decimal>,
}

/// Read access to chain state
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Aggregate balance of `addresses`, one entry per asset
    async fn get_balance(
        &self,
        addresses: &[String],
        assets: &[&'static AssetInfo],
    ) -> OrchestratorResult<Vec<U256>>;

    /// Fails with `TransactionNotFound` while the transaction is not visible
    async fn get_transaction_by_hash(&self, hash: &str) -> OrchestratorResult<ChainTransaction>;

    async fn get_block_height(&self) -> OrchestratorResult<u64>;

    async fn get_block_by_number(&self, number: u64) -> OrchestratorResult<Block>;

    async fn estimate_gas(&self, _from: &str, _tx: &SendOptions) -> OrchestratorResult<U256> {
        Err(OrchestratorError::Unsupported(
            "gas estimation on this chain".to_string(),
        ))
    }
}

/// Signing and submission
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn send_transaction(&self, options: SendOptions) -> OrchestratorResult<SentTransaction>;

    /// Receiving address used for swaps
    async fn get_address(&self) -> OrchestratorResult<String>;

    async fn get_used_addresses(&self) -> OrchestratorResult<Vec<String>>;

    /// Total network fee (smallest unit) for each candidate transaction
    async fn get_total_fees(
        &self,
        candidates: &BTreeMap<FeeLevel, SendOptions>,
        max: bool,
    ) -> OrchestratorResult<BTreeMap<FeeLevel, U256>>;
}

/// On-chain atomic swap support attached to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapCapability {
    EvmHtlc {
        contract_address: Address,
        /// Extra gas limit in basis points (3000 = 30%)
        gas_limit_margin: Option<u32>,
    },
    BitcoinScript {
        scraper_url: String,
    },
}

/// Who signs for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerKind {
    Mnemonic,
    Hardware(String),
    Host,
}

/// Summary of the choices the factory made for a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub chain: ChainId,
    pub network: Network,
    pub fee_strategy: FeeStrategy,
    pub signer: SignerKind,
}

/// Connected client bundle
#[derive(Clone)]
pub struct Client {
    pub chain: Arc<dyn ChainProvider>,
    pub wallet: Arc<dyn WalletProvider>,
    pub swap: Option<SwapCapability>,
    pub fees: Option<Arc<dyn FeeProvider>>,
    pub profile: ClientProfile,
}

impl Client {
    /// Confirmation check for the retry scheduler
    ///
    /// `Some` once the transaction has at least one confirmation. A
    /// transaction the node does not know yet counts as pending.
    pub async fn confirmed_transaction(&self, hash: &str) -> OrchestratorResult<Option<ChainTransaction>> {
        match self.chain.get_transaction_by_hash(hash).await {
            Ok(tx) if tx.is_confirmed() => Ok(Some(tx)),
            Ok(_) => Ok(None),
            Err(e @ OrchestratorError::TransactionNotFound { .. }) => {
                warn!("{}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("profile", &self.profile)
            .field("swap", &self.swap)
            .field("has_fee_provider", &self.fees.is_some())
            .finish()
    }
}
