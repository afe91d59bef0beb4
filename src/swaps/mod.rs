//! Swap providers
//!
//! Each provider is one protocol family with its own state machine and
//! status table:
//! - `fastbtc`: BTC to RBTC through a custodial bridge relay
//! - `uniswap`: Uniswap V2 constant-product swaps on Ethereum
//!
//! Providers build clients through the shared [`SwapContext`], wait with the
//! retry scheduler and take the chain lock around every submission.

pub mod amm;
pub mod bridge;
pub mod fastbtc;
pub mod uniswap;

pub use fastbtc::FastBtcSwapProvider;
pub use uniswap::UniswapSwapProvider;

use crate::assets::{self, pretty_balance, Network};
use crate::chain::{Client, ClientRegistry, FeeDetails, FeeLevel};
use crate::coordination::{AssetLockRegistry, RetryScheduler};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Notification;
use crate::state::{now_millis, HistoryItem, HistoryUpdate, ProviderId, StatusTable, SwapRecord};

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Request for a price
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub network: Network,
    pub wallet_id: String,
    pub from: String,
    pub to: String,
    /// Amount of `from` in currency units
    pub amount: Decimal,
    pub from_account_id: String,
    pub to_account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub provider: ProviderId,
    pub from: String,
    pub to: String,
    pub from_amount: U256,
    pub to_amount: U256,
    /// Fee price picked by the user for the first transaction
    pub fee: Option<Decimal>,
    pub from_account_id: String,
    pub to_account_id: String,
}

impl Quote {
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = Some(fee);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportedPair {
    pub from: String,
    pub to: String,
    pub rate: Decimal,
    /// Smallest unit of `from`
    pub min: U256,
    pub max: U256,
}

pub struct FeeEstimateRequest<'a> {
    pub network: Network,
    pub wallet_id: &'a str,
    pub asset: &'a str,
    pub quote: &'a Quote,
    pub fee_prices: &'a FeeDetails,
    /// Spend the whole balance
    pub max: bool,
}

/// Total fee per tier in currency units of the paying chain's native asset
pub type FeeTable = BTreeMap<FeeLevel, Decimal>;

#[async_trait]
pub trait SwapProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn supported_pairs(&self) -> OrchestratorResult<Vec<SupportedPair>>;

    /// `None` when the pair or amount is outside this provider's domain
    async fn get_quote(&self, request: &QuoteRequest) -> OrchestratorResult<Option<Quote>>;

    /// Perform the first state-advancing action and return the new record
    async fn new_swap(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<SwapRecord>;

    async fn estimate_fees(&self, request: FeeEstimateRequest<'_>) -> OrchestratorResult<Option<FeeTable>>;

    /// Advance `swap` by one step; `None` while the current step is still pending
    async fn perform_next_swap_action(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>>;

    fn statuses(&self) -> &'static StatusTable;
}

/// Services shared by all swap providers
#[derive(Clone)]
pub struct SwapContext {
    pub registry: Arc<ClientRegistry>,
    pub scheduler: Arc<RetryScheduler>,
    pub locks: Arc<AssetLockRegistry>,
}

impl SwapContext {
    pub fn new(registry: Arc<ClientRegistry>, scheduler: Arc<RetryScheduler>, locks: Arc<AssetLockRegistry>) -> Self {
        Self {
            registry,
            scheduler,
            locks,
        }
    }

    pub async fn client(&self, network: Network, wallet_id: &str, asset: &str, account_id: &str) -> OrchestratorResult<Client> {
        self.registry.client(network, wallet_id, asset, account_id).await
    }

    /// Receiving address of an account, formatted for its chain
    pub async fn swap_address(
        &self,
        network: Network,
        wallet_id: &str,
        asset: &str,
        account_id: &str,
    ) -> OrchestratorResult<String> {
        let client = self.client(network, wallet_id, asset, account_id).await?;
        let raw = client.wallet.get_address().await?;
        Ok(assets::chain_of(asset)?.format_address(&raw))
    }
}

/// Fresh record for a swap whose first step produced `update`
///
/// The first step must set a status.
pub(crate) fn new_swap_record(
    provider: ProviderId,
    network: Network,
    wallet_id: &str,
    quote: &Quote,
    update: HistoryUpdate,
    slippage: Option<u32>,
) -> OrchestratorResult<SwapRecord> {
    let status = update.status.ok_or_else(|| {
        OrchestratorError::Internal(format!("{} first swap step returned no status", provider))
    })?;
    Ok(SwapRecord {
        id: uuid::Uuid::new_v4().to_string(),
        provider,
        network,
        wallet_id: wallet_id.to_string(),
        from: quote.from.clone(),
        to: quote.to.clone(),
        from_amount: quote.from_amount,
        to_amount: quote.to_amount,
        fee: quote.fee,
        slippage,
        status,
        approve_tx_hash: update.approve_tx_hash,
        swap_tx_hash: update.swap_tx_hash,
        start_time: now_millis(),
        end_time: update.end_time,
        from_account_id: quote.from_account_id.clone(),
        to_account_id: quote.to_account_id.clone(),
    })
}

pub(crate) fn swap_completed(item: &HistoryItem) -> Notification {
    let received = match item {
        HistoryItem::Swap(swap) => format!("{} {}", pretty_balance(swap.to_amount, &swap.to), swap.to),
        HistoryItem::Send(tx) => tx.to.clone(),
    };
    Notification::new("Swap completed", format!("Swap completed, {} ready to use", received))
}

pub(crate) fn swap_failed(_: &HistoryItem) -> Notification {
    Notification::new("Swap failed", "Swap failed")
}
