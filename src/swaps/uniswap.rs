//! Uniswap V2 swaps on Ethereum
//!
//! ERC20 sources may need an `approve` first. The approval and the swap are
//! each submitted under the Ethereum chain lock; when no approval is needed
//! the swap is sent straight from `new_swap`.

use super::amm::{
    amount_out, approve_call, hex_data, minimum_output, pair_address, router_token, AmmChain, RouterSwap,
    UniswapDeployment, SWAP_DEADLINE_SECS,
};
use super::{
    new_swap_record, swap_completed, swap_failed, FeeEstimateRequest, FeeTable, Quote, QuoteRequest, SupportedPair,
    SwapContext, SwapProvider,
};
use crate::assets::{self, currency_to_unit, AssetInfo, ChainId, Network};
use crate::balance::BalanceSyncer;
use crate::chain::evm::parse_address;
use crate::chain::{SendOptions, TxStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Notification;
use crate::state::{FilterBucket, HistoryItem, HistoryUpdate, ProviderId, Status, StatusMeta, StatusTable, SwapRecord};

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SLIPPAGE_BPS: u32 = 50;
/// Gas limit headroom applied to fee estimates, in percent
const GAS_HEADROOM_PERCENT: i64 = 110;

fn approving(item: &HistoryItem) -> Notification {
    Notification::new("Approving", format!("Approving {}", item.from()))
}

fn engaging(_: &HistoryItem) -> Notification {
    Notification::new("Swapping", "Engaging the unicorn")
}

pub static UNISWAP_STATUSES: StatusTable = StatusTable {
    entries: &[
        StatusMeta {
            status: Status::WaitingForApproveConfirmations,
            step: 0,
            label: "Approving {from}",
            filter: FilterBucket::Pending,
            notification: Some(approving),
        },
        StatusMeta {
            status: Status::ApproveConfirmed,
            step: 1,
            label: "Swapping {from}",
            filter: FilterBucket::Pending,
            notification: None,
        },
        StatusMeta {
            status: Status::WaitingForSwapConfirmations,
            step: 1,
            label: "Swapping {from}",
            filter: FilterBucket::Pending,
            notification: Some(engaging),
        },
        StatusMeta {
            status: Status::Success,
            step: 2,
            label: "Completed",
            filter: FilterBucket::Completed,
            notification: Some(swap_completed),
        },
        StatusMeta {
            status: Status::Failed,
            step: 2,
            label: "Swap Failed",
            filter: FilterBucket::Refunded,
            notification: Some(swap_failed),
        },
    ],
    timeline_steps: &["APPROVE", "SWAP"],
    total_steps: 3,
};

/// Both assets of a quote, checked to live on Ethereum
struct Legs {
    from: &'static AssetInfo,
    to: &'static AssetInfo,
}

impl Legs {
    fn resolve(from: &str, to: &str) -> OrchestratorResult<Option<Self>> {
        let from = assets::asset(from)?;
        let to = assets::asset(to)?;
        if from.chain != ChainId::Ethereum || to.chain != ChainId::Ethereum || from.code == to.code {
            return Ok(None);
        }
        Ok(Some(Self { from, to }))
    }
}

pub struct UniswapSwapProvider {
    ctx: SwapContext,
    amm: Arc<dyn AmmChain>,
    deployment: UniswapDeployment,
    balances: Arc<BalanceSyncer>,
}

impl UniswapSwapProvider {
    pub fn new(
        ctx: SwapContext,
        amm: Arc<dyn AmmChain>,
        deployment: UniswapDeployment,
        balances: Arc<BalanceSyncer>,
    ) -> Self {
        Self {
            ctx,
            amm,
            deployment,
            balances,
        }
    }

    fn legs(from: &str, to: &str) -> OrchestratorResult<Legs> {
        Legs::resolve(from, to)?
            .ok_or_else(|| OrchestratorError::Unsupported(format!("uniswap pair {} -> {}", from, to)))
    }

    /// Whether the router still needs an allowance for `quote.from_amount`
    async fn requires_approval(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<bool> {
        let legs = Self::legs(&quote.from, &quote.to)?;
        if legs.from.is_native() {
            return Ok(false);
        }

        let token = router_token(network, legs.from)?;
        let owner = self
            .ctx
            .swap_address(network, wallet_id, &quote.from, &quote.from_account_id)
            .await?;
        let allowance = self
            .amm
            .allowance(network, token, parse_address(&owner)?, self.deployment.router)
            .await?;
        debug!(token = ?token, %allowance, needed = %quote.from_amount, "Router allowance");
        Ok(allowance < quote.from_amount)
    }

    fn approval_tx(&self, network: Network, quote: &Quote) -> OrchestratorResult<SendOptions> {
        let legs = Self::legs(&quote.from, &quote.to)?;
        let token = router_token(network, legs.from)?;
        let data = approve_call(self.deployment.router, quote.from_amount)?;
        Ok(SendOptions {
            to: format!("{:?}", token),
            value: U256::zero(),
            data: Some(hex_data(&data)),
            fee: quote.fee,
            gas_limit: None,
        })
    }

    async fn swap_tx(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<SendOptions> {
        let legs = Self::legs(&quote.from, &quote.to)?;
        let client = self
            .ctx
            .client(network, wallet_id, &quote.from, &quote.from_account_id)
            .await?;

        let height = client.chain.get_block_height().await?;
        let block = client.chain.get_block_by_number(height).await?;
        let recipient = self
            .ctx
            .swap_address(network, wallet_id, &quote.to, &quote.to_account_id)
            .await?;

        let swap = RouterSwap {
            amount_in: quote.from_amount,
            amount_out_min: minimum_output(quote.to_amount, SLIPPAGE_BPS),
            path: vec![router_token(network, legs.from)?, router_token(network, legs.to)?],
            recipient: parse_address(&recipient)?,
            deadline: U256::from(block.timestamp + SWAP_DEADLINE_SECS),
            native_in: legs.from.is_native(),
            native_out: legs.to.is_native(),
        };
        let (data, value) = swap.encode()?;

        Ok(SendOptions {
            to: format!("{:?}", self.deployment.router),
            value,
            data: Some(hex_data(&data)),
            fee: quote.fee,
            gas_limit: None,
        })
    }

    async fn send_approval(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<HistoryUpdate> {
        let client = self
            .ctx
            .client(network, wallet_id, &quote.from, &quote.from_account_id)
            .await?;
        let sent = client.wallet.send_transaction(self.approval_tx(network, quote)?).await?;
        info!(wallet_id = wallet_id, tx_hash = %sent.hash, "Uniswap approval sent for {}", quote.from);
        Ok(HistoryUpdate::status(Status::WaitingForApproveConfirmations).with_approve_tx_hash(sent.hash))
    }

    async fn send_swap(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<HistoryUpdate> {
        let tx = self.swap_tx(network, wallet_id, quote).await?;
        let client = self
            .ctx
            .client(network, wallet_id, &quote.from, &quote.from_account_id)
            .await?;
        let sent = client.wallet.send_transaction(tx).await?;
        info!(
            wallet_id = wallet_id,
            tx_hash = %sent.hash,
            "Uniswap swap sent {} -> {}",
            quote.from,
            quote.to
        );
        Ok(HistoryUpdate::status(Status::WaitingForSwapConfirmations).with_swap_tx_hash(sent.hash))
    }

    async fn wait_for_approve_confirmations(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let hash = swap
            .approve_tx_hash
            .as_deref()
            .ok_or_else(|| OrchestratorError::Internal(format!("swap {} has no approval transaction", swap.id)))?;
        let client = self
            .ctx
            .client(swap.network, &swap.wallet_id, &swap.from, &swap.from_account_id)
            .await?;

        Ok(client
            .confirmed_transaction(hash)
            .await?
            .map(|_| HistoryUpdate::status(Status::ApproveConfirmed)))
    }

    async fn wait_for_swap_confirmations(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let hash = swap
            .swap_tx_hash
            .as_deref()
            .ok_or_else(|| OrchestratorError::Internal(format!("swap {} has no swap transaction", swap.id)))?;
        let client = self
            .ctx
            .client(swap.network, &swap.wallet_id, &swap.from, &swap.from_account_id)
            .await?;

        let Some(tx) = client.confirmed_transaction(hash).await? else {
            return Ok(None);
        };

        let status = match tx.status {
            TxStatus::Success => Status::Success,
            TxStatus::Failed => Status::Failed,
            TxStatus::Pending => return Ok(None),
        };

        self.refresh_balance(swap);
        Ok(Some(HistoryUpdate::status(status)))
    }

    /// Resync the source asset in the background
    fn refresh_balance(&self, swap: &SwapRecord) {
        let syncer = self.balances.clone();
        let network = swap.network;
        let wallet_id = swap.wallet_id.clone();
        let assets = vec![swap.from.clone()];
        tokio::spawn(async move {
            if let Err(e) = syncer.sync(network, &wallet_id, Some(&assets)).await {
                warn!(wallet_id = %wallet_id, "Post-swap balance sync failed: {}", e);
            }
        });
    }
}

fn quote_of(swap: &SwapRecord) -> Quote {
    Quote {
        provider: swap.provider,
        from: swap.from.clone(),
        to: swap.to.clone(),
        from_amount: swap.from_amount,
        to_amount: swap.to_amount,
        fee: swap.fee,
        from_account_id: swap.from_account_id.clone(),
        to_account_id: swap.to_account_id.clone(),
    }
}

/// gas * 1.1 * price (gwei) in currency units of `native`
fn gas_fee(gas: U256, gwei: Decimal, native: &AssetInfo) -> OrchestratorResult<Decimal> {
    if gas > U256::from(u64::MAX) {
        return Err(OrchestratorError::GasEstimation(format!("gas estimate {} out of range", gas)));
    }
    let gas = Decimal::from(gas.low_u64());
    let wei = gas * Decimal::new(GAS_HEADROOM_PERCENT, 2) * gwei * Decimal::from(1_000_000_000u64);
    let scale = Decimal::from_i128_with_scale(10i128.pow(native.decimals), 0);
    wei.checked_div(scale)
        .map(|d| d.normalize())
        .ok_or_else(|| OrchestratorError::Amount(format!("fee of {} gas overflows", gas)))
}

#[async_trait]
impl SwapProvider for UniswapSwapProvider {
    fn id(&self) -> ProviderId {
        ProviderId::UniswapV2
    }

    /// Pools are discovered per quote
    async fn supported_pairs(&self) -> OrchestratorResult<Vec<SupportedPair>> {
        Ok(Vec::new())
    }

    async fn get_quote(&self, request: &QuoteRequest) -> OrchestratorResult<Option<Quote>> {
        let Some(legs) = Legs::resolve(&request.from, &request.to)? else {
            return Ok(None);
        };

        let token_in = router_token(request.network, legs.from)?;
        let token_out = router_token(request.network, legs.to)?;
        let pair = pair_address(&self.deployment, token_in, token_out);
        let reserves = self.amm.pair_reserves(request.network, pair).await?;
        let (reserve_in, reserve_out) = reserves.oriented(token_in, token_out)?;

        let from_amount = currency_to_unit(legs.from, request.amount)?;
        let to_amount = amount_out(from_amount, reserve_in, reserve_out)?;

        Ok(Some(Quote {
            provider: ProviderId::UniswapV2,
            from: request.from.clone(),
            to: request.to.clone(),
            from_amount,
            to_amount,
            fee: None,
            from_account_id: request.from_account_id.clone(),
            to_account_id: request.to_account_id.clone(),
        }))
    }

    async fn new_swap(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<SwapRecord> {
        Self::legs(&quote.from, &quote.to)?;

        let update = self
            .ctx
            .scheduler
            .with_lock(&self.ctx.locks, network, wallet_id, &quote.from, move || async move {
                if self.requires_approval(network, wallet_id, quote).await? {
                    self.send_approval(network, wallet_id, quote).await
                } else {
                    self.send_swap(network, wallet_id, quote).await
                }
            })
            .await?;

        new_swap_record(
            ProviderId::UniswapV2,
            network,
            wallet_id,
            quote,
            update,
            Some(SLIPPAGE_BPS),
        )
    }

    async fn estimate_fees(&self, request: FeeEstimateRequest<'_>) -> OrchestratorResult<Option<FeeTable>> {
        let Some(legs) = Legs::resolve(&request.quote.from, &request.quote.to)? else {
            return Ok(None);
        };
        let native = assets::asset(legs.from.chain.native_asset())?;
        if request.asset != legs.from.code && request.asset != native.code {
            return Ok(None);
        }

        let quote = request.quote;
        let client = self
            .ctx
            .client(request.network, request.wallet_id, &quote.from, &quote.from_account_id)
            .await?;
        let from = self
            .ctx
            .swap_address(request.network, request.wallet_id, &quote.from, &quote.from_account_id)
            .await?;

        let mut gas = U256::zero();
        if self.requires_approval(request.network, request.wallet_id, quote).await? {
            gas += client
                .chain
                .estimate_gas(&from, &self.approval_tx(request.network, quote)?)
                .await?;
        }
        let swap_tx = self.swap_tx(request.network, request.wallet_id, quote).await?;
        gas += client.chain.estimate_gas(&from, &swap_tx).await?;

        let fees = request
            .fee_prices
            .iter()
            .map(|(level, price)| Ok((*level, gas_fee(gas, *price, native)?)))
            .collect::<OrchestratorResult<FeeTable>>()?;
        debug!(gas = %gas, tiers = fees.len(), "Uniswap fee estimate");
        Ok(Some(fees))
    }

    async fn perform_next_swap_action(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let scheduler = &self.ctx.scheduler;
        match swap.status {
            Status::WaitingForApproveConfirmations => scheduler
                .with_interval(|| self.wait_for_approve_confirmations(swap))
                .await
                .map(Some),
            Status::ApproveConfirmed => {
                if let Some(hash) = &swap.swap_tx_hash {
                    warn!(swap_id = %swap.id, tx_hash = %hash, "Swap already submitted, waiting for it");
                    return Ok(Some(
                        HistoryUpdate::status(Status::WaitingForSwapConfirmations).with_swap_tx_hash(hash.clone()),
                    ));
                }
                let quote = quote_of(swap);
                scheduler
                    .with_lock(&self.ctx.locks, swap.network, &swap.wallet_id, &swap.from, || {
                        self.send_swap(swap.network, &swap.wallet_id, &quote)
                    })
                    .await
                    .map(Some)
            }
            Status::WaitingForSwapConfirmations => scheduler
                .with_interval(|| self.wait_for_swap_confirmations(swap))
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    fn statuses(&self) -> &'static StatusTable {
        &UNISWAP_STATUSES
    }
}
