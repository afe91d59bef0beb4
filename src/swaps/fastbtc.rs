//! BTC to RBTC through the FastBTC relay
//!
//! The user sends BTC to a relay-controlled deposit address derived from
//! their RSK receiving address. The relay later pays out RBTC; the payout
//! shows up in the relay's history feed as a confirmed `transfer` of the
//! same BTC value shortly after the confirmed `deposit`.

use super::bridge::{DepositHistoryEntry, FastBtcBridge};
use super::{
    new_swap_record, swap_completed, swap_failed, FeeEstimateRequest, FeeTable, Quote, QuoteRequest, SupportedPair,
    SwapContext, SwapProvider,
};
use crate::assets::{self, currency_to_unit, unit_to_currency, Network};
use crate::chain::SendOptions;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Notification;
use crate::state::{FilterBucket, HistoryItem, HistoryUpdate, ProviderId, Status, StatusMeta, StatusTable, SwapRecord};

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const FROM_ASSET: &str = "BTC";
const TO_ASSET: &str = "RBTC";

/// Flat relay fee in satoshis
const SATOSHI_FEE: u64 = 5000;
/// Share of the amount kept after the 0.2% relay fee, in per mille
const RATE_PER_MILLE: u64 = 998;
const SLIPPAGE_BPS: u32 = 50;
/// Payout must land within a day of the deposit
const RECEIVE_WINDOW_MS: i64 = 86_400_000;

fn swap_initiated(item: &HistoryItem) -> Notification {
    Notification::new("Swap initiated", format!("Swapping {} to {}", item.from(), item.to()))
}

pub static FASTBTC_STATUSES: StatusTable = StatusTable {
    entries: &[
        StatusMeta {
            status: Status::WaitingForSendConfirmations,
            step: 0,
            label: "Swapping {from}",
            filter: FilterBucket::Pending,
            notification: Some(swap_initiated),
        },
        StatusMeta {
            status: Status::WaitingForReceive,
            step: 1,
            label: "Swapping {from}",
            filter: FilterBucket::Pending,
            notification: None,
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
    timeline_steps: &["SWAP"],
    total_steps: 3,
};

/// Whether the relay paid out the deposit made by `swap_tx_hash`
///
/// Entries are scanned oldest first; the latest confirmed deposit of the
/// hash is the reference. A payout is a confirmed transfer of the same value
/// strictly after that deposit and within a day. Once seen it stays seen.
pub fn payout_received(history: &[DepositHistoryEntry], swap_tx_hash: &str) -> bool {
    let mut entries: Vec<&DepositHistoryEntry> = history.iter().collect();
    entries.sort_by_key(|e| e.date_added);

    let mut deposit: Option<&DepositHistoryEntry> = None;
    let mut received = false;
    for entry in entries.into_iter().filter(|e| e.is_confirmed()) {
        if entry.kind == "deposit" && entry.tx_hash == swap_tx_hash {
            deposit = Some(entry);
        } else if let Some(d) = deposit {
            let elapsed = (entry.date_added - d.date_added).num_milliseconds();
            if entry.kind == "transfer"
                && entry.value_btc == d.value_btc
                && elapsed > 0
                && elapsed < RECEIVE_WINDOW_MS
            {
                received = true;
            }
        }
    }
    received
}

pub struct FastBtcSwapProvider {
    ctx: SwapContext,
    bridge: FastBtcBridge,
}

impl FastBtcSwapProvider {
    pub fn new(ctx: SwapContext, bridge: FastBtcBridge) -> Self {
        Self { ctx, bridge }
    }

    fn is_supported(from: &str, to: &str) -> bool {
        from == FROM_ASSET && to == TO_ASSET
    }

    async fn wait_for_send_confirmations(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let hash = swap_tx_hash(swap)?;
        let client = self
            .ctx
            .client(swap.network, &swap.wallet_id, &swap.from, &swap.from_account_id)
            .await?;

        Ok(client
            .confirmed_transaction(hash)
            .await?
            .map(|_| HistoryUpdate::status(Status::WaitingForReceive)))
    }

    async fn wait_for_receive(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let hash = swap_tx_hash(swap)?;
        let receiver = self
            .ctx
            .swap_address(swap.network, &swap.wallet_id, &swap.to, &swap.to_account_id)
            .await?;

        let history = match self.bridge.deposit_history(&receiver).await {
            Ok(history) => history,
            Err(e) if e.is_retryable() => {
                warn!(swap_id = %swap.id, "FastBtc history unavailable: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if payout_received(&history, hash) {
            info!(swap_id = %swap.id, "FastBtc payout received");
            Ok(Some(HistoryUpdate::status(Status::Success)))
        } else {
            Ok(None)
        }
    }
}

fn swap_tx_hash(swap: &SwapRecord) -> OrchestratorResult<&str> {
    swap.swap_tx_hash
        .as_deref()
        .ok_or_else(|| OrchestratorError::Internal(format!("swap {} has no deposit transaction", swap.id)))
}

#[async_trait]
impl SwapProvider for FastBtcSwapProvider {
    fn id(&self) -> ProviderId {
        ProviderId::FastBtc
    }

    async fn supported_pairs(&self) -> OrchestratorResult<Vec<SupportedPair>> {
        let btc = assets::asset(FROM_ASSET)?;
        let range = self.bridge.tx_amount().await?;
        Ok(vec![SupportedPair {
            from: FROM_ASSET.to_string(),
            to: TO_ASSET.to_string(),
            rate: Decimal::new(RATE_PER_MILLE as i64, 3),
            min: currency_to_unit(btc, range.min)?,
            max: currency_to_unit(btc, range.max)?,
        }])
    }

    async fn get_quote(&self, request: &QuoteRequest) -> OrchestratorResult<Option<Quote>> {
        if !Self::is_supported(&request.from, &request.to) {
            return Ok(None);
        }

        let range = self.bridge.tx_amount().await?;
        if !range.contains(request.amount) {
            debug!(amount = %request.amount, min = %range.min, max = %range.max, "FastBtc amount out of range");
            return Ok(None);
        }

        let btc = assets::asset(FROM_ASSET)?;
        let rbtc = assets::asset(TO_ASSET)?;
        let net = request.amount - unit_to_currency(btc, U256::from(SATOSHI_FEE))?;
        if net <= Decimal::ZERO {
            return Ok(None);
        }

        let to_amount = currency_to_unit(rbtc, net)? * U256::from(RATE_PER_MILLE) / U256::from(1000u64);
        Ok(Some(Quote {
            provider: ProviderId::FastBtc,
            from: request.from.clone(),
            to: request.to.clone(),
            from_amount: currency_to_unit(btc, request.amount)?,
            to_amount,
            fee: None,
            from_account_id: request.from_account_id.clone(),
            to_account_id: request.to_account_id.clone(),
        }))
    }

    async fn new_swap(&self, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<SwapRecord> {
        if !Self::is_supported(&quote.from, &quote.to) {
            return Err(OrchestratorError::Unsupported(format!(
                "FastBtc pair {} -> {}",
                quote.from, quote.to
            )));
        }

        let receiver = self
            .ctx
            .swap_address(network, wallet_id, &quote.to, &quote.to_account_id)
            .await?;
        let deposit_address = self.bridge.deposit_address(&receiver).await?;
        let client = self.ctx.client(network, wallet_id, &quote.from, &quote.from_account_id).await?;

        let sent = self
            .ctx
            .scheduler
            .with_lock(&self.ctx.locks, network, wallet_id, &quote.from, || {
                client.wallet.send_transaction(SendOptions {
                    to: deposit_address.clone(),
                    value: quote.from_amount,
                    fee: quote.fee,
                    ..Default::default()
                })
            })
            .await?;

        info!(
            wallet_id = wallet_id,
            deposit = %deposit_address,
            tx_hash = %sent.hash,
            "FastBtc deposit sent"
        );

        let update = HistoryUpdate::status(Status::WaitingForSendConfirmations).with_swap_tx_hash(sent.hash);
        new_swap_record(
            ProviderId::FastBtc,
            network,
            wallet_id,
            quote,
            update,
            Some(SLIPPAGE_BPS),
        )
    }

    async fn estimate_fees(&self, request: FeeEstimateRequest<'_>) -> OrchestratorResult<Option<FeeTable>> {
        if request.asset != FROM_ASSET {
            return Ok(None);
        }

        let btc = assets::asset(FROM_ASSET)?;
        let client = self
            .ctx
            .client(request.network, request.wallet_id, request.asset, &request.quote.from_account_id)
            .await?;

        let value = if request.max { U256::zero() } else { request.quote.from_amount };
        let candidates: BTreeMap<_, _> = request
            .fee_prices
            .iter()
            .map(|(level, price)| {
                (
                    *level,
                    SendOptions {
                        value,
                        fee: Some(*price),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let totals = client.wallet.get_total_fees(&candidates, request.max).await?;
        let fees = totals
            .into_iter()
            .map(|(level, units)| Ok((level, unit_to_currency(btc, units)?)))
            .collect::<OrchestratorResult<FeeTable>>()?;
        Ok(Some(fees))
    }

    async fn perform_next_swap_action(&self, swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        let scheduler = &self.ctx.scheduler;
        match swap.status {
            Status::WaitingForSendConfirmations => scheduler
                .with_interval(|| self.wait_for_send_confirmations(swap))
                .await
                .map(Some),
            Status::WaitingForReceive => scheduler.with_interval(|| self.wait_for_receive(swap)).await.map(Some),
            _ => Ok(None),
        }
    }

    fn statuses(&self) -> &'static StatusTable {
        &FASTBTC_STATUSES
    }
}
