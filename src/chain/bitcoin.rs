//! Bitcoin chain access over an Esplora REST endpoint

use super::{Block, ChainProvider, ChainTransaction, TxStatus};
use crate::assets::AssetInfo;
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::types::U256;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct AddressStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct AddressInfo {
    chain_stats: AddressStats,
}

#[derive(Debug, Deserialize)]
struct TxConfirmation {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TxOutput {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    status: TxConfirmation,
    vout: Vec<TxOutput>,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    id: String,
    height: u64,
    timestamp: u64,
}

pub struct EsploraChainProvider {
    http: reqwest::Client,
    base_url: String,
}

impl EsploraChainProvider {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn connection_error(e: impl std::fmt::Display) -> OrchestratorError {
        OrchestratorError::ChainConnection {
            chain: "bitcoin".to_string(),
            message: e.to_string(),
        }
    }

    async fn get(&self, path: &str) -> OrchestratorResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        self.http.get(&url).send().await.map_err(Self::connection_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> OrchestratorResult<T> {
        self.get(path)
            .await?
            .error_for_status()
            .map_err(Self::connection_error)?
            .json()
            .await
            .map_err(Self::connection_error)
    }

    async fn get_text(&self, path: &str) -> OrchestratorResult<String> {
        self.get(path)
            .await?
            .error_for_status()
            .map_err(Self::connection_error)?
            .text()
            .await
            .map_err(Self::connection_error)
    }
}

#[async_trait]
impl ChainProvider for EsploraChainProvider {
    async fn get_balance(
        &self,
        addresses: &[String],
        assets: &[&'static AssetInfo],
    ) -> OrchestratorResult<Vec<U256>> {
        let mut total = 0u64;
        for address in addresses {
            let info: AddressInfo = self.get_json(&format!("/address/{}", address)).await?;
            total += info
                .chain_stats
                .funded_txo_sum
                .saturating_sub(info.chain_stats.spent_txo_sum);
        }
        Ok(assets.iter().map(|_| U256::from(total)).collect())
    }

    async fn get_transaction_by_hash(&self, hash: &str) -> OrchestratorResult<ChainTransaction> {
        let response = self.get(&format!("/tx/{}", hash)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OrchestratorError::TransactionNotFound {
                tx_hash: hash.to_string(),
            });
        }
        let tx: EsploraTx = response
            .error_for_status()
            .map_err(Self::connection_error)?
            .json()
            .await
            .map_err(Self::connection_error)?;

        let value = tx.vout.iter().map(|o| o.value).sum::<u64>();
        let (confirmations, status) = match (tx.status.confirmed, tx.status.block_height) {
            (true, Some(height)) => {
                let tip = self.get_block_height().await?;
                (tip.saturating_sub(height) + 1, TxStatus::Success)
            }
            _ => (0, TxStatus::Pending),
        };

        Ok(ChainTransaction {
            hash: tx.txid,
            value: U256::from(value),
            block_number: tx.status.block_height,
            confirmations,
            status,
        })
    }

    async fn get_block_height(&self) -> OrchestratorResult<u64> {
        self.get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .map_err(Self::connection_error)
    }

    async fn get_block_by_number(&self, number: u64) -> OrchestratorResult<Block> {
        let hash = self.get_text(&format!("/block-height/{}", number)).await?;
        let block: EsploraBlock = self.get_json(&format!("/block/{}", hash.trim())).await?;
        Ok(Block {
            number: block.height,
            hash: block.id,
            timestamp: block.timestamp,
        })
    }
}
