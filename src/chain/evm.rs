//! EVM chain provider and mnemonic-backed wallet

use super::fees::fee_cost;
use super::{Block, ChainProvider, ChainTransaction, FeeLevel, SendOptions, SentTransaction, TxStatus, WalletProvider};
use crate::assets::{AssetInfo, ChainId};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::abi::parse_abi;
use ethers::contract::BaseContract;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::coins_bip39::English;
use ethers::types::transaction::eip2718::TypedTransaction;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const ERC20_ABI: &[&str] = &[
    "function balanceOf(address owner) external view returns (uint256)",
    "function allowance(address owner, address spender) external view returns (uint256)",
    "function approve(address spender, uint256 amount) external returns (bool)",
];

lazy_static! {
    pub(crate) static ref ERC20: BaseContract = BaseContract::from(parse_abi(ERC20_ABI).expect("valid erc20 abi"));
}

const TRANSFER_GAS: u64 = 21_000;

pub fn parse_address(raw: &str) -> OrchestratorResult<Address> {
    raw.parse::<Address>()
        .map_err(|e| OrchestratorError::Wallet(format!("invalid address {}: {}", raw, e)))
}

pub fn parse_tx_hash(raw: &str) -> OrchestratorResult<H256> {
    raw.parse::<H256>()
        .map_err(|e| OrchestratorError::Internal(format!("invalid tx hash {}: {}", raw, e)))
}

pub fn parse_call_data(data: Option<&str>) -> OrchestratorResult<Option<Bytes>> {
    data.map(|hex_data| {
        hex::decode(hex_data.trim_start_matches("0x"))
            .map(Bytes::from)
            .map_err(|e| OrchestratorError::Wallet(format!("invalid call data: {}", e)))
    })
    .transpose()
}

/// Lowercase 0x-prefixed rendering
pub fn format_evm_address(address: Address) -> String {
    format!("{:?}", address)
}

/// Read-only JSON-RPC access to an EVM chain
pub struct EvmChainProvider {
    chain: ChainId,
    provider: Provider<Http>,
}

impl EvmChainProvider {
    pub fn new(chain: ChainId, rpc_url: &str) -> OrchestratorResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| OrchestratorError::Config(format!("invalid RPC URL {}: {}", rpc_url, e)))?
            .interval(Duration::from_millis(100));
        debug!("Created HTTP provider for chain {}: {}", chain, rpc_url);
        Ok(Self { chain, provider })
    }

    pub fn provider(&self) -> &Provider<Http> {
        &self.provider
    }

    fn rpc_error(&self, e: impl std::fmt::Display) -> OrchestratorError {
        OrchestratorError::ChainConnection {
            chain: self.chain.to_string(),
            message: e.to_string(),
        }
    }

    async fn token_balance(&self, token: Address, owner: Address) -> OrchestratorResult<U256> {
        let data = ERC20
            .encode("balanceOf", owner)
            .map_err(|e| OrchestratorError::Contract(e.to_string()))?;
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let out = self.provider.call(&tx, None).await.map_err(|e| self.rpc_error(e))?;
        ERC20
            .decode_output("balanceOf", out)
            .map_err(|e| OrchestratorError::Contract(e.to_string()))
    }
}

#[async_trait]
impl ChainProvider for EvmChainProvider {
    async fn get_balance(
        &self,
        addresses: &[String],
        assets: &[&'static AssetInfo],
    ) -> OrchestratorResult<Vec<U256>> {
        let owners = addresses
            .iter()
            .map(|a| parse_address(a))
            .collect::<OrchestratorResult<Vec<_>>>()?;

        let mut balances = Vec::with_capacity(assets.len());
        for asset in assets {
            let mut total = U256::zero();
            for owner in &owners {
                total += match asset.contract_address {
                    Some(token) => self.token_balance(parse_address(token)?, *owner).await?,
                    None => self
                        .provider
                        .get_balance(*owner, None)
                        .await
                        .map_err(|e| self.rpc_error(e))?,
                };
            }
            balances.push(total);
        }
        Ok(balances)
    }

    async fn get_transaction_by_hash(&self, hash: &str) -> OrchestratorResult<ChainTransaction> {
        let tx_hash = parse_tx_hash(hash)?;
        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.rpc_error(e))?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                tx_hash: hash.to_string(),
            })?;

        let Some(block_number) = tx.block_number.map(|b| b.as_u64()) else {
            return Ok(ChainTransaction {
                hash: hash.to_string(),
                value: tx.value,
                block_number: None,
                confirmations: 0,
                status: TxStatus::Pending,
            });
        };

        let head = self.get_block_height().await?;
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.rpc_error(e))?;
        let status = match receipt.and_then(|r| r.status).map(|s| s.as_u64()) {
            Some(1) => TxStatus::Success,
            Some(_) => TxStatus::Failed,
            None => TxStatus::Pending,
        };

        Ok(ChainTransaction {
            hash: hash.to_string(),
            value: tx.value,
            block_number: Some(block_number),
            confirmations: head.saturating_sub(block_number) + 1,
            status,
        })
    }

    async fn get_block_height(&self) -> OrchestratorResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| self.rpc_error(e))
    }

    async fn get_block_by_number(&self, number: u64) -> OrchestratorResult<Block> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(|e| self.rpc_error(e))?
            .ok_or_else(|| self.rpc_error(format!("block {} not found", number)))?;
        Ok(Block {
            number,
            hash: block.hash.map(|h| format!("{:?}", h)).unwrap_or_default(),
            timestamp: block.timestamp.as_u64(),
        })
    }

    async fn estimate_gas(&self, from: &str, tx: &SendOptions) -> OrchestratorResult<U256> {
        let mut request = TransactionRequest::new()
            .from(parse_address(from)?)
            .to(parse_address(&tx.to)?)
            .value(tx.value);
        if let Some(data) = parse_call_data(tx.data.as_deref())? {
            request = request.data(data);
        }
        self.provider
            .estimate_gas(&request.into(), None)
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))
    }
}

/// Software wallet deriving its key from the wallet mnemonic
pub struct EvmWalletProvider {
    chain: ChainId,
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    /// Tip ceiling of EIP-1559 transactions; legacy gas price when absent
    priority_fee_cap: Option<U256>,
}

impl EvmWalletProvider {
    pub fn new(
        chain: ChainId,
        provider: Provider<Http>,
        chain_id: u64,
        mnemonic: &str,
        derivation_path: &str,
        priority_fee_cap: Option<U256>,
    ) -> OrchestratorResult<Self> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(mnemonic)
            .derivation_path(derivation_path)
            .and_then(|b| b.build())
            .map_err(|e| OrchestratorError::Wallet(format!("key derivation failed: {}", e)))?
            .with_chain_id(chain_id);

        info!("Wallet {} ready on chain {}", format_evm_address(wallet.address()), chain);

        Ok(Self {
            chain,
            client: SignerMiddleware::new(provider, wallet),
            priority_fee_cap,
        })
    }

    fn address(&self) -> Address {
        self.client.address()
    }

    async fn gas_limit_for(&self, tx: &SendOptions) -> OrchestratorResult<U256> {
        if let Some(limit) = tx.gas_limit {
            return Ok(U256::from(limit));
        }
        if tx.data.is_none() {
            return Ok(U256::from(TRANSFER_GAS));
        }
        let mut request = TransactionRequest::new()
            .from(self.address())
            .to(parse_address(&tx.to)?)
            .value(tx.value);
        if let Some(data) = parse_call_data(tx.data.as_deref())? {
            request = request.data(data);
        }
        self.client
            .estimate_gas(&request.into(), None)
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))
    }
}

/// Tip paid on top of the base fee, bounded by the chain's cap
pub fn priority_fee(max_fee: U256, cap: U256) -> U256 {
    max_fee.min(cap)
}

#[async_trait]
impl WalletProvider for EvmWalletProvider {
    async fn send_transaction(&self, options: SendOptions) -> OrchestratorResult<SentTransaction> {
        let to = parse_address(&options.to)?;
        let data = parse_call_data(options.data.as_deref())?;
        let price = options.fee.map(super::fees::gwei_to_wei).transpose()?;

        let tx: TypedTransaction = if let Some(cap) = self.priority_fee_cap {
            let mut request = Eip1559TransactionRequest::new().to(to).value(options.value);
            if let Some(data) = data {
                request = request.data(data);
            }
            if let Some(limit) = options.gas_limit {
                request = request.gas(limit);
            }
            if let Some(price) = price {
                request = request
                    .max_fee_per_gas(price)
                    .max_priority_fee_per_gas(priority_fee(price, cap));
            }
            request.into()
        } else {
            let mut request = TransactionRequest::new().to(to).value(options.value);
            if let Some(data) = data {
                request = request.data(data);
            }
            if let Some(limit) = options.gas_limit {
                request = request.gas(limit);
            }
            if let Some(price) = price {
                request = request.gas_price(price);
            }
            request.into()
        };

        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| OrchestratorError::Wallet(e.to_string()))?;
        let hash = format!("{:?}", pending.tx_hash());

        info!("Sent transaction {} on chain {}", hash, self.chain);

        Ok(SentTransaction {
            hash,
            to: options.to,
            value: options.value,
            fee: options.fee,
        })
    }

    async fn get_address(&self) -> OrchestratorResult<String> {
        Ok(format_evm_address(self.address()))
    }

    async fn get_used_addresses(&self) -> OrchestratorResult<Vec<String>> {
        Ok(vec![format_evm_address(self.address())])
    }

    async fn get_total_fees(
        &self,
        candidates: &BTreeMap<FeeLevel, SendOptions>,
        _max: bool,
    ) -> OrchestratorResult<BTreeMap<FeeLevel, U256>> {
        let mut totals = BTreeMap::new();
        for (level, tx) in candidates {
            let gas = self.gas_limit_for(tx).await?;
            totals.insert(*level, fee_cost(gas, tx.fee.unwrap_or_default())?);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erc20_abi_parses() {
        let abi = parse_abi(ERC20_ABI).unwrap();
        for method in ["balanceOf", "allowance", "approve"] {
            assert!(abi.function(method).is_ok(), "{} missing", method);
        }
    }

    #[test]
    fn test_erc20_encoding() {
        let owner: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
        let data = ERC20.encode("balanceOf", owner).unwrap();
        assert_eq!(hex::encode(&data[..4]), "70a08231");
        assert_eq!(data.len(), 36);
    }

    #[test]
    fn test_call_data_parsing() {
        assert!(parse_call_data(None).unwrap().is_none());
        let data = parse_call_data(Some("0x095ea7b3")).unwrap().unwrap();
        assert_eq!(data.len(), 4);
        assert!(parse_call_data(Some("0xzz")).is_err());
    }

    #[test]
    fn test_address_formatting_is_lowercase() {
        let addr = parse_address("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2").unwrap();
        assert_eq!(format_evm_address(addr), "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2");
    }

    #[test]
    fn test_priority_fee_is_capped() {
        let cap = U256::from(2_000_000_000u64);
        assert_eq!(priority_fee(U256::from(50_000_000_000u64), cap), cap);
        assert_eq!(priority_fee(U256::from(1_000_000_000u64), cap), U256::from(1_000_000_000u64));
    }

    #[test]
    fn test_wallet_derives_known_address() {
        let provider = Provider::<Http>::try_from("http://localhost:8545").unwrap();
        let wallet = EvmWalletProvider::new(
            ChainId::Ethereum,
            provider,
            1,
            "test test test test test test test test test test test junk",
            "m/44'/60'/0'/0/0",
            Some(U256::from(2_000_000_000u64)),
        )
        .unwrap();
        assert_eq!(
            format_evm_address(wallet.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }
}
