//! Asset and chain catalogue
//!
//! Static description of the assets the wallet knows about, the chains they
//! live on and the account types that can hold them. Amount conversion
//! between human (currency) values and the chain's smallest unit lives here
//! too, since every component that talks to a chain needs it.

use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::types::U256;
use lazy_static::lazy_static;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Network a wallet operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain identifier, using the wallet's persisted chain names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Bitcoin,
    Ethereum,
    Rsk,
    Bsc,
    Polygon,
    Arbitrum,
    Avalanche,
    Fuse,
    Near,
    Terra,
}

impl ChainId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Bitcoin => "bitcoin",
            ChainId::Ethereum => "ethereum",
            ChainId::Rsk => "rsk",
            ChainId::Bsc => "bsc",
            ChainId::Polygon => "polygon",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Avalanche => "avalanche",
            ChainId::Fuse => "fuse",
            ChainId::Near => "near",
            ChainId::Terra => "terra",
        }
    }

    /// EVM-compatible chains share the JSON-RPC client stack
    pub fn is_evm(&self) -> bool {
        matches!(
            self,
            ChainId::Ethereum
                | ChainId::Rsk
                | ChainId::Bsc
                | ChainId::Polygon
                | ChainId::Arbitrum
                | ChainId::Avalanche
                | ChainId::Fuse
        )
    }

    /// Chains where every balance query may surface new addresses that
    /// must be kept alongside the old ones
    pub fn reuses_addresses(&self) -> bool {
        matches!(self, ChainId::Bitcoin)
    }

    /// Native asset code of the chain
    pub fn native_asset(&self) -> &'static str {
        match self {
            ChainId::Bitcoin => "BTC",
            ChainId::Ethereum => "ETH",
            ChainId::Rsk => "RBTC",
            ChainId::Bsc => "BNB",
            ChainId::Polygon => "MATIC",
            ChainId::Arbitrum => "ARBETH",
            ChainId::Avalanche => "AVAX",
            ChainId::Fuse => "FUSE",
            ChainId::Near => "NEAR",
            ChainId::Terra => "LUNA",
        }
    }

    /// Normalise an address the way the chain's tooling expects it
    pub fn format_address(&self, address: &str) -> String {
        if self.is_evm() {
            let trimmed = address.trim_start_matches("0x").to_lowercase();
            format!("0x{}", trimmed)
        } else {
            address.to_string()
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(ChainId::Bitcoin),
            "ethereum" => Ok(ChainId::Ethereum),
            "rsk" => Ok(ChainId::Rsk),
            "bsc" => Ok(ChainId::Bsc),
            "polygon" => Ok(ChainId::Polygon),
            "arbitrum" => Ok(ChainId::Arbitrum),
            "avalanche" => Ok(ChainId::Avalanche),
            "fuse" => Ok(ChainId::Fuse),
            "near" => Ok(ChainId::Near),
            "terra" => Ok(ChainId::Terra),
            other => Err(OrchestratorError::Config(format!("Unknown chain {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Native,
    Erc20,
}

/// Static asset description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub chain: ChainId,
    pub kind: AssetKind,
    pub decimals: u32,
    pub contract_address: Option<&'static str>,
}

impl AssetInfo {
    pub fn is_native(&self) -> bool {
        self.kind == AssetKind::Native
    }

    pub fn is_erc20(&self) -> bool {
        self.kind == AssetKind::Erc20
    }
}

const fn native(code: &'static str, name: &'static str, chain: ChainId, decimals: u32) -> AssetInfo {
    AssetInfo {
        code,
        name,
        chain,
        kind: AssetKind::Native,
        decimals,
        contract_address: None,
    }
}

const fn erc20(
    code: &'static str,
    name: &'static str,
    chain: ChainId,
    decimals: u32,
    contract_address: &'static str,
) -> AssetInfo {
    AssetInfo {
        code,
        name,
        chain,
        kind: AssetKind::Erc20,
        decimals,
        contract_address: Some(contract_address),
    }
}

const ASSETS: &[AssetInfo] = &[
    native("BTC", "Bitcoin", ChainId::Bitcoin, 8),
    native("ETH", "Ether", ChainId::Ethereum, 18),
    native("RBTC", "Rootstock BTC", ChainId::Rsk, 18),
    native("BNB", "Binance Coin", ChainId::Bsc, 18),
    native("MATIC", "Matic", ChainId::Polygon, 18),
    native("ARBETH", "Arbitrum ETH", ChainId::Arbitrum, 18),
    native("AVAX", "Avalanche", ChainId::Avalanche, 18),
    native("FUSE", "Fuse Network", ChainId::Fuse, 18),
    native("NEAR", "Near", ChainId::Near, 24),
    native("LUNA", "Luna", ChainId::Terra, 6),
    native("UST", "TerraUSD", ChainId::Terra, 6),
    erc20("DAI", "Dai Stablecoin", ChainId::Ethereum, 18, "0x6B175474E89094C44Da98b954EedeAC495271d0F"),
    erc20("USDC", "USD Coin", ChainId::Ethereum, 6, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
    erc20("WBTC", "Wrapped Bitcoin", ChainId::Ethereum, 8, "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599"),
    erc20("SOV", "Sovryn", ChainId::Rsk, 18, "0xEFc78fc7d48b64958315949279Ba181c2114ABBd"),
    erc20("RIF", "RIF Token", ChainId::Rsk, 18, "0x2AcC95758f8b5F583470ba265EB685a8F45fC9D5"),
    erc20("PUSDT", "Tether USD (PoS)", ChainId::Polygon, 6, "0xc2132D05D31c914a87C6611C10748AEb04B58e8F"),
];

lazy_static! {
    static ref ASSET_INDEX: HashMap<&'static str, &'static AssetInfo> =
        ASSETS.iter().map(|a| (a.code, a)).collect();
}

/// Look up an asset by code
pub fn asset(code: &str) -> OrchestratorResult<&'static AssetInfo> {
    ASSET_INDEX
        .get(code)
        .copied()
        .ok_or_else(|| OrchestratorError::UnknownAsset(code.to_string()))
}

/// Chain an asset lives on
pub fn chain_of(code: &str) -> OrchestratorResult<ChainId> {
    asset(code).map(|a| a.chain)
}

fn unit_factor(decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(decimals), 0)
}

/// Convert a human amount (e.g. 0.01 BTC) into the smallest unit (sats)
pub fn currency_to_unit(asset: &AssetInfo, amount: Decimal) -> OrchestratorResult<U256> {
    if amount.is_sign_negative() {
        return Err(OrchestratorError::Amount(format!(
            "negative amount {} {}",
            amount, asset.code
        )));
    }

    let units = amount
        .checked_mul(unit_factor(asset.decimals))
        .ok_or_else(|| OrchestratorError::Amount(format!("{} {} overflows", amount, asset.code)))?
        .trunc();

    units
        .to_u128()
        .map(U256::from)
        .ok_or_else(|| OrchestratorError::Amount(format!("{} {} overflows", amount, asset.code)))
}

/// Convert a smallest-unit amount back to a human amount
pub fn unit_to_currency(asset: &AssetInfo, units: U256) -> OrchestratorResult<Decimal> {
    if units > U256::from(i128::MAX as u128) {
        return Err(OrchestratorError::Amount(format!(
            "{} units of {} out of range",
            units, asset.code
        )));
    }

    Decimal::try_from_i128_with_scale(units.as_u128() as i128, asset.decimals)
        .map(|d| d.normalize())
        .map_err(|e| OrchestratorError::Amount(e.to_string()))
}

/// Human-readable balance used in notifications
pub fn pretty_balance(units: U256, code: &str) -> String {
    match asset(code).and_then(|a| unit_to_currency(a, units)) {
        Ok(value) => value.round_dp(6).normalize().to_string(),
        Err(_) => units.to_string(),
    }
}

/// Account type as persisted by the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "bitcoin_ledger_nagive_segwit")]
    BitcoinLedgerNativeSegwit,
    #[serde(rename = "bitcoin_ledger_legacy")]
    BitcoinLedgerLegacy,
    #[serde(rename = "ethereum_ledger")]
    EthereumLedger,
    #[serde(rename = "rsk_ledger")]
    RskLedger,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Default => "default",
            AccountType::BitcoinLedgerNativeSegwit => "bitcoin_ledger_nagive_segwit",
            AccountType::BitcoinLedgerLegacy => "bitcoin_ledger_legacy",
            AccountType::EthereumLedger => "ethereum_ledger",
            AccountType::RskLedger => "rsk_ledger",
        }
    }

    /// Hardware-backed accounts keep their addresses in state
    pub fn is_ledger(&self) -> bool {
        !matches!(self, AccountType::Default)
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(AccountType::Default),
            "bitcoin_ledger_nagive_segwit" => Ok(AccountType::BitcoinLedgerNativeSegwit),
            "bitcoin_ledger_legacy" => Ok(AccountType::BitcoinLedgerLegacy),
            "ethereum_ledger" => Ok(AccountType::EthereumLedger),
            "rsk_ledger" => Ok(AccountType::RskLedger),
            other => Err(OrchestratorError::Config(format!(
                "Account type {} not an option",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitcoinAddressType {
    Legacy,
    Bech32,
}

/// Hardware profile for bitcoin ledger accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerBitcoinOption {
    pub account_type: AccountType,
    pub address_type: BitcoinAddressType,
}

pub const LEDGER_BITCOIN_OPTIONS: &[LedgerBitcoinOption] = &[
    LedgerBitcoinOption {
        account_type: AccountType::BitcoinLedgerNativeSegwit,
        address_type: BitcoinAddressType::Bech32,
    },
    LedgerBitcoinOption {
        account_type: AccountType::BitcoinLedgerLegacy,
        address_type: BitcoinAddressType::Legacy,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_lookup() {
        let sov = asset("SOV").unwrap();
        assert_eq!(sov.chain, ChainId::Rsk);
        assert!(sov.is_erc20());
        assert!(matches!(asset("DOGE"), Err(OrchestratorError::UnknownAsset(_))));
    }

    #[test]
    fn test_currency_unit_conversion() {
        let btc = asset("BTC").unwrap();
        let sats = currency_to_unit(btc, Decimal::new(1, 2)).unwrap();
        assert_eq!(sats, U256::from(1_000_000u64));
        assert_eq!(unit_to_currency(btc, U256::from(5000u64)).unwrap(), Decimal::new(5, 5));

        let rbtc = asset("RBTC").unwrap();
        let wei = currency_to_unit(rbtc, Decimal::new(1, 0)).unwrap();
        assert_eq!(wei, U256::exp10(18));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let eth = asset("ETH").unwrap();
        assert!(currency_to_unit(eth, Decimal::new(-1, 0)).is_err());
    }

    #[test]
    fn test_evm_address_formatting() {
        assert_eq!(
            ChainId::Rsk.format_address("ABCDEF"),
            "0xabcdef".to_string()
        );
        assert_eq!(ChainId::Bitcoin.format_address("bc1Q"), "bc1Q".to_string());
    }

    #[test]
    fn test_account_type_names_round_trip_through_serde() {
        let json = serde_json::to_string(&AccountType::BitcoinLedgerNativeSegwit).unwrap();
        assert_eq!(json, "\"bitcoin_ledger_nagive_segwit\"");
        assert!("trezor".parse::<AccountType>().is_err());
    }
}
