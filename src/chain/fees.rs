//! Fee price providers for the different chain families

use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Fee urgency tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeeLevel {
    Slow,
    Average,
    Fast,
}

impl FeeLevel {
    pub const ALL: [FeeLevel; 3] = [FeeLevel::Slow, FeeLevel::Average, FeeLevel::Fast];
}

/// Fee price per tier, in gwei for EVM chains and sat/vB for bitcoin
pub type FeeDetails = BTreeMap<FeeLevel, Decimal>;

/// Multipliers applied to the node's gas price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeMultipliers {
    pub slow: Decimal,
    pub average: Decimal,
    pub fast: Decimal,
}

impl FeeMultipliers {
    pub fn new(slow: Decimal, average: Decimal, fast: Decimal) -> Self {
        Self { slow, average, fast }
    }

    fn for_level(&self, level: FeeLevel) -> Decimal {
        match level {
            FeeLevel::Slow => self.slow,
            FeeLevel::Average => self.average,
            FeeLevel::Fast => self.fast,
        }
    }

    pub fn apply(&self, price: Decimal) -> FeeDetails {
        FeeLevel::ALL
            .iter()
            .map(|level| (*level, price * self.for_level(*level)))
            .collect()
    }
}

/// How a client prices its transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeStrategy {
    Eip1559,
    Rpc(FeeMultipliers),
    BitcoinFeeApi { url: String },
    /// Chain default, no dedicated fee provider
    Fixed,
}

#[async_trait]
pub trait FeeProvider: Send + Sync {
    async fn get_fees(&self) -> OrchestratorResult<FeeDetails>;
}

const GWEI: u64 = 1_000_000_000;

pub fn wei_to_gwei(wei: U256) -> OrchestratorResult<Decimal> {
    if wei > U256::from(i128::MAX as u128) {
        return Err(OrchestratorError::GasEstimation(format!("gas price {} out of range", wei)));
    }
    Decimal::try_from_i128_with_scale(wei.as_u128() as i128, 9)
        .map(|d| d.normalize())
        .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))
}

pub fn gwei_to_wei(gwei: Decimal) -> OrchestratorResult<U256> {
    (gwei * Decimal::from(GWEI))
        .trunc()
        .to_u128()
        .map(U256::from)
        .ok_or_else(|| OrchestratorError::GasEstimation(format!("invalid gas price {} gwei", gwei)))
}

/// Total fee in wei for `gas_limit` units at `gwei` per unit
pub fn fee_cost(gas_limit: U256, gwei: Decimal) -> OrchestratorResult<U256> {
    Ok(gas_limit * gwei_to_wei(gwei)?)
}

/// Gas price from the node scaled by per-tier multipliers
pub struct RpcFeeProvider {
    provider: Provider<Http>,
    multipliers: FeeMultipliers,
}

impl RpcFeeProvider {
    pub fn new(provider: Provider<Http>, multipliers: FeeMultipliers) -> Self {
        Self { provider, multipliers }
    }
}

#[async_trait]
impl FeeProvider for RpcFeeProvider {
    async fn get_fees(&self) -> OrchestratorResult<FeeDetails> {
        let price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))?;
        let fees = self.multipliers.apply(wei_to_gwei(price)?);
        debug!("RPC fee tiers: {:?}", fees);
        Ok(fees)
    }
}

/// Base fee of the latest block plus a tiered priority fee
pub struct Eip1559FeeProvider {
    provider: Provider<Http>,
}

impl Eip1559FeeProvider {
    pub fn new(provider: Provider<Http>) -> Self {
        Self { provider }
    }

    fn priority_fee(level: FeeLevel) -> Decimal {
        match level {
            FeeLevel::Slow => Decimal::new(1, 0),
            FeeLevel::Average => Decimal::new(15, 1),
            FeeLevel::Fast => Decimal::new(2, 0),
        }
    }

    /// Max fee = 2 * base_fee + priority_fee (buffer for block variability)
    pub fn tiers(base_fee_gwei: Decimal) -> FeeDetails {
        FeeLevel::ALL
            .iter()
            .map(|level| (*level, base_fee_gwei * Decimal::TWO + Self::priority_fee(*level)))
            .collect()
    }
}

#[async_trait]
impl FeeProvider for Eip1559FeeProvider {
    async fn get_fees(&self) -> OrchestratorResult<FeeDetails> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))?
            .ok_or_else(|| OrchestratorError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| OrchestratorError::GasEstimation("No base fee in block".to_string()))?;

        Ok(Self::tiers(wei_to_gwei(base_fee)?))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: u64,
    half_hour_fee: u64,
    hour_fee: u64,
}

impl From<RecommendedFees> for FeeDetails {
    fn from(fees: RecommendedFees) -> Self {
        BTreeMap::from([
            (FeeLevel::Slow, Decimal::from(fees.hour_fee)),
            (FeeLevel::Average, Decimal::from(fees.half_hour_fee)),
            (FeeLevel::Fast, Decimal::from(fees.fastest_fee)),
        ])
    }
}

/// Recommended sat/vB rates from a mempool fee endpoint
pub struct BitcoinFeeApiProvider {
    http: reqwest::Client,
    url: String,
}

impl BitcoinFeeApiProvider {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl FeeProvider for BitcoinFeeApiProvider {
    async fn get_fees(&self) -> OrchestratorResult<FeeDetails> {
        let fees: RecommendedFees = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))?
            .json()
            .await
            .map_err(|e| OrchestratorError::GasEstimation(e.to_string()))?;
        Ok(fees.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_multipliers_scale_gas_price() {
        let m = FeeMultipliers::new(Decimal::ONE, Decimal::TWO, Decimal::new(22, 1));
        let fees = m.apply(Decimal::new(5, 0));
        assert_eq!(fees[&FeeLevel::Slow], Decimal::new(5, 0));
        assert_eq!(fees[&FeeLevel::Average], Decimal::new(10, 0));
        assert_eq!(fees[&FeeLevel::Fast], Decimal::new(11, 0));
    }

    #[test]
    fn test_gwei_conversions() {
        assert_eq!(wei_to_gwei(U256::from(1_500_000_000u64)).unwrap(), Decimal::new(15, 1));
        assert_eq!(gwei_to_wei(Decimal::new(15, 1)).unwrap(), U256::from(1_500_000_000u64));
        assert_eq!(
            fee_cost(U256::from(21_000u64), Decimal::new(2, 0)).unwrap(),
            U256::from(42_000_000_000_000u64)
        );
    }

    #[test]
    fn test_eip1559_tiers_are_ordered() {
        let fees = Eip1559FeeProvider::tiers(Decimal::new(30, 0));
        assert_eq!(fees[&FeeLevel::Slow], Decimal::new(61, 0));
        assert!(fees[&FeeLevel::Slow] < fees[&FeeLevel::Average]);
        assert!(fees[&FeeLevel::Average] < fees[&FeeLevel::Fast]);
    }

    #[test]
    fn test_recommended_fees_parse() {
        let raw = r#"{"fastestFee":40,"halfHourFee":25,"hourFee":12,"economyFee":5,"minimumFee":1}"#;
        let fees: FeeDetails = serde_json::from_str::<RecommendedFees>(raw).unwrap().into();
        assert_eq!(fees[&FeeLevel::Fast], Decimal::from(40u64));
        assert_eq!(fees[&FeeLevel::Slow], Decimal::from(12u64));
    }
}
