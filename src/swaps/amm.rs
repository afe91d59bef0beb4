//! Uniswap V2 pricing, pair discovery and router call encoding

use crate::assets::{AssetInfo, ChainId, Network};
use crate::chain::evm::{parse_address, ERC20};
use crate::config::{Settings, UniswapConfig};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use ethers::abi::parse_abi;
use ethers::contract::BaseContract;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::debug;

const PAIR_ABI: &[&str] = &[
    "function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)",
    "function token0() external view returns (address)",
];

const ROUTER_ABI: &[&str] = &[
    "function swapExactTokensForTokens(uint256 amountIn, uint256 amountOutMin, address[] path, address to, uint256 deadline) external returns (uint256[] amounts)",
    "function swapExactTokensForETH(uint256 amountIn, uint256 amountOutMin, address[] path, address to, uint256 deadline) external returns (uint256[] amounts)",
    "function swapExactETHForTokens(uint256 amountOutMin, address[] path, address to, uint256 deadline) external payable returns (uint256[] amounts)",
];

// Checked by test_contract_abis_parse
lazy_static! {
    static ref PAIR: BaseContract = BaseContract::from(parse_abi(PAIR_ABI).expect("valid pair abi"));
    pub(crate) static ref ROUTER: BaseContract = BaseContract::from(parse_abi(ROUTER_ABI).expect("valid router abi"));
}

const WETH_MAINNET: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
const WETH_ROPSTEN: &str = "0xc778417E063141139Fce010982780140Aa0cD5Ab";

/// Seconds added to the latest block timestamp
pub const SWAP_DEADLINE_SECS: u64 = 1800;

/// Router, factory and pair init code for one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniswapDeployment {
    pub router: Address,
    pub factory: Address,
    pub init_code_hash: H256,
}

impl UniswapDeployment {
    pub fn from_config(config: &UniswapConfig) -> OrchestratorResult<Self> {
        let parse = |field: &str, raw: &str| -> OrchestratorResult<Address> {
            raw.parse()
                .map_err(|e| OrchestratorError::Config(format!("invalid uniswap {} {}: {}", field, raw, e)))
        };
        Ok(Self {
            router: parse("router_address", &config.router_address)?,
            factory: parse("factory_address", &config.factory_address)?,
            init_code_hash: config
                .init_code_hash
                .parse()
                .map_err(|e| OrchestratorError::Config(format!("invalid uniswap init_code_hash: {}", e)))?,
        })
    }
}

/// Pair reserves ordered by token0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairReserves {
    pub token0: Address,
    pub reserve0: U256,
    pub reserve1: U256,
}

impl PairReserves {
    /// (reserve_in, reserve_out) for a swap that sells `token_in`
    pub fn oriented(&self, token_in: Address, token_out: Address) -> OrchestratorResult<(U256, U256)> {
        if self.token0 == token_in {
            Ok((self.reserve0, self.reserve1))
        } else if self.token0 == token_out {
            Ok((self.reserve1, self.reserve0))
        } else {
            Err(OrchestratorError::Contract(format!(
                "pair token0 {:?} matches neither side",
                self.token0
            )))
        }
    }
}

/// On-chain reads the AMM provider needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmmChain: Send + Sync {
    async fn pair_reserves(&self, network: Network, pair: Address) -> OrchestratorResult<PairReserves>;

    async fn allowance(&self, network: Network, token: Address, owner: Address, spender: Address)
        -> OrchestratorResult<U256>;
}

/// `AmmChain` over the configured Ethereum RPC endpoints
pub struct EthersAmmChain {
    providers: HashMap<Network, Provider<Http>>,
}

impl EthersAmmChain {
    pub fn new(settings: &Settings) -> OrchestratorResult<Self> {
        let mut providers = HashMap::new();
        for network in [Network::Mainnet, Network::Testnet] {
            if let Some(chain) = settings.chain_network(ChainId::Ethereum, network) {
                let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())
                    .map_err(|e| OrchestratorError::Config(format!("invalid RPC URL {}: {}", chain.rpc_url, e)))?;
                providers.insert(network, provider);
            }
        }
        Ok(Self { providers })
    }

    fn provider(&self, network: Network) -> OrchestratorResult<&Provider<Http>> {
        self.providers
            .get(&network)
            .ok_or_else(|| OrchestratorError::Config(format!("no ethereum {} endpoint", network.as_str())))
    }

    async fn call(&self, network: Network, to: Address, data: Bytes) -> OrchestratorResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider(network)?
            .call(&tx, None)
            .await
            .map_err(|e| OrchestratorError::ChainConnection {
                chain: ChainId::Ethereum.to_string(),
                message: e.to_string(),
            })
    }
}

fn contract_error(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Contract(e.to_string())
}

#[async_trait]
impl AmmChain for EthersAmmChain {
    async fn pair_reserves(&self, network: Network, pair: Address) -> OrchestratorResult<PairReserves> {
        let data = PAIR.encode("getReserves", ()).map_err(contract_error)?;
        let out = self.call(network, pair, data).await?;
        let (reserve0, reserve1, _): (U256, U256, u32) = PAIR.decode_output("getReserves", out).map_err(contract_error)?;

        let data = PAIR.encode("token0", ()).map_err(contract_error)?;
        let out = self.call(network, pair, data).await?;
        let token0: Address = PAIR.decode_output("token0", out).map_err(contract_error)?;

        debug!(pair = ?pair, %reserve0, %reserve1, "Fetched pair reserves");
        Ok(PairReserves {
            token0,
            reserve0,
            reserve1,
        })
    }

    async fn allowance(
        &self,
        network: Network,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> OrchestratorResult<U256> {
        let data = ERC20.encode("allowance", (owner, spender)).map_err(contract_error)?;
        let out = self.call(network, token, data).await?;
        ERC20.decode_output("allowance", out).map_err(contract_error)
    }
}

pub fn weth(network: Network) -> Address {
    let raw = match network {
        Network::Mainnet => WETH_MAINNET,
        Network::Testnet => WETH_ROPSTEN,
    };
    raw.parse().unwrap_or_default()
}

/// Router-side token of an asset; native ETH trades as WETH
pub fn router_token(network: Network, asset: &AssetInfo) -> OrchestratorResult<Address> {
    match asset.contract_address {
        Some(contract) => parse_address(contract),
        None if asset.chain == ChainId::Ethereum => Ok(weth(network)),
        None => Err(OrchestratorError::Unsupported(format!("{} on uniswap", asset.code))),
    }
}

pub fn sort_tokens(a: Address, b: Address) -> (Address, Address) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// CREATE2 address of the pair contract for two tokens
pub fn pair_address(deployment: &UniswapDeployment, a: Address, b: Address) -> Address {
    let (token0, token1) = sort_tokens(a, b);
    let mut packed = Vec::with_capacity(40);
    packed.extend_from_slice(token0.as_bytes());
    packed.extend_from_slice(token1.as_bytes());
    get_create2_address_from_hash(deployment.factory, keccak256(packed), deployment.init_code_hash)
}

/// Constant-product output with the 0.3% LP fee
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> OrchestratorResult<U256> {
    if amount_in.is_zero() {
        return Err(OrchestratorError::Amount("zero input amount".to_string()));
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(OrchestratorError::Contract("pair has no liquidity".to_string()));
    }
    let with_fee = amount_in * U256::from(997u64);
    Ok(with_fee * reserve_out / (reserve_in * U256::from(1000u64) + with_fee))
}

/// Lowest acceptable output for a slippage tolerance in basis points
pub fn minimum_output(amount_out: U256, slippage_bps: u32) -> U256 {
    amount_out * U256::from(10_000u64) / U256::from(10_000u64 + slippage_bps as u64)
}

/// Parameters of a router swap call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSwap {
    pub amount_in: U256,
    pub amount_out_min: U256,
    pub path: Vec<Address>,
    pub recipient: Address,
    pub deadline: U256,
    pub native_in: bool,
    pub native_out: bool,
}

impl RouterSwap {
    pub fn method(&self) -> &'static str {
        match (self.native_in, self.native_out) {
            (true, _) => "swapExactETHForTokens",
            (false, true) => "swapExactTokensForETH",
            (false, false) => "swapExactTokensForTokens",
        }
    }

    /// Call data plus the native value to attach
    pub fn encode(&self) -> OrchestratorResult<(Bytes, U256)> {
        let method = self.method();
        if self.native_in {
            let data = ROUTER
                .encode(
                    method,
                    (self.amount_out_min, self.path.clone(), self.recipient, self.deadline),
                )
                .map_err(contract_error)?;
            Ok((data, self.amount_in))
        } else {
            let data = ROUTER
                .encode(
                    method,
                    (
                        self.amount_in,
                        self.amount_out_min,
                        self.path.clone(),
                        self.recipient,
                        self.deadline,
                    ),
                )
                .map_err(contract_error)?;
            Ok((data, U256::zero()))
        }
    }
}

pub fn approve_call(spender: Address, amount: U256) -> OrchestratorResult<Bytes> {
    ERC20.encode("approve", (spender, amount)).map_err(contract_error)
}

pub fn hex_data(data: &Bytes) -> String {
    format!("0x{}", hex::encode(data.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::asset;
    use crate::config::tests::default_settings;

    fn deployment() -> UniswapDeployment {
        UniswapDeployment::from_config(default_settings().swaps.uniswap.as_ref().unwrap()).unwrap()
    }

    fn addr(raw: &str) -> Address {
        raw.parse().unwrap()
    }

    #[test]
    fn test_contract_abis_parse() {
        let pair = parse_abi(PAIR_ABI).unwrap();
        assert!(pair.function("getReserves").is_ok());
        assert!(pair.function("token0").is_ok());

        let router = parse_abi(ROUTER_ABI).unwrap();
        for method in ["swapExactTokensForTokens", "swapExactTokensForETH", "swapExactETHForTokens"] {
            assert!(router.function(method).is_ok(), "{} missing", method);
        }
    }

    #[test]
    fn test_pair_address_matches_mainnet_pairs() {
        let usdc = addr("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        let dai = addr("0x6B175474E89094C44Da98b954EedeAC495271d0F");
        let weth = weth(Network::Mainnet);

        assert_eq!(
            pair_address(&deployment(), usdc, weth),
            addr("0xB4e16d0168e52d35CaCD2c6185b44281Ec28C9Dc")
        );
        assert_eq!(
            pair_address(&deployment(), weth, dai),
            addr("0xA478c2975Ab1Ea89e8196811F51A7B7Ade33eB11")
        );
    }

    #[test]
    fn test_amount_out_constant_product() {
        let out = amount_out(U256::from(1000u64), U256::from(1_000_000u64), U256::from(2_000_000u64)).unwrap();
        // 997000 * 2e6 / (1e9 + 997000)
        assert_eq!(out, U256::from(1992u64));
        assert!(amount_out(U256::from(1u64), U256::zero(), U256::from(5u64)).is_err());
    }

    #[test]
    fn test_minimum_output_monotonic_in_slippage() {
        let quoted = U256::from(1_000_000_000u64);
        assert_eq!(minimum_output(quoted, 0), quoted);
        assert_eq!(minimum_output(quoted, 50), U256::from(995_024_875u64));

        let mut previous = quoted;
        for bps in [10u32, 50, 100, 300, 1000] {
            let min = minimum_output(quoted, bps);
            assert!(min < previous);
            previous = min;
        }
    }

    #[test]
    fn test_reserves_oriented_by_token0() {
        let a = addr("0x0000000000000000000000000000000000000001");
        let b = addr("0x0000000000000000000000000000000000000002");
        let reserves = PairReserves {
            token0: a,
            reserve0: U256::from(10u64),
            reserve1: U256::from(20u64),
        };
        assert_eq!(reserves.oriented(a, b).unwrap(), (U256::from(10u64), U256::from(20u64)));
        assert_eq!(reserves.oriented(b, a).unwrap(), (U256::from(20u64), U256::from(10u64)));
        assert!(reserves.oriented(addr("0x0000000000000000000000000000000000000003"), b).is_err());
    }

    #[test]
    fn test_router_method_and_value() {
        let eth = asset("ETH").unwrap();
        let dai = asset("DAI").unwrap();
        let mut swap = RouterSwap {
            amount_in: U256::from(5u64),
            amount_out_min: U256::from(4u64),
            path: vec![router_token(Network::Mainnet, eth).unwrap(), router_token(Network::Mainnet, dai).unwrap()],
            recipient: addr("0x00000000000000000000000000000000000000aa"),
            deadline: U256::from(1_800u64),
            native_in: true,
            native_out: false,
        };
        let (data, value) = swap.encode().unwrap();
        assert_eq!(&data[..4], &[0x7f, 0xf3, 0x6a, 0xb5]);
        assert_eq!(value, U256::from(5u64));

        swap.native_in = false;
        swap.native_out = true;
        let (data, value) = swap.encode().unwrap();
        assert_eq!(&data[..4], &[0x18, 0xcb, 0xaf, 0xe5]);
        assert!(value.is_zero());

        swap.native_out = false;
        assert_eq!(&swap.encode().unwrap().0[..4], &[0x38, 0xed, 0x17, 0x39]);
        assert!(router_token(Network::Mainnet, asset("RBTC").unwrap()).is_err());
    }
}
