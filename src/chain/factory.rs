//! Per-chain client construction
//!
//! Picks the fee strategy, the signer and the swap capability for a chain and
//! wires them into a [`Client`]. EVM chains and the bitcoin chain reader are
//! built here; signers this crate cannot provide (hardware devices, bitcoin HD
//! wallets, non-EVM account chains) come from factories the host registers in
//! [`HostProviders`]. Construction never touches the network.

use super::bitcoin::EsploraChainProvider;
use super::evm::{parse_address, EvmChainProvider, EvmWalletProvider};
use super::fees::{
    gwei_to_wei, BitcoinFeeApiProvider, Eip1559FeeProvider, FeeMultipliers, FeeProvider, FeeStrategy, RpcFeeProvider,
};
use super::{ChainProvider, Client, ClientProfile, SignerKind, SwapCapability, WalletProvider};
use crate::assets::{self, AccountType, BitcoinAddressType, ChainId, Network, LEDGER_BITCOIN_OPTIONS};
use crate::config::{ChainConfig, ChainNetworkConfig};
use crate::error::{OrchestratorError, OrchestratorResult};

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const BITCOIN_LEDGER: &str = "bitcoin_ledger";
pub const ETHEREUM_LEDGER: &str = "ethereum_ledger";

/// Everything a wallet factory may need to build a signer
pub struct WalletRequest<'a> {
    pub chain: ChainId,
    pub network: Network,
    pub config: &'a ChainNetworkConfig,
    pub mnemonic: &'a str,
    pub derivation_path: &'a str,
    pub account_type: AccountType,
    pub address_type: Option<BitcoinAddressType>,
    pub chain_provider: Arc<dyn ChainProvider>,
}

/// Builds a signer, e.g. a hardware device bridge or a bitcoin HD wallet
pub trait WalletFactory: Send + Sync {
    fn create(&self, request: WalletRequest<'_>) -> OrchestratorResult<Arc<dyn WalletProvider>>;
}

pub struct BackendRequest<'a> {
    pub network: Network,
    pub config: &'a ChainNetworkConfig,
    pub mnemonic: &'a str,
    pub derivation_path: &'a str,
}

/// Builds both halves of a client for chains served entirely by the host
pub trait ChainBackendFactory: Send + Sync {
    fn create(
        &self,
        request: BackendRequest<'_>,
    ) -> OrchestratorResult<(Arc<dyn ChainProvider>, Arc<dyn WalletProvider>)>;
}

/// Host-registered factories
#[derive(Clone, Default)]
pub struct HostProviders {
    hardware: HashMap<String, Arc<dyn WalletFactory>>,
    software: HashMap<ChainId, Arc<dyn WalletFactory>>,
    backends: HashMap<ChainId, Arc<dyn ChainBackendFactory>>,
}

impl HostProviders {
    pub fn with_hardware(mut self, name: &str, factory: Arc<dyn WalletFactory>) -> Self {
        self.hardware.insert(name.to_string(), factory);
        self
    }

    pub fn with_software_wallet(mut self, chain: ChainId, factory: Arc<dyn WalletFactory>) -> Self {
        self.software.insert(chain, factory);
        self
    }

    pub fn with_backend(mut self, chain: ChainId, factory: Arc<dyn ChainBackendFactory>) -> Self {
        self.backends.insert(chain, factory);
        self
    }

    pub fn has_software_wallet(&self, chain: ChainId) -> bool {
        self.software.contains_key(&chain)
    }

    fn hardware(&self, name: &str) -> OrchestratorResult<&Arc<dyn WalletFactory>> {
        self.hardware.get(name).ok_or_else(|| {
            OrchestratorError::Config(format!(
                "No hardware wallet factory registered as {} - unable to build ledger client",
                name
            ))
        })
    }
}

impl fmt::Debug for HostProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostProviders")
            .field("hardware", &self.hardware.keys().collect::<Vec<_>>())
            .field("software", &self.software.keys().collect::<Vec<_>>())
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fee and signer policy of an EVM chain
struct EvmPolicy {
    fee_strategy: FeeStrategy,
    /// Priority fee ceiling in gwei for EIP-1559 chains
    priority_fee_cap_gwei: Option<Decimal>,
    gas_limit_margin: Option<u32>,
    ledger_types: &'static [AccountType],
}

const MAX_PRIORITY_FEE_GWEI: Decimal = Decimal::TWO;

const EVM_LEDGER_TYPES: &[AccountType] = &[AccountType::EthereumLedger, AccountType::RskLedger];

fn multipliers(slow: Decimal, average: Decimal, fast: Decimal) -> FeeStrategy {
    FeeStrategy::Rpc(FeeMultipliers::new(slow, average, fast))
}

fn evm_policy(chain: ChainId) -> EvmPolicy {
    let standard = || multipliers(Decimal::ONE, Decimal::ONE, Decimal::new(125, 2));
    match chain {
        ChainId::Ethereum => EvmPolicy {
            fee_strategy: FeeStrategy::Eip1559,
            priority_fee_cap_gwei: Some(MAX_PRIORITY_FEE_GWEI),
            gas_limit_margin: None,
            ledger_types: EVM_LEDGER_TYPES,
        },
        ChainId::Rsk => EvmPolicy {
            fee_strategy: standard(),
            priority_fee_cap_gwei: None,
            gas_limit_margin: Some(3000),
            ledger_types: EVM_LEDGER_TYPES,
        },
        ChainId::Bsc => EvmPolicy {
            fee_strategy: multipliers(Decimal::ONE, Decimal::TWO, Decimal::new(22, 1)),
            priority_fee_cap_gwei: None,
            gas_limit_margin: None,
            ledger_types: &[],
        },
        ChainId::Polygon | ChainId::Avalanche => EvmPolicy {
            fee_strategy: FeeStrategy::Eip1559,
            priority_fee_cap_gwei: Some(MAX_PRIORITY_FEE_GWEI),
            gas_limit_margin: None,
            ledger_types: &[],
        },
        _ => EvmPolicy {
            fee_strategy: standard(),
            priority_fee_cap_gwei: None,
            gas_limit_margin: None,
            ledger_types: &[],
        },
    }
}

/// Builds connected clients from static chain configuration
pub struct ChainClientFactory {
    chains: HashMap<String, ChainConfig>,
    host: HostProviders,
    http: reqwest::Client,
}

impl ChainClientFactory {
    pub fn new(chains: HashMap<String, ChainConfig>, host: HostProviders) -> Self {
        Self {
            chains,
            host,
            http: reqwest::Client::new(),
        }
    }

    fn network_config(&self, chain: ChainId, network: Network) -> OrchestratorResult<&ChainNetworkConfig> {
        self.chains
            .get(chain.as_str())
            .map(|c| c.network(network))
            .ok_or_else(|| {
                OrchestratorError::Config(format!("No configuration for chain {} on {}", chain, network))
            })
    }

    /// Build the client for `asset` on `network`
    pub fn create_client(
        &self,
        asset: &str,
        network: Network,
        mnemonic: &str,
        account_type: AccountType,
        derivation_path: &str,
    ) -> OrchestratorResult<Client> {
        let chain = assets::chain_of(asset)?;
        let config = self.network_config(chain, network)?;

        debug!(
            chain = %chain,
            network = %network,
            account_type = %account_type,
            "Creating client"
        );

        match chain {
            ChainId::Bitcoin => self.bitcoin_client(network, config, mnemonic, account_type, derivation_path),
            ChainId::Near | ChainId::Terra => {
                self.host_client(chain, network, config, mnemonic, account_type, derivation_path)
            }
            evm => self.evm_client(evm, network, config, mnemonic, account_type, derivation_path),
        }
    }

    fn bitcoin_client(
        &self,
        network: Network,
        config: &ChainNetworkConfig,
        mnemonic: &str,
        account_type: AccountType,
        derivation_path: &str,
    ) -> OrchestratorResult<Client> {
        let esplora_url = config
            .esplora_url
            .as_deref()
            .ok_or_else(|| OrchestratorError::Config(format!("Bitcoin {} requires esplora_url", network)))?;
        let chain_provider: Arc<dyn ChainProvider> =
            Arc::new(EsploraChainProvider::new(self.http.clone(), esplora_url));

        let (factory, address_type, signer) = if account_type.is_ledger() {
            let option = LEDGER_BITCOIN_OPTIONS
                .iter()
                .find(|o| o.account_type == account_type)
                .ok_or_else(|| {
                    OrchestratorError::Config(format!("Account type {} not an option for bitcoin", account_type))
                })?;
            (
                self.host.hardware(BITCOIN_LEDGER)?,
                Some(option.address_type),
                SignerKind::Hardware(BITCOIN_LEDGER.to_string()),
            )
        } else {
            let factory = self.host.software.get(&ChainId::Bitcoin).ok_or_else(|| {
                OrchestratorError::Config("No bitcoin wallet factory registered".to_string())
            })?;
            (factory, Some(BitcoinAddressType::Bech32), SignerKind::Mnemonic)
        };

        let wallet = factory.create(WalletRequest {
            chain: ChainId::Bitcoin,
            network,
            config,
            mnemonic,
            derivation_path,
            account_type,
            address_type,
            chain_provider: chain_provider.clone(),
        })?;

        let (fee_strategy, fees) = match (network, config.fee_api_url.as_deref()) {
            (Network::Mainnet, Some(url)) => (
                FeeStrategy::BitcoinFeeApi { url: url.to_string() },
                Some(Arc::new(BitcoinFeeApiProvider::new(self.http.clone(), url)) as Arc<dyn FeeProvider>),
            ),
            _ => (FeeStrategy::Fixed, None),
        };

        Ok(Client {
            chain: chain_provider,
            wallet,
            swap: Some(SwapCapability::BitcoinScript {
                scraper_url: esplora_url.to_string(),
            }),
            fees,
            profile: ClientProfile {
                chain: ChainId::Bitcoin,
                network,
                fee_strategy,
                signer,
            },
        })
    }

    fn evm_client(
        &self,
        chain: ChainId,
        network: Network,
        config: &ChainNetworkConfig,
        mnemonic: &str,
        account_type: AccountType,
        derivation_path: &str,
    ) -> OrchestratorResult<Client> {
        let policy = evm_policy(chain);
        let chain_id = config
            .chain_id
            .ok_or_else(|| OrchestratorError::Config(format!("EVM chain {} has no chain_id for {}", chain, network)))?;

        let evm = Arc::new(EvmChainProvider::new(chain, &config.rpc_url)?);
        let provider = evm.provider().clone();

        let fees: Arc<dyn FeeProvider> = match &policy.fee_strategy {
            FeeStrategy::Rpc(m) => Arc::new(RpcFeeProvider::new(provider.clone(), *m)),
            _ => Arc::new(Eip1559FeeProvider::new(provider.clone())),
        };
        let priority_fee_cap = policy.priority_fee_cap_gwei.map(gwei_to_wei).transpose()?;

        let (wallet, signer): (Arc<dyn WalletProvider>, SignerKind) = if account_type.is_ledger() {
            if !policy.ledger_types.contains(&account_type) {
                return Err(OrchestratorError::Config(format!(
                    "Account type {} not an option for chain {}",
                    account_type, chain
                )));
            }
            let wallet = self.host.hardware(ETHEREUM_LEDGER)?.create(WalletRequest {
                chain,
                network,
                config,
                mnemonic,
                derivation_path,
                account_type,
                address_type: None,
                chain_provider: evm.clone(),
            })?;
            (wallet, SignerKind::Hardware(ETHEREUM_LEDGER.to_string()))
        } else {
            let wallet = EvmWalletProvider::new(chain, provider, chain_id, mnemonic, derivation_path, priority_fee_cap)?;
            (Arc::new(wallet), SignerKind::Mnemonic)
        };

        let swap = config
            .htlc_contract
            .as_deref()
            .map(|address| -> OrchestratorResult<SwapCapability> {
                Ok(SwapCapability::EvmHtlc {
                    contract_address: parse_address(address)
                        .map_err(|e| OrchestratorError::Config(e.to_string()))?,
                    gas_limit_margin: policy.gas_limit_margin,
                })
            })
            .transpose()?;

        Ok(Client {
            chain: evm,
            wallet,
            swap,
            fees: Some(fees),
            profile: ClientProfile {
                chain,
                network,
                fee_strategy: policy.fee_strategy,
                signer,
            },
        })
    }

    fn host_client(
        &self,
        chain: ChainId,
        network: Network,
        config: &ChainNetworkConfig,
        mnemonic: &str,
        account_type: AccountType,
        derivation_path: &str,
    ) -> OrchestratorResult<Client> {
        if account_type.is_ledger() {
            return Err(OrchestratorError::Config(format!(
                "Account type {} not an option for chain {}",
                account_type, chain
            )));
        }
        let factory = self.host.backends.get(&chain).ok_or_else(|| {
            OrchestratorError::Config(format!("No backend factory registered for chain {}", chain))
        })?;
        let (chain_provider, wallet) = factory.create(BackendRequest {
            network,
            config,
            mnemonic,
            derivation_path,
        })?;

        Ok(Client {
            chain: chain_provider,
            wallet,
            swap: None,
            fees: None,
            profile: ClientProfile {
                chain,
                network,
                fee_strategy: FeeStrategy::Fixed,
                signer: SignerKind::Host,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_support::{FakeChain, FakeWallet};
    use crate::config::tests::default_settings;
    use std::sync::Mutex;

    const MNEMONIC: &str = "test test test test test test test test test test test junk";
    const ETH_PATH: &str = "m/44'/60'/0'/0/0";

    /// Records the requests it receives and hands back a fake wallet
    #[derive(Default)]
    struct RecordingFactory {
        address_types: Mutex<Vec<Option<BitcoinAddressType>>>,
    }

    impl WalletFactory for RecordingFactory {
        fn create(&self, request: WalletRequest<'_>) -> OrchestratorResult<Arc<dyn WalletProvider>> {
            self.address_types.lock().unwrap().push(request.address_type);
            Ok(Arc::new(FakeWallet::new("device-address")))
        }
    }

    struct FakeBackend;

    impl ChainBackendFactory for FakeBackend {
        fn create(
            &self,
            _request: BackendRequest<'_>,
        ) -> OrchestratorResult<(Arc<dyn ChainProvider>, Arc<dyn WalletProvider>)> {
            Ok((Arc::new(FakeChain::default()), Arc::new(FakeWallet::new("alice.near"))))
        }
    }

    fn factory(host: HostProviders) -> ChainClientFactory {
        ChainClientFactory::new(default_settings().chains, host)
    }

    #[test]
    fn test_software_wallet_registration_is_per_chain() {
        let host = HostProviders::default().with_software_wallet(ChainId::Bitcoin, Arc::new(RecordingFactory::default()));
        assert!(host.has_software_wallet(ChainId::Bitcoin));
        assert!(!host.has_software_wallet(ChainId::Ethereum));
        assert!(!HostProviders::default().has_software_wallet(ChainId::Bitcoin));
    }

    #[test]
    fn test_evm_fee_and_swap_policy() {
        let f = factory(HostProviders::default());

        let eth = f.create_client("ETH", Network::Mainnet, MNEMONIC, AccountType::Default, ETH_PATH).unwrap();
        assert_eq!(eth.profile.fee_strategy, FeeStrategy::Eip1559);
        assert_eq!(eth.profile.signer, SignerKind::Mnemonic);
        assert!(matches!(eth.swap, Some(SwapCapability::EvmHtlc { gas_limit_margin: None, .. })));

        let rsk = f.create_client("SOV", Network::Mainnet, MNEMONIC, AccountType::Default, ETH_PATH).unwrap();
        assert_eq!(
            rsk.profile.fee_strategy,
            FeeStrategy::Rpc(FeeMultipliers::new(Decimal::ONE, Decimal::ONE, Decimal::new(125, 2)))
        );
        assert!(matches!(rsk.swap, Some(SwapCapability::EvmHtlc { gas_limit_margin: Some(3000), .. })));

        let bsc = f.create_client("BNB", Network::Testnet, MNEMONIC, AccountType::Default, ETH_PATH).unwrap();
        assert_eq!(
            bsc.profile.fee_strategy,
            FeeStrategy::Rpc(FeeMultipliers::new(Decimal::ONE, Decimal::TWO, Decimal::new(22, 1)))
        );

        for asset in ["MATIC", "AVAX"] {
            let client = f.create_client(asset, Network::Mainnet, MNEMONIC, AccountType::Default, ETH_PATH).unwrap();
            assert_eq!(client.profile.fee_strategy, FeeStrategy::Eip1559);
        }
    }

    #[test]
    fn test_priority_fee_cap_only_on_eip1559_chains() {
        for chain in [ChainId::Ethereum, ChainId::Polygon, ChainId::Avalanche] {
            assert_eq!(evm_policy(chain).priority_fee_cap_gwei, Some(Decimal::TWO));
        }
        for chain in [ChainId::Rsk, ChainId::Bsc, ChainId::Arbitrum, ChainId::Fuse] {
            assert_eq!(evm_policy(chain).priority_fee_cap_gwei, None);
        }
    }

    #[test]
    fn test_chain_without_contract_has_no_swap_capability() {
        let f = factory(HostProviders::default());
        let fuse = f.create_client("FUSE", Network::Mainnet, MNEMONIC, AccountType::Default, ETH_PATH).unwrap();
        assert!(fuse.swap.is_none());
        assert!(fuse.fees.is_some());
    }

    #[test]
    fn test_evm_ledger_requires_registered_factory() {
        let f = factory(HostProviders::default());
        let err = f
            .create_client("ETH", Network::Mainnet, MNEMONIC, AccountType::EthereumLedger, ETH_PATH)
            .unwrap_err();
        assert!(err.is_configuration());

        let f = factory(HostProviders::default().with_hardware(ETHEREUM_LEDGER, Arc::new(RecordingFactory::default())));
        let client = f
            .create_client("RBTC", Network::Mainnet, MNEMONIC, AccountType::RskLedger, ETH_PATH)
            .unwrap();
        assert_eq!(client.profile.signer, SignerKind::Hardware(ETHEREUM_LEDGER.to_string()));
    }

    #[test]
    fn test_ledger_type_not_offered_on_chain_is_rejected() {
        let f = factory(HostProviders::default().with_hardware(ETHEREUM_LEDGER, Arc::new(RecordingFactory::default())));
        let err = f
            .create_client("BNB", Network::Mainnet, MNEMONIC, AccountType::EthereumLedger, ETH_PATH)
            .unwrap_err();
        assert!(err.to_string().contains("not an option"));

        let err = f
            .create_client("ETH", Network::Mainnet, MNEMONIC, AccountType::BitcoinLedgerLegacy, ETH_PATH)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bitcoin_ledger_maps_account_type_to_address_type() {
        let recorder = Arc::new(RecordingFactory::default());
        let f = factory(HostProviders::default().with_hardware(BITCOIN_LEDGER, recorder.clone()));

        let client = f
            .create_client("BTC", Network::Mainnet, MNEMONIC, AccountType::BitcoinLedgerLegacy, "m/44'/0'/0'")
            .unwrap();
        assert!(matches!(client.profile.fee_strategy, FeeStrategy::BitcoinFeeApi { .. }));
        assert!(matches!(client.swap, Some(SwapCapability::BitcoinScript { .. })));
        assert_eq!(
            recorder.address_types.lock().unwrap().as_slice(),
            &[Some(BitcoinAddressType::Legacy)]
        );

        let err = f
            .create_client("BTC", Network::Mainnet, MNEMONIC, AccountType::RskLedger, "m/44'/0'/0'")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_bitcoin_testnet_has_no_fee_provider() {
        let f = factory(HostProviders::default().with_software_wallet(ChainId::Bitcoin, Arc::new(RecordingFactory::default())));
        let client = f
            .create_client("BTC", Network::Testnet, MNEMONIC, AccountType::Default, "m/84'/1'/0'")
            .unwrap();
        assert!(client.fees.is_none());
        assert_eq!(client.profile.fee_strategy, FeeStrategy::Fixed);
    }

    #[test]
    fn test_host_backed_chains() {
        let f = factory(HostProviders::default());
        assert!(f
            .create_client("NEAR", Network::Mainnet, MNEMONIC, AccountType::Default, "m/44'/397'/0'")
            .unwrap_err()
            .is_configuration());

        let f = factory(HostProviders::default().with_backend(ChainId::Near, Arc::new(FakeBackend)));
        let client = f
            .create_client("NEAR", Network::Mainnet, MNEMONIC, AccountType::Default, "m/44'/397'/0'")
            .unwrap();
        assert!(client.swap.is_none());
        assert_eq!(client.profile.signer, SignerKind::Host);
    }

    #[test]
    fn test_unknown_asset_is_rejected() {
        let f = factory(HostProviders::default());
        assert!(f
            .create_client("DOGE", Network::Mainnet, MNEMONIC, AccountType::Default, ETH_PATH)
            .is_err());
    }
}
