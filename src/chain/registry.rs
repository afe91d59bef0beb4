//! Per-account client cache

use super::{ChainClientFactory, Client};
use crate::assets::Network;
use crate::error::OrchestratorResult;
use crate::state::WalletStore;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    network: Network,
    wallet_id: String,
    asset: String,
    account_id: String,
}

impl ClientKey {
    fn new(network: Network, wallet_id: &str, asset: &str, account_id: &str) -> Self {
        Self {
            network,
            wallet_id: wallet_id.to_string(),
            asset: asset.to_string(),
            account_id: account_id.to_string(),
        }
    }
}

/// Resolves (network, wallet, asset, account) to a client, building it on first use
pub struct ClientRegistry {
    factory: Arc<ChainClientFactory>,
    store: Arc<dyn WalletStore>,
    clients: DashMap<ClientKey, Client>,
}

impl ClientRegistry {
    pub fn new(factory: Arc<ChainClientFactory>, store: Arc<dyn WalletStore>) -> Self {
        Self {
            factory,
            store,
            clients: DashMap::new(),
        }
    }

    pub async fn client(
        &self,
        network: Network,
        wallet_id: &str,
        asset: &str,
        account_id: &str,
    ) -> OrchestratorResult<Client> {
        let key = ClientKey::new(network, wallet_id, asset, account_id);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let account = self.store.account(network, wallet_id, account_id).await?;
        let mnemonic = self.store.mnemonic(wallet_id).await?;
        let client = self.factory.create_client(
            asset,
            network,
            &mnemonic,
            account.account_type,
            &account.derivation_path,
        )?;

        debug!(
            wallet_id = wallet_id,
            account_id = account_id,
            asset = asset,
            "Built client for {}",
            client.profile.chain
        );

        // A concurrent builder may have won; keep the first one
        Ok(self.clients.entry(key).or_insert(client).clone())
    }

    /// Register a prebuilt client
    pub fn insert(&self, network: Network, wallet_id: &str, asset: &str, account_id: &str, client: Client) {
        self.clients
            .insert(ClientKey::new(network, wallet_id, asset, account_id), client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::ChainId;
    use crate::chain::test_support::{fake_client, FakeChain, FakeWallet};
    use crate::chain::HostProviders;
    use crate::config::tests::default_settings;
    use crate::state::store::tests::{account, store_with};

    fn registry() -> ClientRegistry {
        let store = Arc::new(store_with("w1", vec![account("eth-1", ChainId::Ethereum, &["ETH", "DAI"])]));
        let factory = Arc::new(ChainClientFactory::new(default_settings().chains, HostProviders::default()));
        ClientRegistry::new(factory, store)
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_asset() {
        let registry = registry();
        let eth = registry.client(Network::Mainnet, "w1", "ETH", "eth-1").await.unwrap();
        assert_eq!(eth.profile.chain, ChainId::Ethereum);
        registry.client(Network::Mainnet, "w1", "ETH", "eth-1").await.unwrap();
        assert_eq!(registry.len(), 1);

        registry.client(Network::Mainnet, "w1", "DAI", "eth-1").await.unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_account_fails() {
        let registry = registry();
        assert!(registry.client(Network::Mainnet, "w1", "ETH", "missing").await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_inserted_client_is_returned() {
        let registry = registry();
        let client = fake_client(
            ChainId::Rsk,
            Arc::new(FakeChain::default()),
            Arc::new(FakeWallet::new("0xrsk")),
        );
        registry.insert(Network::Mainnet, "w1", "RBTC", "rsk-1", client);
        let got = registry.client(Network::Mainnet, "w1", "RBTC", "rsk-1").await.unwrap();
        assert_eq!(got.wallet.get_address().await.unwrap(), "0xrsk");
    }
}
