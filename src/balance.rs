//! Account balance and address synchronisation

use crate::assets::{self, ChainId, Network};
use crate::chain::ClientRegistry;
use crate::error::OrchestratorResult;
use crate::metrics;
use crate::state::{Account, AccountUpdate, WalletStore};

use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refreshes balances and used addresses of enabled accounts
pub struct BalanceSyncer {
    store: Arc<dyn WalletStore>,
    registry: Arc<ClientRegistry>,
}

impl BalanceSyncer {
    pub fn new(store: Arc<dyn WalletStore>, registry: Arc<ClientRegistry>) -> Self {
        Self { store, registry }
    }

    /// Sync every enabled account holding at least one of `assets` (all when `None`)
    ///
    /// A failing asset is logged and skipped; the other assets and accounts
    /// are still written.
    pub async fn sync(&self, network: Network, wallet_id: &str, assets: Option<&[String]>) -> OrchestratorResult<()> {
        let accounts: Vec<Account> = self
            .store
            .accounts(network, wallet_id)
            .await?
            .into_iter()
            .filter(|a| a.enabled && !a.assets.is_empty())
            .filter(|a| match assets {
                Some(wanted) => a.assets.iter().any(|asset| wanted.contains(asset)),
                None => true,
            })
            .collect();

        debug!(wallet_id = wallet_id, accounts = accounts.len(), "Syncing balances");

        for account in &accounts {
            if let Err(e) = self.sync_account(network, wallet_id, account).await {
                warn!(account_id = %account.id, "Balance sync failed: {}", e);
            }
        }
        Ok(())
    }

    async fn sync_account(&self, network: Network, wallet_id: &str, account: &Account) -> OrchestratorResult<()> {
        let mut balances = HashMap::new();
        let mut used_addresses: Vec<String> = Vec::new();
        let mut addresses_fetched = false;

        for asset in &account.assets {
            let addresses = match self.asset_addresses(network, wallet_id, account, asset).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    metrics::record_balance_failure(asset);
                    warn!(account_id = %account.id, asset = %asset, "Addresses unavailable: {}", e);
                    continue;
                }
            };
            addresses_fetched = true;

            match self.asset_balance(network, wallet_id, account, asset, &addresses).await {
                Ok(balance) => {
                    balances.insert(asset.clone(), balance);
                }
                Err(e) => {
                    metrics::record_balance_failure(asset);
                    warn!(account_id = %account.id, asset = %asset, "Balance unavailable: {}", e);
                }
            }

            for address in addresses {
                if !used_addresses.contains(&address) {
                    used_addresses.push(address);
                }
            }
        }

        // Addresses are committed whether or not the balance lookups succeeded
        let addresses = if account.account_type.is_ledger() || !addresses_fetched {
            None
        } else if account.chain == ChainId::Bitcoin {
            Some(merge_addresses(&account.addresses, used_addresses))
        } else {
            Some(used_addresses)
        };

        if balances.is_empty() && addresses.is_none() {
            return Ok(());
        }

        info!(account_id = %account.id, assets = balances.len(), "Balances updated");
        self.store
            .update_account(network, wallet_id, &account.id, AccountUpdate { balances, addresses })
            .await
    }

    async fn asset_addresses(
        &self,
        network: Network,
        wallet_id: &str,
        account: &Account,
        asset: &str,
    ) -> OrchestratorResult<Vec<String>> {
        if account.account_type.is_ledger() {
            return Ok(account.addresses.clone());
        }
        let client = self.registry.client(network, wallet_id, asset, &account.id).await?;
        client.wallet.get_used_addresses().await
    }

    async fn asset_balance(
        &self,
        network: Network,
        wallet_id: &str,
        account: &Account,
        asset: &str,
        addresses: &[String],
    ) -> OrchestratorResult<U256> {
        if addresses.is_empty() {
            return Ok(U256::zero());
        }

        let info = assets::asset(asset)?;
        let client = self.registry.client(network, wallet_id, asset, &account.id).await?;
        Ok(client
            .chain
            .get_balance(addresses, &[info])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}

/// Stored addresses followed by newly used ones, without duplicates
fn merge_addresses(stored: &[String], used: Vec<String>) -> Vec<String> {
    let mut merged = stored.to_vec();
    for address in used {
        if !merged.contains(&address) {
            merged.push(address);
        }
    }
    merged
}
