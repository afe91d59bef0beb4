//! Wallet state store

use super::history::{HistoryItem, HistoryUpdate};
use crate::assets::{AccountType, ChainId, Network};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Wallet account as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub chain: ChainId,
    pub assets: Vec<String>,
    #[serde(rename = "type", default = "default_account_type")]
    pub account_type: AccountType,
    pub derivation_path: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Smallest-unit balances as decimal strings
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
}

fn default_account_type() -> AccountType {
    AccountType::Default
}

fn default_enabled() -> bool {
    true
}

impl Account {
    pub fn balance(&self, asset: &str) -> Option<U256> {
        self.balances
            .get(asset)
            .and_then(|b| U256::from_dec_str(b).ok())
    }
}

/// Result of syncing one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub balances: HashMap<String, U256>,
    /// Replaces the stored address list when present
    pub addresses: Option<Vec<String>>,
}

/// Read/write access to wallet accounts and history
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn wallet_ids(&self) -> Vec<String>;

    async fn accounts(&self, network: Network, wallet_id: &str) -> OrchestratorResult<Vec<Account>>;

    async fn account(&self, network: Network, wallet_id: &str, account_id: &str) -> OrchestratorResult<Account>;

    async fn mnemonic(&self, wallet_id: &str) -> OrchestratorResult<String>;

    async fn update_account(
        &self,
        network: Network,
        wallet_id: &str,
        account_id: &str,
        update: AccountUpdate,
    ) -> OrchestratorResult<()>;

    async fn history(&self, network: Network, wallet_id: &str) -> OrchestratorResult<Vec<HistoryItem>>;

    async fn history_item(&self, network: Network, wallet_id: &str, id: &str) -> OrchestratorResult<HistoryItem>;

    async fn add_history(&self, network: Network, wallet_id: &str, item: HistoryItem) -> OrchestratorResult<()>;

    /// Apply `update` to a record and return the result
    async fn update_history(
        &self,
        network: Network,
        wallet_id: &str,
        id: &str,
        update: &HistoryUpdate,
    ) -> OrchestratorResult<HistoryItem>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletData {
    #[serde(default)]
    pub accounts: HashMap<Network, Vec<Account>>,
    #[serde(default)]
    pub history: HashMap<Network, Vec<HistoryItem>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletState {
    #[serde(default)]
    pub wallets: BTreeMap<String, WalletData>,
}

/// In-memory store, optionally mirrored to a JSON file after every write
pub struct InMemoryStore {
    state: RwLock<WalletState>,
    path: Option<PathBuf>,
    mnemonics: DashMap<String, String>,
}

impl InMemoryStore {
    pub fn new(state: WalletState) -> Self {
        Self {
            state: RwLock::new(state),
            path: None,
            mnemonics: DashMap::new(),
        }
    }

    /// Load from `path`; a missing file starts an empty state
    pub async fn open(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| OrchestratorError::Storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No wallet state at {}, starting empty", path.display());
                WalletState::default()
            }
            Err(e) => return Err(OrchestratorError::Storage(e.to_string())),
        };

        info!("Loaded {} wallet(s) from {}", state.wallets.len(), path.display());

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            mnemonics: DashMap::new(),
        })
    }

    pub fn set_mnemonic(&self, wallet_id: &str, mnemonic: String) {
        self.mnemonics.insert(wallet_id.to_string(), mnemonic);
    }

    async fn persist(&self, state: &WalletState) -> OrchestratorResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
        }
        tokio::fs::write(path, raw)
            .await
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
        debug!("Persisted wallet state to {}", path.display());
        Ok(())
    }
}

fn wallet<'a>(state: &'a WalletState, wallet_id: &str) -> OrchestratorResult<&'a WalletData> {
    state
        .wallets
        .get(wallet_id)
        .ok_or_else(|| OrchestratorError::Storage(format!("wallet {} not found", wallet_id)))
}

fn wallet_mut<'a>(state: &'a mut WalletState, wallet_id: &str) -> OrchestratorResult<&'a mut WalletData> {
    state
        .wallets
        .get_mut(wallet_id)
        .ok_or_else(|| OrchestratorError::Storage(format!("wallet {} not found", wallet_id)))
}

#[async_trait]
impl WalletStore for InMemoryStore {
    async fn wallet_ids(&self) -> Vec<String> {
        self.state.read().await.wallets.keys().cloned().collect()
    }

    async fn accounts(&self, network: Network, wallet_id: &str) -> OrchestratorResult<Vec<Account>> {
        let state = self.state.read().await;
        Ok(wallet(&state, wallet_id)?
            .accounts
            .get(&network)
            .cloned()
            .unwrap_or_default())
    }

    async fn account(&self, network: Network, wallet_id: &str, account_id: &str) -> OrchestratorResult<Account> {
        self.accounts(network, wallet_id)
            .await?
            .into_iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| OrchestratorError::AccountNotFound {
                wallet_id: wallet_id.to_string(),
                account_id: account_id.to_string(),
            })
    }

    async fn mnemonic(&self, wallet_id: &str) -> OrchestratorResult<String> {
        self.mnemonics
            .get(wallet_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| OrchestratorError::MnemonicUnavailable(wallet_id.to_string()))
    }

    async fn update_account(
        &self,
        network: Network,
        wallet_id: &str,
        account_id: &str,
        update: AccountUpdate,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let account = wallet_mut(&mut state, wallet_id)?
            .accounts
            .get_mut(&network)
            .and_then(|accounts| accounts.iter_mut().find(|a| a.id == account_id))
            .ok_or_else(|| OrchestratorError::AccountNotFound {
                wallet_id: wallet_id.to_string(),
                account_id: account_id.to_string(),
            })?;

        for (asset, balance) in update.balances {
            account.balances.insert(asset, balance.to_string());
        }
        if let Some(addresses) = update.addresses {
            account.addresses = addresses;
        }

        self.persist(&state).await
    }

    async fn history(&self, network: Network, wallet_id: &str) -> OrchestratorResult<Vec<HistoryItem>> {
        let state = self.state.read().await;
        Ok(wallet(&state, wallet_id)?
            .history
            .get(&network)
            .cloned()
            .unwrap_or_default())
    }

    async fn history_item(&self, network: Network, wallet_id: &str, id: &str) -> OrchestratorResult<HistoryItem> {
        self.history(network, wallet_id)
            .await?
            .into_iter()
            .find(|item| item.id() == id)
            .ok_or_else(|| OrchestratorError::HistoryItemNotFound { id: id.to_string() })
    }

    async fn add_history(&self, network: Network, wallet_id: &str, item: HistoryItem) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        wallet_mut(&mut state, wallet_id)?
            .history
            .entry(network)
            .or_default()
            .push(item);
        self.persist(&state).await
    }

    async fn update_history(
        &self,
        network: Network,
        wallet_id: &str,
        id: &str,
        update: &HistoryUpdate,
    ) -> OrchestratorResult<HistoryItem> {
        let mut state = self.state.write().await;
        let item = wallet_mut(&mut state, wallet_id)?
            .history
            .get_mut(&network)
            .and_then(|items| items.iter_mut().find(|item| item.id() == id))
            .ok_or_else(|| OrchestratorError::HistoryItemNotFound { id: id.to_string() })?;
        item.apply(update);
        let updated = item.clone();
        self.persist(&state).await?;
        Ok(updated)
    }
}
