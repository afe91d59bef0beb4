//! Drives pending history items to a terminal status

use super::retry::RetryScheduler;
use crate::assets::Network;
use crate::chain::{ClientRegistry, TxStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Notifier;
use crate::metrics;
use crate::state::{HistoryItem, HistoryUpdate, ProviderId, Status, StatusTable, SwapRecord, TransactionRecord, WalletStore};
use crate::swaps::{Quote, QuoteRequest, SwapProvider};
use crate::tx::TRANSACTION_STATUSES;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Action dispatch loop
///
/// Each pending record gets one driver task that repeatedly performs the
/// record's next action, validates and persists the update and emits the
/// status notification, until the record is terminal or a step fails.
pub struct ActionDispatcher {
    store: Arc<dyn WalletStore>,
    registry: Arc<ClientRegistry>,
    scheduler: Arc<RetryScheduler>,
    providers: HashMap<ProviderId, Arc<dyn SwapProvider>>,
    notifier: Arc<dyn Notifier>,
    /// Ids of records with a live driver
    active: DashMap<String, ()>,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn WalletStore>,
        registry: Arc<ClientRegistry>,
        scheduler: Arc<RetryScheduler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            providers: HashMap::new(),
            notifier,
            active: DashMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SwapProvider>) -> Self {
        info!("Registered swap provider {}", provider.id());
        self.providers.insert(provider.id(), provider);
        self
    }

    pub fn provider(&self, id: ProviderId) -> OrchestratorResult<Arc<dyn SwapProvider>> {
        self.providers
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Unsupported(format!("swap provider {} not enabled", id)))
    }

    fn statuses(&self, item: &HistoryItem) -> OrchestratorResult<&'static StatusTable> {
        match item {
            HistoryItem::Swap(swap) => Ok(self.provider(swap.provider)?.statuses()),
            HistoryItem::Send(_) => Ok(&TRANSACTION_STATUSES),
        }
    }

    /// Quotes from every provider serving the pair
    ///
    /// A provider that fails to quote is logged and left out.
    pub async fn get_quotes(&self, request: &QuoteRequest) -> Vec<Quote> {
        let providers: Vec<_> = self.providers.values().cloned().collect();
        let results = join_all(providers.iter().map(|p| p.get_quote(request))).await;

        providers
            .iter()
            .zip(results)
            .filter_map(|(provider, result)| match result {
                Ok(quote) => quote,
                Err(e) => {
                    warn!(provider = %provider.id(), "Quote failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Start a swap from `quote`, record it and begin driving it
    pub async fn start_swap(self: &Arc<Self>, network: Network, wallet_id: &str, quote: &Quote) -> OrchestratorResult<SwapRecord> {
        let provider = self.provider(quote.provider)?;
        let swap = provider.new_swap(network, wallet_id, quote).await?;
        info!(
            swap_id = %swap.id,
            provider = %swap.provider,
            status = %swap.status,
            "Swap started {} -> {}",
            swap.from,
            swap.to
        );

        let item = HistoryItem::Swap(swap.clone());
        self.store.add_history(network, wallet_id, item.clone()).await?;
        metrics::record_swap_created(swap.provider.as_str(), &swap.from, &swap.to);
        if let Some(notification) = provider.statuses().notification(&item) {
            self.notifier.notify(&item, notification);
        }

        self.dispatch(item);
        Ok(swap)
    }

    /// Spawn the driver for `item` unless it is terminal or already driven
    pub fn dispatch(self: &Arc<Self>, item: HistoryItem) -> Option<JoinHandle<()>> {
        if item.status().is_terminal() {
            return None;
        }

        let id = item.id().to_string();
        match self.active.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(id = %id, "Record already has a driver");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            this.drive(item).await;
            this.active.remove(&id);
        }))
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    async fn drive(&self, mut item: HistoryItem) {
        while !item.status().is_terminal() {
            match self.perform_next_action(&item).await {
                Ok(Some(updated)) => item = updated,
                Ok(None) => {
                    debug!(id = item.id(), status = %item.status(), "No further action");
                    break;
                }
                Err(e) => {
                    error!(id = item.id(), status = %item.status(), "Action failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Perform one step of `item` and persist the result
    ///
    /// Returns the updated record, or `None` when the current status has no
    /// action.
    pub async fn perform_next_action(&self, item: &HistoryItem) -> OrchestratorResult<Option<HistoryItem>> {
        let update = match item {
            HistoryItem::Swap(swap) => self.provider(swap.provider)?.perform_next_swap_action(swap).await?,
            HistoryItem::Send(tx) => self.wait_for_transaction(tx).await?,
        };
        let Some(update) = update else {
            return Ok(None);
        };

        let table = self.statuses(item)?;
        let previous = item.status();
        if let Some(next) = update.status {
            if let Err(e) = table.validate_transition(previous, next) {
                self.keep_transaction_hashes(item, &update).await;
                return Err(e);
            }
        }

        let updated = self
            .store
            .update_history(item.network(), item.wallet_id(), item.id(), &update)
            .await?;

        if updated.status() != previous {
            info!(id = updated.id(), from = %previous, to = %updated.status(), "Status changed");
            let kind = match &updated {
                HistoryItem::Swap(swap) => swap.provider.as_str(),
                HistoryItem::Send(_) => "send",
            };
            metrics::record_status_transition(kind, updated.status().as_str());

            if let HistoryItem::Swap(swap) = &updated {
                if let (true, Some(end)) = (swap.status.is_terminal(), swap.end_time) {
                    metrics::record_swap_duration(kind, (end - swap.start_time) as f64 / 1000.0);
                }
            }
            if let Some(notification) = table.notification(&updated) {
                self.notifier.notify(&updated, notification);
            }
        }

        Ok(Some(updated))
    }

    /// Persist hashes of transactions a rejected step already submitted
    async fn keep_transaction_hashes(&self, item: &HistoryItem, update: &HistoryUpdate) {
        if update.approve_tx_hash.is_none() && update.swap_tx_hash.is_none() {
            return;
        }

        let hashes = HistoryUpdate {
            approve_tx_hash: update.approve_tx_hash.clone(),
            swap_tx_hash: update.swap_tx_hash.clone(),
            ..Default::default()
        };
        warn!(
            id = item.id(),
            approve_tx_hash = ?hashes.approve_tx_hash,
            swap_tx_hash = ?hashes.swap_tx_hash,
            "Keeping transaction hashes of a rejected step"
        );
        if let Err(e) = self
            .store
            .update_history(item.network(), item.wallet_id(), item.id(), &hashes)
            .await
        {
            error!(id = item.id(), "Failed to persist transaction hashes: {}", e);
        }
    }

    async fn wait_for_transaction(&self, tx: &TransactionRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
        if tx.status != Status::WaitingForConfirmations {
            return Ok(None);
        }

        let client = self
            .registry
            .client(tx.network, &tx.wallet_id, &tx.from, &tx.account_id)
            .await?;
        let client = &client;
        let hash = tx.tx_hash.as_str();

        self.scheduler
            .with_interval(|| async move {
                Ok(client.confirmed_transaction(hash).await?.map(|confirmed| {
                    let status = match confirmed.status {
                        TxStatus::Failed => Status::Failed,
                        TxStatus::Success | TxStatus::Pending => Status::Success,
                    };
                    HistoryUpdate::status(status)
                }))
            })
            .await
            .map(Some)
    }

    /// Dispatch every pending record of every wallet; returns how many were picked up
    pub async fn resume_pending(self: &Arc<Self>, networks: &[Network]) -> OrchestratorResult<usize> {
        let mut resumed = 0;
        for wallet_id in self.store.wallet_ids().await {
            for network in networks {
                for item in self.store.history(*network, &wallet_id).await? {
                    if item.is_pending() && self.dispatch(item).is_some() {
                        resumed += 1;
                    }
                }
            }
        }
        info!(resumed, "Resumed pending history items");
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::ChainId;
    use crate::chain::test_support::{confirmed, fake_client, not_found, FakeChain, FakeWallet};
    use crate::chain::{ChainClientFactory, HostProviders};
    use crate::config::tests::default_settings;
    use crate::coordination::retry::test_support::instant_scheduler;
    use crate::events::test_support::RecordingNotifier;
    use crate::state::now_millis;
    use crate::state::store::tests::{account, store_with};
    use crate::state::InMemoryStore;
    use crate::swaps::fastbtc::FASTBTC_STATUSES;
    use crate::swaps::{FeeEstimateRequest, FeeTable, SupportedPair};
    use async_trait::async_trait;
    use ethers::types::U256;

    /// Provider whose every step returns the same update
    struct ScriptedProvider {
        update: HistoryUpdate,
    }

    #[async_trait]
    impl SwapProvider for ScriptedProvider {
        fn id(&self) -> ProviderId {
            ProviderId::FastBtc
        }

        async fn supported_pairs(&self) -> OrchestratorResult<Vec<SupportedPair>> {
            Ok(Vec::new())
        }

        async fn get_quote(&self, _request: &QuoteRequest) -> OrchestratorResult<Option<Quote>> {
            Ok(None)
        }

        async fn new_swap(&self, _network: Network, _wallet_id: &str, _quote: &Quote) -> OrchestratorResult<SwapRecord> {
            Err(OrchestratorError::Unsupported("scripted".to_string()))
        }

        async fn estimate_fees(&self, _request: FeeEstimateRequest<'_>) -> OrchestratorResult<Option<FeeTable>> {
            Ok(None)
        }

        async fn perform_next_swap_action(&self, _swap: &SwapRecord) -> OrchestratorResult<Option<HistoryUpdate>> {
            Ok(Some(self.update.clone()))
        }

        fn statuses(&self) -> &'static StatusTable {
            &FASTBTC_STATUSES
        }
    }

    fn swap(id: &str) -> HistoryItem {
        HistoryItem::Swap(SwapRecord {
            id: id.to_string(),
            provider: ProviderId::FastBtc,
            network: Network::Mainnet,
            wallet_id: "w1".to_string(),
            from: "BTC".to_string(),
            to: "RBTC".to_string(),
            from_amount: U256::from(1_000_000u64),
            to_amount: U256::exp10(16),
            fee: None,
            slippage: Some(50),
            status: Status::WaitingForSendConfirmations,
            approve_tx_hash: None,
            swap_tx_hash: Some("aa".to_string()),
            start_time: now_millis(),
            end_time: None,
            from_account_id: "btc-1".to_string(),
            to_account_id: "rsk-1".to_string(),
        })
    }

    struct Setup {
        dispatcher: Arc<ActionDispatcher>,
        store: Arc<InMemoryStore>,
        chain: Arc<FakeChain>,
        notifier: Arc<RecordingNotifier>,
    }

    fn setup() -> Setup {
        setup_with(Vec::new())
    }

    fn setup_with(providers: Vec<Arc<dyn SwapProvider>>) -> Setup {
        let store = Arc::new(store_with("w1", vec![account("btc-1", ChainId::Bitcoin, &["BTC"])]));
        let factory = Arc::new(ChainClientFactory::new(default_settings().chains, HostProviders::default()));
        let registry = Arc::new(ClientRegistry::new(factory, store.clone()));
        let chain = Arc::new(FakeChain::default());
        registry.insert(
            Network::Mainnet,
            "w1",
            "BTC",
            "btc-1",
            fake_client(ChainId::Bitcoin, chain.clone(), Arc::new(FakeWallet::new("bc1qa"))),
        );
        let (scheduler, _) = instant_scheduler();
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = providers.into_iter().fold(
            ActionDispatcher::new(store.clone(), registry, Arc::new(scheduler), notifier.clone()),
            |dispatcher, provider| dispatcher.with_provider(provider),
        );
        let dispatcher = Arc::new(dispatcher);
        Setup {
            dispatcher,
            store,
            chain,
            notifier,
        }
    }

    fn send(id: &str, hash: &str) -> HistoryItem {
        HistoryItem::Send(TransactionRecord {
            id: id.to_string(),
            network: Network::Mainnet,
            wallet_id: "w1".to_string(),
            account_id: "btc-1".to_string(),
            from: "BTC".to_string(),
            to: "BTC".to_string(),
            to_address: "bc1qdest".to_string(),
            amount: U256::from(1000u64),
            fee: None,
            tx_hash: hash.to_string(),
            status: Status::WaitingForConfirmations,
            start_time: now_millis(),
            end_time: None,
            fee_label: None,
        })
    }

    #[tokio::test]
    async fn test_send_driven_to_success() {
        let s = setup();
        let item = send("tx-1", "aa");
        s.store.add_history(Network::Mainnet, "w1", item.clone()).await.unwrap();
        s.chain
            .script_tx("aa", vec![not_found("aa"), confirmed("aa", TxStatus::Success)]);

        s.dispatcher.dispatch(item).unwrap().await.unwrap();

        let stored = s.store.history_item(Network::Mainnet, "w1", "tx-1").await.unwrap();
        assert_eq!(stored.status(), Status::Success);
        assert!(!s.dispatcher.is_active("tx-1"));
    }

    #[tokio::test]
    async fn test_reverted_send_fails() {
        let s = setup();
        let item = send("tx-2", "bb");
        s.store.add_history(Network::Mainnet, "w1", item.clone()).await.unwrap();
        s.chain.script_tx("bb", vec![confirmed("bb", TxStatus::Failed)]);

        let updated = s.dispatcher.perform_next_action(&item).await.unwrap().unwrap();
        assert_eq!(updated.status(), Status::Failed);
        if let HistoryItem::Send(tx) = updated {
            assert!(tx.end_time.is_some());
        }
        assert!(s.dispatcher.perform_next_action(&s.store.history_item(Network::Mainnet, "w1", "tx-2").await.unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_single_driver_per_record() {
        let s = setup();
        let item = send("tx-3", "cc");
        s.store.add_history(Network::Mainnet, "w1", item.clone()).await.unwrap();
        s.chain.script_tx("cc", vec![confirmed("cc", TxStatus::Success)]);

        let first = s.dispatcher.dispatch(item.clone());
        assert!(first.is_some());
        assert!(s.dispatcher.dispatch(item).is_none());
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_skips_terminal_records() {
        let s = setup();
        s.store.add_history(Network::Mainnet, "w1", send("tx-4", "dd")).await.unwrap();
        let mut done = send("tx-5", "ee");
        done.apply(&HistoryUpdate::status(Status::Success));
        s.store.add_history(Network::Mainnet, "w1", done).await.unwrap();
        s.chain.script_tx("dd", vec![confirmed("dd", TxStatus::Success)]);

        let resumed = s.dispatcher.resume_pending(&[Network::Mainnet, Network::Testnet]).await.unwrap();
        assert_eq!(resumed, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_unsupported() {
        let s = setup();
        assert!(matches!(
            s.dispatcher.provider(ProviderId::UniswapV2),
            Err(OrchestratorError::Unsupported(_))
        ));
        assert!(s.notifier.titles().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_step_keeps_submitted_hash() {
        let provider = ScriptedProvider {
            update: HistoryUpdate::status(Status::ApproveConfirmed).with_swap_tx_hash("0xsubmitted"),
        };
        let s = setup_with(vec![Arc::new(provider)]);
        let item = swap("swap-1");
        s.store.add_history(Network::Mainnet, "w1", item.clone()).await.unwrap();

        let err = s.dispatcher.perform_next_action(&item).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));

        let HistoryItem::Swap(stored) = s.store.history_item(Network::Mainnet, "w1", "swap-1").await.unwrap() else {
            panic!("expected a swap record");
        };
        assert_eq!(stored.status, Status::WaitingForSendConfirmations);
        assert_eq!(stored.swap_tx_hash.as_deref(), Some("0xsubmitted"));
        assert!(stored.end_time.is_none());
        assert!(s.notifier.titles().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_step_without_hashes_leaves_record() {
        let provider = ScriptedProvider {
            update: HistoryUpdate::status(Status::WaitingForApproveConfirmations),
        };
        let s = setup_with(vec![Arc::new(provider)]);
        let item = swap("swap-2");
        s.store.add_history(Network::Mainnet, "w1", item.clone()).await.unwrap();

        assert!(s.dispatcher.perform_next_action(&item).await.is_err());
        let stored = s.store.history_item(Network::Mainnet, "w1", "swap-2").await.unwrap();
        assert_eq!(stored, item);
    }
}
