//! Native transfers and contract calls recorded as SEND history items

use crate::assets::{self, Network};
use crate::chain::{ClientRegistry, SendOptions, SentTransaction};
use crate::coordination::{ActionDispatcher, AssetLockRegistry, RetryScheduler};
use crate::error::OrchestratorResult;
use crate::events::{Notification, Notifier};
use crate::metrics;
use crate::state::history::u256_dec;
use crate::state::{now_millis, FilterBucket, HistoryItem, Status, StatusMeta, StatusTable, TransactionRecord, WalletStore};

use ethers::types::U256;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Status table of a send: wait for one confirmation, then done
pub static TRANSACTION_STATUSES: StatusTable = StatusTable {
    entries: &[
        StatusMeta {
            status: Status::WaitingForConfirmations,
            step: 0,
            label: "Sending {from}",
            filter: FilterBucket::Pending,
            notification: None,
        },
        StatusMeta {
            status: Status::Success,
            step: 1,
            label: "Completed",
            filter: FilterBucket::Completed,
            notification: None,
        },
        StatusMeta {
            status: Status::Failed,
            step: 1,
            label: "Failed",
            filter: FilterBucket::Refunded,
            notification: None,
        },
    ],
    timeline_steps: &["SEND"],
    total_steps: 2,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub network: Network,
    pub wallet_id: String,
    pub account_id: String,
    pub asset: String,
    pub to: String,
    /// Smallest unit
    #[serde(with = "u256_dec")]
    pub amount: U256,
    #[serde(default)]
    pub fee: Option<Decimal>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub fee_label: Option<String>,
}

pub struct TransactionOrchestrator {
    store: Arc<dyn WalletStore>,
    registry: Arc<ClientRegistry>,
    scheduler: Arc<RetryScheduler>,
    locks: Arc<AssetLockRegistry>,
    dispatcher: Arc<ActionDispatcher>,
    notifier: Arc<dyn Notifier>,
}

impl TransactionOrchestrator {
    pub fn new(
        store: Arc<dyn WalletStore>,
        registry: Arc<ClientRegistry>,
        scheduler: Arc<RetryScheduler>,
        locks: Arc<AssetLockRegistry>,
        dispatcher: Arc<ActionDispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            locks,
            dispatcher,
            notifier,
        }
    }

    /// Submit under the chain lock, record the send and start watching it
    ///
    /// Submission is not retried; a wallet error leaves no history item.
    pub async fn send(&self, request: SendRequest) -> OrchestratorResult<SentTransaction> {
        let chain = assets::chain_of(&request.asset)?;
        let client = self
            .registry
            .client(request.network, &request.wallet_id, &request.asset, &request.account_id)
            .await?;

        let options = SendOptions {
            to: request.to.clone(),
            value: request.amount,
            data: request.data.clone(),
            fee: request.fee,
            gas_limit: request.gas_limit,
        };
        let sent = self
            .scheduler
            .with_lock(&self.locks, request.network, &request.wallet_id, &request.asset, || {
                client.wallet.send_transaction(options)
            })
            .await?;

        let record = TransactionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            network: request.network,
            wallet_id: request.wallet_id.clone(),
            account_id: request.account_id.clone(),
            from: request.asset.clone(),
            to: request.asset.clone(),
            to_address: request.to.clone(),
            amount: request.amount,
            fee: request.fee,
            tx_hash: sent.hash.clone(),
            status: Status::WaitingForConfirmations,
            start_time: now_millis(),
            end_time: None,
            fee_label: request.fee_label.clone(),
        };
        info!(
            id = %record.id,
            wallet_id = %record.wallet_id,
            tx_hash = %record.tx_hash,
            "Sent {} {} to {}",
            record.amount,
            record.from,
            record.to_address
        );

        let notification = Notification::transaction_sent(&record);
        let item = HistoryItem::Send(record);
        self.store
            .add_history(request.network, &request.wallet_id, item.clone())
            .await?;
        metrics::record_tx_sent(chain.as_str());
        self.notifier.notify(&item, notification);
        self.dispatcher.dispatch(item);

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::ChainId;
    use crate::chain::test_support::{confirmed, fake_client, FakeChain, FakeWallet};
    use crate::chain::{ChainClientFactory, HostProviders, TxStatus};
    use crate::config::tests::default_settings;
    use crate::coordination::retry::test_support::instant_scheduler;
    use crate::events::test_support::RecordingNotifier;
    use crate::state::store::tests::{account, store_with};
    use crate::state::InMemoryStore;
    use std::time::Duration;

    struct Setup {
        orchestrator: TransactionOrchestrator,
        store: Arc<InMemoryStore>,
        locks: Arc<AssetLockRegistry>,
        chain: Arc<FakeChain>,
        notifier: Arc<RecordingNotifier>,
    }

    fn setup(wallet: FakeWallet) -> Setup {
        let store = Arc::new(store_with("w1", vec![account("eth-1", ChainId::Ethereum, &["ETH", "DAI"])]));
        let factory = Arc::new(ChainClientFactory::new(default_settings().chains, HostProviders::default()));
        let registry = Arc::new(ClientRegistry::new(factory, store.clone()));
        let chain = Arc::new(FakeChain::default());
        registry.insert(
            Network::Mainnet,
            "w1",
            "ETH",
            "eth-1",
            fake_client(ChainId::Ethereum, chain.clone(), Arc::new(wallet)),
        );

        let (scheduler, _) = instant_scheduler();
        let scheduler = Arc::new(scheduler);
        let locks = Arc::new(AssetLockRegistry::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            notifier.clone(),
        ));
        Setup {
            orchestrator: TransactionOrchestrator::new(
                store.clone(),
                registry,
                scheduler,
                locks.clone(),
                dispatcher,
                notifier.clone(),
            ),
            store,
            locks,
            chain,
            notifier,
        }
    }

    fn request() -> SendRequest {
        SendRequest {
            network: Network::Mainnet,
            wallet_id: "w1".to_string(),
            account_id: "eth-1".to_string(),
            asset: "ETH".to_string(),
            to: "0x00000000000000000000000000000000000000bb".to_string(),
            amount: U256::exp10(17),
            fee: Some(Decimal::from(30)),
            data: None,
            gas_limit: None,
            fee_label: Some("average".to_string()),
        }
    }

    #[tokio::test]
    async fn test_send_records_and_confirms() {
        let s = setup(FakeWallet::new("0x00000000000000000000000000000000000000aa"));
        s.chain.script_tx("0xtx1", vec![confirmed("0xtx1", TxStatus::Success)]);

        let sent = s.orchestrator.send(request()).await.unwrap();
        assert_eq!(sent.hash, "0xtx1");
        assert!(!s.locks.is_locked("mainnet-w1-ethereum"));
        assert_eq!(s.notifier.titles(), vec!["New Transaction".to_string()]);

        let history = s.store.history(Network::Mainnet, "w1").await.unwrap();
        assert_eq!(history.len(), 1);
        let HistoryItem::Send(record) = &history[0] else {
            panic!("expected a send record");
        };
        assert_eq!(record.tx_hash, "0xtx1");
        assert_eq!(record.fee_label.as_deref(), Some("average"));
        assert_eq!(record.to_address, "0x00000000000000000000000000000000000000bb");

        let id = record.id.clone();
        let mut status = record.status;
        for _ in 0..50 {
            status = s.store.history_item(Network::Mainnet, "w1", &id).await.unwrap().status();
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Status::Success);
    }

    #[tokio::test]
    async fn test_failed_submission_records_nothing() {
        let mut wallet = FakeWallet::new("0x00000000000000000000000000000000000000aa");
        wallet.fail_send = true;
        let s = setup(wallet);

        assert!(s.orchestrator.send(request()).await.is_err());
        assert!(s.store.history(Network::Mainnet, "w1").await.unwrap().is_empty());
        assert!(!s.locks.is_locked("mainnet-w1-ethereum"));
        assert!(s.notifier.titles().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_swap_share_the_chain_lock() {
        use crate::balance::BalanceSyncer;
        use crate::coordination::retry::test_support::config;
        use crate::state::ProviderId;
        use crate::swaps::amm::{MockAmmChain, UniswapDeployment};
        use crate::swaps::{Quote, SwapContext, SwapProvider, UniswapSwapProvider};
        use tokio::sync::Semaphore;

        let gate = Arc::new(Semaphore::new(0));
        let mut wallet = FakeWallet::new("0x00000000000000000000000000000000000000aa");
        wallet.gate = Some(gate.clone());
        let wallet = Arc::new(wallet);
        let chain = Arc::new(FakeChain {
            block_height: 100,
            block_timestamp: 1_700_000_000,
            ..Default::default()
        });

        let settings = default_settings();
        let store = Arc::new(store_with("w1", vec![account("eth-1", ChainId::Ethereum, &["ETH", "DAI"])]));
        let factory = Arc::new(ChainClientFactory::new(settings.chains.clone(), HostProviders::default()));
        let registry = Arc::new(ClientRegistry::new(factory, store.clone()));
        for asset in ["ETH", "DAI"] {
            registry.insert(
                Network::Mainnet,
                "w1",
                asset,
                "eth-1",
                fake_client(ChainId::Ethereum, chain.clone(), wallet.clone()),
            );
        }

        // Real sleeper with a 5s lock retry: the waiting swap is woken by the unlock event
        let scheduler = Arc::new(RetryScheduler::new(&config()));
        let locks = Arc::new(AssetLockRegistry::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            notifier.clone(),
        ));
        let orchestrator = Arc::new(TransactionOrchestrator::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
            locks.clone(),
            dispatcher,
            notifier,
        ));
        let deployment = UniswapDeployment::from_config(settings.swaps.uniswap.as_ref().unwrap()).unwrap();
        let router = format!("{:?}", deployment.router);
        let uniswap = UniswapSwapProvider::new(
            SwapContext::new(registry.clone(), scheduler, locks.clone()),
            Arc::new(MockAmmChain::new()),
            deployment,
            Arc::new(BalanceSyncer::new(store.clone(), registry)),
        );
        let quote = Quote {
            provider: ProviderId::UniswapV2,
            from: "ETH".to_string(),
            to: "DAI".to_string(),
            from_amount: U256::exp10(18),
            to_amount: U256::from(1990u64) * U256::exp10(18),
            fee: None,
            from_account_id: "eth-1".to_string(),
            to_account_id: "eth-1".to_string(),
        };

        let send = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.send(request()).await }
        });
        while !locks.is_locked("mainnet-w1-ethereum") {
            tokio::task::yield_now().await;
        }

        let swap = tokio::spawn(async move { uniswap.new_swap(Network::Mainnet, "w1", &quote).await });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        // The send holds the lock inside its submission; the swap has not submitted
        assert!(wallet.sent().is_empty());
        assert!(!swap.is_finished());

        gate.add_permits(2);
        let sent = send.await.unwrap().unwrap();
        let swap = swap.await.unwrap().unwrap();

        assert_eq!(sent.hash, "0xtx1");
        assert_eq!(swap.swap_tx_hash.as_deref(), Some("0xtx2"));
        let submitted = wallet.sent();
        assert_eq!(submitted[0].to, request().to);
        assert_eq!(submitted[1].to, router);
        assert!(!locks.is_locked("mainnet-w1-ethereum"));
    }
}
