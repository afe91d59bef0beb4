//! Swap Orchestrator - resumes pending swaps and sends, keeps balances fresh
//!
//! Loads the wallet state, wires chain clients and swap providers, picks up
//! every non-terminal history item, serves the HTTP API and periodically
//! syncs balances of all wallets until shut down.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use swap_orchestrator::api::{self, AppState};
use swap_orchestrator::assets::ChainId;
use swap_orchestrator::chain::{ChainClientFactory, ClientRegistry, HostProviders};
use swap_orchestrator::config::Settings;
use swap_orchestrator::coordination::{ActionDispatcher, AssetLockRegistry, RetryScheduler};
use swap_orchestrator::events::LogNotifier;
use swap_orchestrator::state::{InMemoryStore, WalletStore};
use swap_orchestrator::swaps::amm::{EthersAmmChain, UniswapDeployment};
use swap_orchestrator::swaps::bridge::{FastBtcBridge, HttpRelayTransport};
use swap_orchestrator::swaps::{FastBtcSwapProvider, SwapContext, UniswapSwapProvider};
use swap_orchestrator::{BalanceSyncer, TransactionOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains on {} network(s)",
        settings.chains.len(),
        settings.wallet.networks.len()
    );

    // Wallet state
    let store = Arc::new(InMemoryStore::open(&settings.wallet.state_path).await?);
    match std::env::var(&settings.wallet.mnemonic_env) {
        Ok(mnemonic) => {
            for wallet_id in store.wallet_ids().await {
                store.set_mnemonic(&wallet_id, mnemonic.clone());
            }
        }
        Err(_) => warn!(
            "{} is not set; only hardware accounts can be used",
            settings.wallet.mnemonic_env
        ),
    }

    // Hosts embedding the library register device and non-EVM wallet factories here
    let host = HostProviders::default();
    let bitcoin_wallets = host.has_software_wallet(ChainId::Bitcoin);

    // Shared services
    let factory = Arc::new(ChainClientFactory::new(settings.chains.clone(), host));
    let registry = Arc::new(ClientRegistry::new(factory, store.clone()));
    let locks = Arc::new(AssetLockRegistry::new());
    let scheduler = Arc::new(RetryScheduler::new(&settings.orchestrator));
    let balances = Arc::new(BalanceSyncer::new(store.clone(), registry.clone()));
    let notifier = Arc::new(LogNotifier);
    let ctx = SwapContext::new(registry.clone(), scheduler.clone(), locks.clone());

    // Swap providers
    let mut dispatcher = ActionDispatcher::new(store.clone(), registry.clone(), scheduler.clone(), notifier.clone());

    match settings.swaps.fastbtc.as_ref().filter(|c| c.enabled) {
        Some(_) if !bitcoin_wallets => {
            warn!("FastBTC disabled: no bitcoin wallet provider registered");
        }
        Some(config) => {
            let transport = Arc::new(HttpRelayTransport::new(reqwest::Client::new(), &config.bridge_endpoint));
            let bridge = FastBtcBridge::new(transport, config);
            dispatcher = dispatcher.with_provider(Arc::new(FastBtcSwapProvider::new(ctx.clone(), bridge)));
            info!("FastBTC provider enabled ({})", config.bridge_endpoint);
        }
        None => {}
    }

    if let Some(config) = settings.swaps.uniswap.as_ref().filter(|c| c.enabled) {
        let deployment = UniswapDeployment::from_config(config)?;
        let amm = Arc::new(EthersAmmChain::new(&settings)?);
        dispatcher = dispatcher.with_provider(Arc::new(UniswapSwapProvider::new(
            ctx.clone(),
            amm,
            deployment,
            balances.clone(),
        )));
        info!("Uniswap V2 provider enabled (router {})", config.router_address);
    }

    let dispatcher = Arc::new(dispatcher);

    let orchestrator = Arc::new(TransactionOrchestrator::new(
        store.clone(),
        registry.clone(),
        scheduler.clone(),
        locks.clone(),
        dispatcher.clone(),
        notifier.clone(),
    ));

    // Pick up everything left pending by a previous run
    let resumed = dispatcher.resume_pending(&settings.wallet.networks).await?;
    info!("Resumed {} pending item(s)", resumed);

    // Start API and metrics server
    let server_handle = if settings.server.enabled() {
        let config = settings.server.clone();
        let state = AppState {
            dispatcher: dispatcher.clone(),
            orchestrator,
            store: store.clone(),
        };
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Balance sync loop
    let sync_handle = tokio::spawn({
        let balances = balances.clone();
        let store = store.clone();
        let networks = settings.wallet.networks.clone();
        let interval = settings.orchestrator.balance_sync_interval_secs;
        async move {
            loop {
                for wallet_id in store.wallet_ids().await {
                    for network in &networks {
                        if let Err(e) = balances.sync(*network, &wallet_id, None).await {
                            warn!(wallet_id = %wallet_id, network = %network, "Balance sync failed: {}", e);
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
    });

    info!("Swap Orchestrator is running");
    if settings.server.api {
        info!("API: http://{}:{}", settings.server.host, settings.server.port);
    }
    if settings.server.metrics {
        info!("Metrics: http://{}:{}/metrics", settings.server.host, settings.server.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    sync_handle.abort();
    if let Some(h) = server_handle {
        h.abort();
    }

    info!("Swap Orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_orchestrator=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
