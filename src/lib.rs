//! Swap Orchestrator - multi-chain wallet swaps and native transfers
//!
//! Builds chain clients per wallet account, serialises submissions per
//! chain, drives cross-chain swap state machines (FastBTC bridge, Uniswap
//! V2) until they reach a terminal status and keeps account balances in
//! sync with the chains.

pub mod api;
pub mod assets;
pub mod balance;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod swaps;
pub mod tx;

pub use balance::BalanceSyncer;
pub use chain::{ChainClientFactory, ClientRegistry};
pub use config::Settings;
pub use coordination::{ActionDispatcher, AssetLockRegistry, RetryScheduler};
pub use error::{OrchestratorError, OrchestratorResult};
pub use swaps::{SwapContext, SwapProvider};
pub use tx::{SendRequest, TransactionOrchestrator};
