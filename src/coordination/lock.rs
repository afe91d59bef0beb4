//! Chain-level mutual exclusion for mutating wallet operations

use crate::assets::{chain_of, Network};
use crate::error::OrchestratorResult;
use crate::metrics;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

const UNLOCK_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a non-blocking lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAttempt {
    pub key: String,
    pub success: bool,
}

/// Lock key for an asset: `${network}-${walletId}-${chain}`
pub fn lock_key(network: Network, wallet_id: &str, asset: &str) -> OrchestratorResult<String> {
    let chain = chain_of(asset)?;
    Ok([network.as_str(), wallet_id, chain.as_str()].join("-"))
}

fn unlock_event(key: &str) -> String {
    format!("unlock:{}", key)
}

/// Per (network, wallet, chain) held flags plus unlock notifications
pub struct AssetLockRegistry {
    held: DashMap<String, ()>,
    unlocks: broadcast::Sender<String>,
}

impl AssetLockRegistry {
    pub fn new() -> Self {
        let (unlocks, _) = broadcast::channel(UNLOCK_CHANNEL_CAPACITY);
        Self {
            held: DashMap::new(),
            unlocks,
        }
    }

    /// Take the lock for the asset's chain without waiting
    pub fn try_lock(&self, network: Network, wallet_id: &str, asset: &str) -> OrchestratorResult<LockAttempt> {
        let key = lock_key(network, wallet_id, asset)?;
        let success = match self.held.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        };

        if success {
            debug!(key = %key, "Lock acquired");
        } else {
            debug!(key = %key, "Lock busy");
            if let Some(chain) = key.rsplit('-').next() {
                metrics::record_lock_contention(chain);
            }
        }

        Ok(LockAttempt { key, success })
    }

    /// Release `key` and wake its waiters
    pub fn unlock(&self, key: &str) {
        self.held.remove(key);
        // No receivers is fine
        let _ = self.unlocks.send(unlock_event(key));
        debug!(key = %key, "Lock released");
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Subscribe before calling `try_lock` so no unlock is missed in between
    pub fn subscribe(&self) -> UnlockListener {
        UnlockListener {
            events: self.unlocks.subscribe(),
        }
    }
}

impl Default for AssetLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UnlockListener {
    events: broadcast::Receiver<String>,
}

impl UnlockListener {
    /// Resolve on the next unlock of exactly `key`
    pub async fn wait_for(&mut self, key: &str) {
        let expected = unlock_event(key);
        loop {
            match self.events.recv().await {
                Ok(event) if event == expected => return,
                Ok(_) => continue,
                // Missed events may include ours; let the caller retry
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Releases the lock when dropped
pub struct LockGuard<'a> {
    locks: &'a AssetLockRegistry,
    key: String,
}

impl<'a> LockGuard<'a> {
    pub fn new(locks: &'a AssetLockRegistry, key: String) -> Self {
        Self { locks, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.key);
    }
}
