//! Coordination of wallet operations
//!
//! - `lock`: per (network, wallet, chain) mutual exclusion for submissions
//! - `retry`: randomised polling and lock-retry scheduling
//! - `dispatcher`: drives every pending history item to a terminal status

pub mod dispatcher;
pub mod lock;
pub mod retry;

pub use dispatcher::ActionDispatcher;
pub use lock::{lock_key, AssetLockRegistry, LockAttempt, LockGuard};
pub use retry::{Clock, RetryScheduler, Sleeper, SystemClock, TokioSleeper};
