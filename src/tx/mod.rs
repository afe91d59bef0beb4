//! Transaction submission and SEND history records

mod orchestrator;

pub use orchestrator::{SendRequest, TransactionOrchestrator, TRANSACTION_STATUSES};
