//! Status metadata tables and transition rules

use super::history::{HistoryItem, Status};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::Notification;

use serde::Serialize;

/// Coarse grouping used by history filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterBucket {
    Pending,
    Completed,
    Refunded,
}

pub type NotificationFn = fn(&HistoryItem) -> Notification;

/// Description of one status of a state machine
#[derive(Clone, Copy)]
pub struct StatusMeta {
    pub status: Status,
    /// UI step index
    pub step: u8,
    /// Label with `{from}` / `{to}` placeholders
    pub label: &'static str,
    pub filter: FilterBucket,
    pub notification: Option<NotificationFn>,
}

/// Status metadata of one state machine
///
/// Entries are listed in transition order with the terminal states last:
/// a record may advance to the next entry or fall through to FAILED.
pub struct StatusTable {
    pub entries: &'static [StatusMeta],
    pub timeline_steps: &'static [&'static str],
    pub total_steps: u8,
}

impl StatusTable {
    pub fn meta(&self, status: Status) -> Option<&StatusMeta> {
        self.entries.iter().find(|m| m.status == status)
    }

    fn position(&self, status: Status) -> Option<usize> {
        self.entries.iter().position(|m| m.status == status)
    }

    pub fn label(&self, item: &HistoryItem) -> Option<String> {
        self.meta(item.status()).map(|m| {
            m.label
                .replace("{from}", item.from())
                .replace("{to}", item.to())
        })
    }

    /// Notification emitted when `item` enters its current status
    pub fn notification(&self, item: &HistoryItem) -> Option<Notification> {
        self.meta(item.status())
            .and_then(|m| m.notification)
            .map(|notify| notify(item))
    }

    /// Check that `to` is reachable from `from` in one step
    pub fn validate_transition(&self, from: Status, to: Status) -> OrchestratorResult<()> {
        if from == to {
            return Ok(());
        }

        let invalid = || OrchestratorError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        };

        if from.is_terminal() {
            return Err(invalid());
        }

        let current = self.position(from).ok_or_else(invalid)?;
        let target = self.position(to).ok_or_else(invalid)?;

        if to == Status::Failed || target == current + 1 {
            Ok(())
        } else {
            Err(invalid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: StatusTable = StatusTable {
        entries: &[
            StatusMeta {
                status: Status::WaitingForApproveConfirmations,
                step: 0,
                label: "Approving {from}",
                filter: FilterBucket::Pending,
                notification: None,
            },
            StatusMeta {
                status: Status::ApproveConfirmed,
                step: 1,
                label: "Swapping {from}",
                filter: FilterBucket::Pending,
                notification: None,
            },
            StatusMeta {
                status: Status::WaitingForSwapConfirmations,
                step: 1,
                label: "Swapping {from}",
                filter: FilterBucket::Pending,
                notification: None,
            },
            StatusMeta {
                status: Status::Success,
                step: 2,
                label: "Completed",
                filter: FilterBucket::Completed,
                notification: None,
            },
            StatusMeta {
                status: Status::Failed,
                step: 2,
                label: "Swap Failed",
                filter: FilterBucket::Refunded,
                notification: None,
            },
        ],
        timeline_steps: &["Approve", "Swap"],
        total_steps: 3,
    };

    #[test]
    fn test_forward_transitions_only() {
        assert!(TABLE
            .validate_transition(Status::WaitingForApproveConfirmations, Status::ApproveConfirmed)
            .is_ok());
        assert!(TABLE
            .validate_transition(Status::WaitingForSwapConfirmations, Status::Success)
            .is_ok());
        assert!(TABLE
            .validate_transition(Status::ApproveConfirmed, Status::WaitingForApproveConfirmations)
            .is_err());
        assert!(TABLE
            .validate_transition(Status::WaitingForApproveConfirmations, Status::Success)
            .is_err());
    }

    #[test]
    fn test_failed_is_reachable_from_any_pending_state() {
        assert!(TABLE
            .validate_transition(Status::WaitingForApproveConfirmations, Status::Failed)
            .is_ok());
        assert!(TABLE.validate_transition(Status::Success, Status::Failed).is_err());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = TABLE
            .validate_transition(Status::WaitingForReceive, Status::Success)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));
    }
}
