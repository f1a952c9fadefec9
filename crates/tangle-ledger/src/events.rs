//! Ledger events, routed through the same fan-out router as branch events.

use std::fmt;

use serde::{Deserialize, Serialize};

use tangle_branchdag::RoutedEvent;
use tangle_types::{BranchId, PayloadId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TangleEventKind {
    TransactionBooked,
    TransactionForked,
    TransactionInvalid,
    PayloadMissing,
}

impl fmt::Display for TangleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransactionBooked => "transaction_booked",
            Self::TransactionForked => "transaction_forked",
            Self::TransactionInvalid => "transaction_invalid",
            Self::PayloadMissing => "payload_missing",
        };
        write!(f, "{name}")
    }
}

/// Something the booking engine did to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TangleEvent {
    /// The transaction was assigned `branch`.
    TransactionBooked {
        transaction: TransactionId,
        branch: BranchId,
        decision_pending: bool,
    },
    /// A booked transaction was moved into its own conflict branch.
    TransactionForked {
        transaction: TransactionId,
        branch: BranchId,
    },
    /// The transaction can never be booked.
    TransactionInvalid {
        transaction: TransactionId,
        reason: String,
    },
    /// A payload was asked for that is not stored.
    PayloadMissing { payload: PayloadId },
}

impl TangleEvent {
    /// The transaction the event is about, if any.
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::TransactionBooked { transaction, .. }
            | Self::TransactionForked { transaction, .. }
            | Self::TransactionInvalid { transaction, .. } => Some(*transaction),
            Self::PayloadMissing { .. } => None,
        }
    }
}

impl RoutedEvent for TangleEvent {
    type Kind = TangleEventKind;

    fn kind(&self) -> TangleEventKind {
        match self {
            Self::TransactionBooked { .. } => TangleEventKind::TransactionBooked,
            Self::TransactionForked { .. } => TangleEventKind::TransactionForked,
            Self::TransactionInvalid { .. } => TangleEventKind::TransactionInvalid,
            Self::PayloadMissing { .. } => TangleEventKind::PayloadMissing,
        }
    }
}
