//! Per-transaction booking state and payload attachments.

use serde::{Deserialize, Serialize};

use tangle_store::StorableObject;
use tangle_types::{BranchId, PayloadId, TransactionId};

use crate::output::wall_clock_ms;

/// Booking state of a transaction.
///
/// The branch starts out undefined and is assigned once by booking. The only
/// later change is a move into a conflict branch created by a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub id: TransactionId,
    pub branch_id: BranchId,
    pub solid: bool,
    pub finalized: bool,
    /// Milliseconds since the UNIX epoch at which the transaction was booked.
    pub solidification_time: Option<u64>,
}

impl TransactionMetadata {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            branch_id: BranchId::UNDEFINED,
            solid: false,
            finalized: false,
            solidification_time: None,
        }
    }

    /// `true` once a branch has been assigned.
    pub fn is_booked(&self) -> bool {
        !self.branch_id.is_undefined()
    }

    /// Returns `false` if the branch was already `branch_id`.
    pub fn set_branch_id(&mut self, branch_id: BranchId) -> bool {
        if self.branch_id == branch_id {
            return false;
        }
        self.branch_id = branch_id;
        true
    }

    /// Returns `false` if the flag did not change.
    pub fn set_solid(&mut self, solid: bool) -> bool {
        if self.solid == solid {
            return false;
        }
        self.solid = solid;
        self.solidification_time = solid.then(wall_clock_ms);
        true
    }

    /// Returns `false` if the flag did not change.
    pub fn set_finalized(&mut self, finalized: bool) -> bool {
        if self.finalized == finalized {
            return false;
        }
        self.finalized = finalized;
        true
    }
}

impl StorableObject for TransactionMetadata {
    fn object_key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

/// Records that a transaction was carried by a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub transaction_id: TransactionId,
    pub payload_id: PayloadId,
}

impl StorableObject for Attachment {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(self.transaction_id.as_bytes());
        key.extend_from_slice(self.payload_id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metadata_is_unbooked() {
        let meta = TransactionMetadata::new(TransactionId::random());
        assert!(!meta.is_booked());
        assert!(!meta.solid);
        assert!(meta.solidification_time.is_none());
    }

    #[test]
    fn setters_report_changes() {
        let mut meta = TransactionMetadata::new(TransactionId::random());
        assert!(meta.set_branch_id(BranchId::MASTER));
        assert!(!meta.set_branch_id(BranchId::MASTER));
        assert!(meta.is_booked());

        assert!(meta.set_solid(true));
        assert!(meta.solidification_time.is_some());
        assert!(!meta.set_solid(true));

        assert!(meta.set_finalized(true));
        assert!(!meta.set_finalized(true));
    }

    #[test]
    fn attachment_key_is_transaction_then_payload() {
        let attachment = Attachment {
            transaction_id: TransactionId::from_hash([1; 32]),
            payload_id: PayloadId::from_hash([2; 32]),
        };
        let key = attachment.object_key();
        assert_eq!(&key[..32], &[1u8; 32][..]);
        assert_eq!(&key[32..], &[2u8; 32][..]);
    }
}
