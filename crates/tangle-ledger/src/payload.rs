//! Value payloads: the tangle vertices that carry transactions.

use serde::{Deserialize, Serialize};

use tangle_store::StorableObject;
use tangle_types::{BranchId, PayloadId, TransactionId};

use crate::output::wall_clock_ms;
use crate::transaction::Transaction;

/// A transaction attached to the tangle below two parent payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    id: PayloadId,
    parent1: PayloadId,
    parent2: PayloadId,
    transaction: Transaction,
}

impl Payload {
    pub fn new(parent1: PayloadId, parent2: PayloadId, transaction: Transaction) -> Self {
        let mut essence = Vec::with_capacity(96);
        essence.extend_from_slice(parent1.as_bytes());
        essence.extend_from_slice(parent2.as_bytes());
        essence.extend_from_slice(transaction.id().as_bytes());
        Self {
            id: PayloadId::from_essence(&essence),
            parent1,
            parent2,
            transaction,
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    pub fn parent1(&self) -> PayloadId {
        self.parent1
    }

    pub fn parent2(&self) -> PayloadId {
        self.parent2
    }

    /// Both parents; equal parents are reported once.
    pub fn parents(&self) -> impl Iterator<Item = PayloadId> {
        let second = (self.parent2 != self.parent1).then_some(self.parent2);
        std::iter::once(self.parent1).chain(second)
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }
}

impl StorableObject for Payload {
    fn object_key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

/// Solidity and branch of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub payload_id: PayloadId,
    pub branch_id: BranchId,
    pub solid: bool,
    pub solidification_time: Option<u64>,
}

impl PayloadMetadata {
    pub fn new(payload_id: PayloadId) -> Self {
        Self {
            payload_id,
            branch_id: BranchId::UNDEFINED,
            solid: false,
            solidification_time: None,
        }
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
}

impl StorableObject for PayloadMetadata {
    fn object_key(&self) -> Vec<u8> {
        self.payload_id.as_bytes().to_vec()
    }
}

/// Reverse reference: `approving` lists `referenced` as a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadApprover {
    pub referenced_payload_id: PayloadId,
    pub approving_payload_id: PayloadId,
}

impl StorableObject for PayloadApprover {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(self.referenced_payload_id.as_bytes());
        key.extend_from_slice(self.approving_payload_id.as_bytes());
        key
    }
}
