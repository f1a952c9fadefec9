//! Outputs and the consumers spending them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use tangle_store::StorableObject;
use tangle_types::{Address, Balance, BranchId, OutputId, TransactionId};

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Balances held by one address, created by one transaction (or the
/// snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub transaction_id: TransactionId,
    /// The ledger state this output belongs to.
    pub branch_id: BranchId,
    pub solid: bool,
    /// Milliseconds since the UNIX epoch at which the output became solid.
    pub solidification_time: Option<u64>,
    /// Number of transactions that have been booked spending this output.
    pub consumer_count: u32,
    pub first_consumer: Option<TransactionId>,
    pub balances: Vec<Balance>,
}

impl Output {
    pub fn new(
        address: Address,
        transaction_id: TransactionId,
        branch_id: BranchId,
        balances: Vec<Balance>,
    ) -> Self {
        Self {
            address,
            transaction_id,
            branch_id,
            solid: false,
            solidification_time: None,
            consumer_count: 0,
            first_consumer: None,
            balances,
        }
    }

    pub fn id(&self) -> OutputId {
        OutputId::new(self.address, self.transaction_id)
    }

    /// Mark the output solid. Returns `false` if it already was.
    pub fn set_solid(&mut self) -> bool {
        if self.solid {
            return false;
        }
        self.solid = true;
        self.solidification_time = Some(wall_clock_ms());
        true
    }

    /// Record a booked spend by `consumer`.
    ///
    /// Returns the number of consumers registered before this one, and the
    /// first consumer (which is `consumer` itself on the first spend).
    pub fn register_consumer(&mut self, consumer: TransactionId) -> (u32, TransactionId) {
        let previous = self.consumer_count;
        let first = *self.first_consumer.get_or_insert(consumer);
        self.consumer_count += 1;
        (previous, first)
    }
}

impl StorableObject for Output {
    fn object_key(&self) -> Vec<u8> {
        self.id().to_bytes().to_vec()
    }
}

/// A transaction referencing an output as one of its inputs. Stored when
/// the transaction is stored, before it is booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Consumer {
    pub consumed_input: OutputId,
    pub transaction_id: TransactionId,
}

impl StorableObject for Consumer {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(OutputId::LENGTH + 32);
        key.extend_from_slice(&self.consumed_input.to_bytes());
        key.extend_from_slice(self.transaction_id.as_bytes());
        key
    }
}
