//! UTXO index: transactions, their metadata, outputs, consumers,
//! attachments and the payloads carrying them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use tangle_store::{CachedObject, KvStore, ObjectStorage};
use tangle_types::{Address, BranchId, OutputId, PayloadId, TransactionId};

use crate::error::{LedgerError, LedgerResult};
use crate::metadata::{Attachment, TransactionMetadata};
use crate::output::{Consumer, Output};
use crate::payload::{Payload, PayloadApprover, PayloadMetadata};
use crate::transaction::{Outputs, Transaction};

pub const TRANSACTION_REALM: &[u8] = &[0x20];
pub const TRANSACTION_METADATA_REALM: &[u8] = &[0x21];
/// Keyed by [`OutputId`], so outputs of one address share a prefix.
pub const OUTPUT_REALM: &[u8] = &[0x22];
/// Keyed `output || transaction`.
pub const CONSUMER_REALM: &[u8] = &[0x23];
/// Keyed `transaction || payload`.
pub const ATTACHMENT_REALM: &[u8] = &[0x24];
pub const PAYLOAD_REALM: &[u8] = &[0x25];
pub const PAYLOAD_METADATA_REALM: &[u8] = &[0x26];
/// Keyed `referenced || approving`.
pub const APPROVER_REALM: &[u8] = &[0x27];

/// Initial ledger state: balances per address, grouped by the id of the
/// (pseudo) transaction that created them.
pub type Snapshot = BTreeMap<TransactionId, Outputs>;

/// Typed storages of the ledger entities.
pub struct UtxoIndex {
    pub(crate) transactions: ObjectStorage<Transaction>,
    pub(crate) metadata: ObjectStorage<TransactionMetadata>,
    pub(crate) outputs: ObjectStorage<Output>,
    pub(crate) consumers: ObjectStorage<Consumer>,
    pub(crate) attachments: ObjectStorage<Attachment>,
    pub(crate) payloads: ObjectStorage<Payload>,
    pub(crate) payload_metadata: ObjectStorage<PayloadMetadata>,
    pub(crate) approvers: ObjectStorage<PayloadApprover>,
}

impl UtxoIndex {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            transactions: ObjectStorage::new(backend.clone(), TRANSACTION_REALM),
            metadata: ObjectStorage::new(backend.clone(), TRANSACTION_METADATA_REALM),
            outputs: ObjectStorage::new(backend.clone(), OUTPUT_REALM),
            consumers: ObjectStorage::new(backend.clone(), CONSUMER_REALM),
            attachments: ObjectStorage::new(backend.clone(), ATTACHMENT_REALM),
            payloads: ObjectStorage::new(backend.clone(), PAYLOAD_REALM),
            payload_metadata: ObjectStorage::new(backend.clone(), PAYLOAD_METADATA_REALM),
            approvers: ObjectStorage::new(backend, APPROVER_REALM),
        }
    }

    pub fn transaction(&self, id: &TransactionId) -> LedgerResult<Option<CachedObject<Transaction>>> {
        Ok(self.transactions.load(id.as_bytes())?)
    }

    pub fn transaction_metadata(
        &self,
        id: &TransactionId,
    ) -> LedgerResult<Option<CachedObject<TransactionMetadata>>> {
        Ok(self.metadata.load(id.as_bytes())?)
    }

    pub fn output(&self, id: &OutputId) -> LedgerResult<Option<CachedObject<Output>>> {
        Ok(self.outputs.load(&id.to_bytes())?)
    }

    /// Outputs held by `address`, across all transactions.
    pub fn outputs_on_address(&self, address: &Address) -> LedgerResult<Vec<CachedObject<Output>>> {
        Ok(self.outputs.load_with_prefix(address.as_bytes())?)
    }

    /// Transactions that declare `output` as an input.
    pub fn consumers(&self, output: &OutputId) -> LedgerResult<Vec<Consumer>> {
        let consumers = self.consumers.load_with_prefix(&output.to_bytes())?;
        Ok(consumers.iter().map(|consumer| *consumer.read()).collect())
    }

    /// Payloads that carried `transaction`.
    pub fn attachments(&self, transaction: &TransactionId) -> LedgerResult<Vec<Attachment>> {
        let attachments = self.attachments.load_with_prefix(transaction.as_bytes())?;
        Ok(attachments.iter().map(|attachment| *attachment.read()).collect())
    }

    pub fn payload(&self, id: &PayloadId) -> LedgerResult<Option<CachedObject<Payload>>> {
        Ok(self.payloads.load(id.as_bytes())?)
    }

    pub fn payload_metadata(&self, id: &PayloadId) -> LedgerResult<Option<CachedObject<PayloadMetadata>>> {
        Ok(self.payload_metadata.load(id.as_bytes())?)
    }

    /// Payloads that list `payload` as a parent.
    pub fn approvers(&self, payload: &PayloadId) -> LedgerResult<Vec<PayloadApprover>> {
        let approvers = self.approvers.load_with_prefix(payload.as_bytes())?;
        Ok(approvers.iter().map(|approver| *approver.read()).collect())
    }

    /// Store `output` unless its id is taken. Returns `None` if it was.
    pub fn store_output_if_absent(&self, output: Output) -> LedgerResult<Option<CachedObject<Output>>> {
        Ok(self.outputs.store_if_absent(output)?)
    }

    /// Seed the ledger with solid outputs in the master branch.
    ///
    /// With `reject_duplicates`, an output id that is already stored fails
    /// the load; outputs stored before the duplicate stay stored. Otherwise
    /// duplicates are skipped. Returns the number of outputs created.
    pub fn load_snapshot(&self, snapshot: &Snapshot, reject_duplicates: bool) -> LedgerResult<usize> {
        let mut created = 0;
        for (transaction_id, outputs) in snapshot {
            for (address, balances) in outputs {
                let mut output =
                    Output::new(*address, *transaction_id, BranchId::MASTER, balances.clone());
                output.set_solid();
                let id = output.id();
                match self.outputs.store_if_absent(output)? {
                    Some(_) => created += 1,
                    None if reject_duplicates => {
                        return Err(LedgerError::DuplicateSnapshotOutput(id));
                    }
                    None => {}
                }
            }
        }
        info!(outputs = created, "snapshot loaded");
        Ok(created)
    }

    pub fn flush(&self) -> LedgerResult<()> {
        self.transactions.flush()?;
        self.metadata.flush()?;
        self.outputs.flush()?;
        self.consumers.flush()?;
        self.attachments.flush()?;
        self.payloads.flush()?;
        self.payload_metadata.flush()?;
        self.approvers.flush()?;
        Ok(())
    }
}
