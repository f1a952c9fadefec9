//! The ledger context: branch DAG, UTXO index and event router behind one
//! handle.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use tangle_branchdag::{Branch, BranchDag, EventFilter, EventRouter, EventStream};
use tangle_store::{CachedObject, KvStore, StorableObject};
use tangle_types::{Address, BranchId, BranchIds, ConflictId, OutputId, PayloadId, TransactionId};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::events::{TangleEvent, TangleEventKind};
use crate::metadata::{Attachment, TransactionMetadata};
use crate::output::{Consumer, Output};
use crate::payload::{Payload, PayloadApprover, PayloadMetadata};
use crate::transaction::Transaction;
use crate::utxo::{Snapshot, UtxoIndex};

/// Handles returned by [`Tangle::store_transaction`].
pub struct StoredTransaction {
    pub transaction: CachedObject<Transaction>,
    pub metadata: CachedObject<TransactionMetadata>,
    /// `None` if this payload was already recorded for the transaction.
    pub attachment: Option<CachedObject<Attachment>>,
    /// `true` if the transaction was not stored before.
    pub is_new: bool,
}

/// The value tangle.
///
/// Constructed once per backend and shared by reference. Booking, forking
/// and finalization of transactions are serialized by one booking lock;
/// branch DAG mutations are serialized by the DAG's own lock, which is
/// always acquired after the booking lock.
pub struct Tangle {
    pub(crate) config: LedgerConfig,
    pub(crate) branch_dag: BranchDag,
    pub(crate) utxo: UtxoIndex,
    pub(crate) events: EventRouter<TangleEvent>,
    booking: Mutex<()>,
}

impl Tangle {
    /// Open the tangle on `backend`.
    pub fn new(backend: Arc<dyn KvStore>, config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        let branch_dag = BranchDag::new(backend.clone(), &config.branch_dag)?;
        let tangle = Self {
            events: EventRouter::new(config.event_channel_capacity),
            utxo: UtxoIndex::new(backend),
            branch_dag,
            config,
            booking: Mutex::new(()),
        };
        debug!("tangle opened");
        Ok(tangle)
    }

    pub(crate) fn lock(&self) -> LedgerResult<MutexGuard<'_, ()>> {
        self.booking.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn branch_dag(&self) -> &BranchDag {
        &self.branch_dag
    }

    pub fn utxo(&self) -> &UtxoIndex {
        &self.utxo
    }

    /// Subscribe to ledger events.
    pub fn subscribe(&self, filter: EventFilter<TangleEventKind>) -> EventStream<TangleEvent> {
        self.events.subscribe(filter)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn transaction(&self, id: &TransactionId) -> LedgerResult<Option<CachedObject<Transaction>>> {
        self.utxo.transaction(id)
    }

    pub fn transaction_metadata(
        &self,
        id: &TransactionId,
    ) -> LedgerResult<Option<CachedObject<TransactionMetadata>>> {
        self.utxo.transaction_metadata(id)
    }

    pub fn output(&self, id: &OutputId) -> LedgerResult<Option<CachedObject<Output>>> {
        self.utxo.output(id)
    }

    pub fn outputs_on_address(&self, address: &Address) -> LedgerResult<Vec<CachedObject<Output>>> {
        self.utxo.outputs_on_address(address)
    }

    pub fn consumers(&self, output: &OutputId) -> LedgerResult<Vec<Consumer>> {
        self.utxo.consumers(output)
    }

    pub fn attachments(&self, transaction: &TransactionId) -> LedgerResult<Vec<Attachment>> {
        self.utxo.attachments(transaction)
    }

    pub fn payload(&self, id: &PayloadId) -> LedgerResult<Option<CachedObject<Payload>>> {
        self.utxo.payload(id)
    }

    pub fn payload_metadata(&self, id: &PayloadId) -> LedgerResult<Option<CachedObject<PayloadMetadata>>> {
        self.utxo.payload_metadata(id)
    }

    pub fn approvers(&self, payload: &PayloadId) -> LedgerResult<Vec<PayloadApprover>> {
        self.utxo.approvers(payload)
    }

    /// Branch a payload was booked into.
    ///
    /// The genesis payload lives in the master branch. An unknown payload
    /// yields [`BranchId::UNDEFINED`] and raises
    /// [`TangleEvent::PayloadMissing`].
    pub fn payload_branch_id(&self, id: &PayloadId) -> LedgerResult<BranchId> {
        if *id == PayloadId::GENESIS {
            return Ok(BranchId::MASTER);
        }
        if let Some(metadata) = self.utxo.payload_metadata(id)? {
            let branch_id = metadata.read().branch_id;
            return Ok(branch_id);
        }
        debug!(payload = %id.short_hex(), "payload missing");
        self.events.route(&TangleEvent::PayloadMissing { payload: *id });
        Ok(BranchId::UNDEFINED)
    }

    pub fn branch(&self, id: &BranchId) -> LedgerResult<Option<CachedObject<Branch>>> {
        Ok(self.branch_dag.branch(id)?)
    }

    pub fn conflict_members(&self, conflict: &ConflictId) -> LedgerResult<BranchIds> {
        Ok(self.branch_dag.conflict_members(conflict)?)
    }

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------

    /// Seed the ledger with solid outputs in the master branch.
    pub fn load_snapshot(&self, snapshot: &Snapshot) -> LedgerResult<usize> {
        self.utxo
            .load_snapshot(snapshot, self.config.reject_duplicate_snapshot_outputs)
    }

    /// Store a payload and fresh metadata for it. Returns `None` if the
    /// payload was stored before.
    pub fn store_payload(
        &self,
        payload: Payload,
    ) -> LedgerResult<Option<(CachedObject<Payload>, CachedObject<PayloadMetadata>)>> {
        let id = payload.id();
        let Some(stored) = self.utxo.payloads.store_if_absent(payload)? else {
            return Ok(None);
        };
        let (metadata, _) = self
            .utxo
            .payload_metadata
            .compute_if_absent(id.as_bytes(), || PayloadMetadata::new(id))?;
        debug!(payload = %id.short_hex(), "payload stored");
        Ok(Some((stored, metadata)))
    }

    /// Record `payload` as an approver of each of its parents.
    pub fn store_payload_references(&self, payload: &Payload) -> LedgerResult<()> {
        for parent in payload.parents() {
            self.utxo.approvers.store_if_absent(PayloadApprover {
                referenced_payload_id: parent,
                approving_payload_id: payload.id(),
            })?;
        }
        Ok(())
    }

    /// Store a payload, its parent references and the transaction it
    /// carries. Returns `None` if the payload was already attached.
    pub fn attach_payload(&self, payload: Payload) -> LedgerResult<Option<StoredTransaction>> {
        let Some((stored, _)) = self.store_payload(payload)? else {
            return Ok(None);
        };
        let (payload_id, transaction) = {
            let payload = stored.read();
            self.store_payload_references(&payload)?;
            (payload.id(), payload.transaction().clone())
        };
        Ok(Some(self.store_transaction(transaction, payload_id)?))
    }

    /// Store a transaction received in `payload`, together with its
    /// metadata, the attachment and a consumer record per input.
    pub fn store_transaction(
        &self,
        transaction: Transaction,
        payload: PayloadId,
    ) -> LedgerResult<StoredTransaction> {
        let id = transaction.id();
        let inputs = transaction.inputs().to_vec();

        let (transaction, is_new) = self
            .utxo
            .transactions
            .compute_if_absent(id.as_bytes(), || transaction)?;
        let (metadata, _) = self
            .utxo
            .metadata
            .compute_if_absent(id.as_bytes(), || TransactionMetadata::new(id))?;
        let attachment = self.utxo.attachments.store_if_absent(Attachment {
            transaction_id: id,
            payload_id: payload,
        })?;

        if is_new {
            for input in inputs {
                self.utxo.consumers.store_if_absent(Consumer {
                    consumed_input: input,
                    transaction_id: id,
                })?;
            }
            debug!(transaction = %id.short_hex(), payload = %payload.short_hex(), "transaction stored");
        }

        Ok(StoredTransaction {
            transaction,
            metadata,
            attachment,
            is_new,
        })
    }

    /// Remove a transaction, its metadata, its attachments and the consumer
    /// records of its inputs. Outputs it already produced stay. Handles still
    /// held observe [`CachedObject::is_deleted`].
    pub fn delete_transaction(&self, id: &TransactionId) -> LedgerResult<bool> {
        let Some(transaction) = self.utxo.transaction(id)? else {
            return Ok(false);
        };
        let inputs = transaction.read().inputs().to_vec();
        drop(transaction);

        for input in inputs {
            let consumer = Consumer {
                consumed_input: input,
                transaction_id: *id,
            };
            self.utxo.consumers.delete(&consumer.object_key())?;
        }
        for attachment in self.utxo.attachments(id)? {
            self.utxo.attachments.delete(&attachment.object_key())?;
        }
        self.utxo.metadata.delete(id.as_bytes())?;
        self.utxo.transactions.delete(id.as_bytes())?;
        info!(transaction = %id.short_hex(), "transaction deleted");
        Ok(true)
    }

    /// Record the voting layer's final decision on a transaction. Finalized
    /// transactions are never moved into a conflict branch.
    pub fn set_transaction_finalized(&self, id: &TransactionId, finalized: bool) -> LedgerResult<bool> {
        let _guard = self.lock()?;
        let metadata = self
            .utxo
            .transaction_metadata(id)?
            .ok_or(LedgerError::MetadataNotFound(*id))?;
        let modified = metadata.write().set_finalized(finalized);
        if modified {
            debug!(transaction = %id.short_hex(), finalized, "transaction finality changed");
        }
        Ok(modified)
    }

    /// Persist every cached entity.
    pub fn shutdown(&self) -> LedgerResult<()> {
        let _guard = self.lock()?;
        self.utxo.flush()?;
        self.branch_dag.shutdown()?;
        info!("tangle shut down");
        Ok(())
    }
}
