//! Booking: solidity and value checks, branch assignment and forking of
//! double spends.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use tangle_store::CachedObject;
use tangle_types::{Balance, BranchId, BranchIds, Color, ConflictId, ConflictIds, OutputId, TransactionId};

use crate::error::{LedgerError, LedgerResult};
use crate::events::TangleEvent;
use crate::metadata::TransactionMetadata;
use crate::output::Output;
use crate::tangle::Tangle;
use crate::transaction::{Outputs, Transaction};

/// Result of [`Tangle::book_transaction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingOutcome {
    /// The transaction was assigned a branch by this call.
    pub booked: bool,
    /// The transaction double spends; the voting layer has to pick a branch.
    pub decision_pending: bool,
}

/// Result of [`Tangle::fork`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkOutcome {
    /// A conflict branch was created and the transaction moved into it.
    pub forked: bool,
    /// The transaction is finalized and was left where it is.
    pub finalized: bool,
}

/// What a transaction consumes.
pub struct ConsumedInputs {
    /// Every input resolved to a stored, solid output.
    pub solid: bool,
    /// The resolved outputs, in input order. Missing inputs are skipped.
    pub outputs: Vec<CachedObject<Output>>,
    /// Consumed value per color.
    pub balances: BTreeMap<Color, i64>,
    /// Distinct branches of the resolved outputs.
    pub branches: BranchIds,
}

/// Check that `outputs` spend exactly the `consumed` balances.
///
/// Explicitly colored outputs draw from the consumed balance of their color.
/// Whatever is left over, of any color, has to equal the sum of the `IOTA`
/// and `NEW` outputs. Non-positive output values and overflowing sums make
/// the check fail.
pub fn check_transaction_outputs(consumed: &BTreeMap<Color, i64>, outputs: &Outputs) -> bool {
    let mut available = consumed.clone();
    let mut newly_colored: i64 = 0;
    let mut uncolored: i64 = 0;

    for balance in outputs.values().flatten() {
        if balance.value <= 0 {
            return false;
        }

        let pool = if balance.color.is_new() {
            &mut newly_colored
        } else if balance.color.is_iota() {
            &mut uncolored
        } else {
            let Some(left) = available.get_mut(&balance.color) else {
                return false;
            };
            if *left < balance.value {
                return false;
            }
            *left -= balance.value;
            if *left == 0 {
                available.remove(&balance.color);
            }
            continue;
        };
        match pool.checked_add(balance.value) {
            Some(sum) => *pool = sum,
            None => return false,
        }
    }

    let mut unspent: i64 = 0;
    for value in available.values() {
        match unspent.checked_add(*value) {
            Some(sum) => unspent = sum,
            None => return false,
        }
    }
    newly_colored.checked_add(uncolored) == Some(unspent)
}

/// Replace the `NEW` color by the color minted by `transaction` and merge
/// balances of equal color.
fn mint(transaction: TransactionId, balances: &[Balance]) -> Vec<Balance> {
    let mut merged: BTreeMap<Color, i64> = BTreeMap::new();
    for balance in balances {
        let color = if balance.color.is_new() {
            Color::from(transaction)
        } else {
            balance.color
        };
        let value = merged.entry(color).or_default();
        *value = value.saturating_add(balance.value);
    }
    merged
        .into_iter()
        .map(|(color, value)| Balance::new(color, value))
        .collect()
}

impl Tangle {
    /// Resolve the inputs of `transaction` to stored outputs. Missing
    /// outputs are left out.
    pub fn get_cached_outputs_from_transaction_inputs(
        &self,
        transaction: &Transaction,
    ) -> LedgerResult<Vec<CachedObject<Output>>> {
        let mut outputs = Vec::with_capacity(transaction.inputs().len());
        for input in transaction.inputs() {
            if let Some(output) = self.utxo.output(input)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    /// Sum up what `transaction` consumes.
    ///
    /// Fails with [`LedgerError::DuplicateInput`] if an output is listed
    /// twice, and with [`LedgerError::BalanceOverflow`] if the consumed value
    /// of one color does not fit into an `i64`.
    pub fn retrieve_consumed_input_details(
        &self,
        transaction: &Transaction,
    ) -> LedgerResult<ConsumedInputs> {
        if let Some(input) = transaction.duplicate_input() {
            return Err(LedgerError::DuplicateInput {
                transaction: transaction.id(),
                input,
            });
        }
        let outputs = self.get_cached_outputs_from_transaction_inputs(transaction)?;
        let mut solid = outputs.len() == transaction.inputs().len();
        let mut balances: BTreeMap<Color, i64> = BTreeMap::new();
        let mut branches = BranchIds::new();

        for output in &outputs {
            let output = output.read();
            solid &= output.solid;
            branches.insert(output.branch_id);
            for balance in &output.balances {
                let sum = balances.entry(balance.color).or_default();
                *sum = sum
                    .checked_add(balance.value)
                    .ok_or(LedgerError::BalanceOverflow(transaction.id()))?;
            }
        }

        Ok(ConsumedInputs {
            solid,
            outputs,
            balances,
            branches,
        })
    }

    /// Decide whether the transaction can be booked.
    ///
    /// Returns `(false, {})` while inputs are missing or not solid, or if the
    /// transaction was deleted. A transaction that was already booked reports
    /// its branch. Otherwise the value balance is checked and the branches of
    /// the consumed outputs are normalized.
    pub fn check_transaction_solidity(
        &self,
        transaction: &CachedObject<Transaction>,
        metadata: &CachedObject<TransactionMetadata>,
    ) -> LedgerResult<(bool, BranchIds)> {
        if transaction.is_deleted() || metadata.is_deleted() {
            return Ok((false, BranchIds::new()));
        }
        {
            let metadata = metadata.read();
            if metadata.solid {
                return Ok((true, [metadata.branch_id].into_iter().collect()));
            }
        }

        let transaction = transaction.read();
        let id = transaction.id();
        let consumed = self.retrieve_consumed_input_details(&transaction)?;
        if !consumed.solid {
            return Ok((false, BranchIds::new()));
        }
        if !check_transaction_outputs(&consumed.balances, transaction.outputs()) {
            return Err(LedgerError::OutputsDoNotMatchInputs(id));
        }

        match self.branch_dag.normalize_branches(&consumed.branches) {
            Ok(normalized) => Ok((true, normalized)),
            Err(source) if source.is_conflict() => Err(LedgerError::ConflictingInputBranches {
                transaction: id,
                branches: consumed.branches,
                source,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Book a stored transaction by id.
    pub fn book(&self, id: &TransactionId) -> LedgerResult<BookingOutcome> {
        let transaction = self
            .utxo
            .transaction(id)?
            .ok_or(LedgerError::TransactionNotFound(*id))?;
        let metadata = self
            .utxo
            .transaction_metadata(id)?
            .ok_or(LedgerError::MetadataNotFound(*id))?;
        self.book_transaction(&transaction, &metadata)
    }

    /// Assign the transaction to a branch.
    ///
    /// A first spend of every input joins the (aggregated) branch of its
    /// inputs. A double spend gets its own conflict branch, and the
    /// transactions that spent the contested outputs first are forked into
    /// theirs. Already booked transactions return the default outcome, as
    /// do transactions whose inputs are not solid yet.
    pub fn book_transaction(
        &self,
        transaction: &CachedObject<Transaction>,
        metadata: &CachedObject<TransactionMetadata>,
    ) -> LedgerResult<BookingOutcome> {
        let id = transaction.read().id();
        let mut events = Vec::new();

        let guard = self.lock()?;
        let result = self.book_locked(transaction, metadata, &mut events);
        drop(guard);

        if let Err(err) = &result {
            if err.is_invalid_transaction() {
                warn!(transaction = %id.short_hex(), error = %err, "transaction invalid");
                events.push(TangleEvent::TransactionInvalid {
                    transaction: id,
                    reason: err.to_string(),
                });
            }
        }
        self.events.route_all(&events);
        result
    }

    fn book_locked(
        &self,
        cached: &CachedObject<Transaction>,
        metadata: &CachedObject<TransactionMetadata>,
        events: &mut Vec<TangleEvent>,
    ) -> LedgerResult<BookingOutcome> {
        {
            let metadata = metadata.read();
            if metadata.solid || metadata.is_booked() {
                return Ok(BookingOutcome::default());
            }
        }
        if cached.is_deleted() {
            return Ok(BookingOutcome::default());
        }

        let transaction = cached.snapshot();
        let id = transaction.id();
        if let Some(input) = transaction.duplicate_input() {
            return Err(LedgerError::DuplicateInput { transaction: id, input });
        }
        let outputs = self.get_cached_outputs_from_transaction_inputs(&transaction)?;
        if outputs.len() != transaction.inputs().len() {
            let found: Vec<OutputId> = outputs.iter().map(|output| output.read().id()).collect();
            let missing = transaction
                .inputs()
                .iter()
                .filter(|input| !found.contains(*input))
                .copied()
                .collect();
            return Err(LedgerError::MissingInputs {
                transaction: id,
                missing,
            });
        }

        let (solid, branches) = self.check_transaction_solidity(cached, metadata)?;
        if !solid {
            return Ok(BookingOutcome::default());
        }

        let mut conflicting_inputs = Vec::new();
        let mut first_consumers: BTreeMap<TransactionId, Vec<OutputId>> = BTreeMap::new();
        for output in &outputs {
            let output = output.read();
            match (output.consumer_count, output.first_consumer) {
                (0, _) => {}
                (1, Some(first)) => {
                    first_consumers.entry(first).or_default().push(output.id());
                    conflicting_inputs.push(output.id());
                }
                _ => conflicting_inputs.push(output.id()),
            }
        }

        let mut target = {
            let (branch, _) = self.branch_dag.retrieve_aggregated_branch(&branches)?;
            let branch_id = branch.read().id();
            branch_id
        };
        if !conflicting_inputs.is_empty() {
            let conflicts: ConflictIds = conflicting_inputs.iter().map(ConflictId::from).collect();
            let parents: BranchIds = [target].into_iter().collect();
            self.branch_dag
                .retrieve_conflict_branch(BranchId::from(id), &parents, &conflicts)?;
            target = BranchId::from(id);
        }
        self.book_outputs(&transaction, target)?;

        // Consumers count only once the branch and the outputs exist.
        for output in &outputs {
            output.write().register_consumer(id);
        }
        {
            let mut metadata = metadata.write();
            metadata.set_branch_id(target);
            metadata.set_solid(true);
        }

        let mut decision_pending = !conflicting_inputs.is_empty();
        for (consumer, inputs) in &first_consumers {
            let forked = self.fork_locked(consumer, inputs, events)?;
            if forked.finalized {
                decision_pending = false;
            }
        }

        info!(
            transaction = %id.short_hex(),
            branch = %target.short_hex(),
            decision_pending,
            "transaction booked"
        );
        events.insert(
            0,
            TangleEvent::TransactionBooked {
                transaction: id,
                branch: target,
                decision_pending,
            },
        );
        Ok(BookingOutcome {
            booked: true,
            decision_pending,
        })
    }

    fn book_outputs(&self, transaction: &Transaction, branch: BranchId) -> LedgerResult<()> {
        let id = transaction.id();
        for (address, balances) in transaction.outputs() {
            let mut output = Output::new(*address, id, branch, mint(id, balances));
            output.set_solid();
            self.utxo.outputs.store(output)?;
        }
        Ok(())
    }

    /// Move a booked transaction into its own conflict branch, member of
    /// the conflict sets of `conflicting_inputs`.
    ///
    /// Does nothing to finalized transactions, or if the branch already
    /// exists (the transaction was forked before).
    pub fn fork(&self, id: &TransactionId, conflicting_inputs: &[OutputId]) -> LedgerResult<ForkOutcome> {
        let mut events = Vec::new();
        let guard = self.lock()?;
        let result = self.fork_locked(id, conflicting_inputs, &mut events);
        drop(guard);
        self.events.route_all(&events);
        result
    }

    fn fork_locked(
        &self,
        id: &TransactionId,
        conflicting_inputs: &[OutputId],
        events: &mut Vec<TangleEvent>,
    ) -> LedgerResult<ForkOutcome> {
        let Some(metadata) = self.utxo.transaction_metadata(id)? else {
            warn!(transaction = %id.short_hex(), "cannot fork unknown transaction");
            return Ok(ForkOutcome::default());
        };
        let (source, finalized) = {
            let metadata = metadata.read();
            (metadata.branch_id, metadata.finalized)
        };
        drop(metadata);
        if finalized {
            return Ok(ForkOutcome {
                forked: false,
                finalized: true,
            });
        }
        if source.is_undefined() {
            return Ok(ForkOutcome::default());
        }

        let branch_id = BranchId::from(*id);
        let conflicts: ConflictIds = conflicting_inputs.iter().map(ConflictId::from).collect();
        let parents: BranchIds = [source].into_iter().collect();
        let (_, created) = self
            .branch_dag
            .retrieve_conflict_branch(branch_id, &parents, &conflicts)?;
        if !created {
            return Ok(ForkOutcome::default());
        }

        self.move_transaction(id, branch_id)?;
        info!(transaction = %id.short_hex(), branch = %branch_id.short_hex(), "transaction forked");
        events.push(TangleEvent::TransactionForked {
            transaction: *id,
            branch: branch_id,
        });
        Ok(ForkOutcome {
            forked: true,
            finalized: false,
        })
    }

    /// Re-point a booked transaction, its outputs and every booked
    /// transaction downstream of them at `target`. Returns `false` if the
    /// transaction already was in `target` or is not booked.
    pub fn move_transaction_to_branch(&self, id: &TransactionId, target: BranchId) -> LedgerResult<bool> {
        let _guard = self.lock()?;
        self.move_transaction(id, target)
    }

    fn move_transaction(&self, id: &TransactionId, target: BranchId) -> LedgerResult<bool> {
        let mut moved = false;
        let mut stack = vec![(*id, target)];

        while let Some((current, target)) = stack.pop() {
            let Some(metadata) = self.utxo.transaction_metadata(&current)? else {
                continue;
            };
            let source = metadata.read().branch_id;
            if source.is_undefined() || !metadata.write().set_branch_id(target) {
                continue;
            }
            drop(metadata);
            moved |= current == *id;

            let Some(transaction) = self.utxo.transaction(&current)? else {
                continue;
            };
            let output_ids: Vec<OutputId> = transaction.read().output_ids().collect();
            drop(transaction);

            for output_id in &output_ids {
                if let Some(output) = self.utxo.output(output_id)? {
                    output.write().branch_id = target;
                }
            }

            // Parents a nested conflict branch may still point at.
            let mut old_parents = self
                .branch_dag
                .normalize_branches(&[source].into_iter().collect())?;
            old_parents.insert(source);

            for output_id in &output_ids {
                for consumer in self.utxo.consumers(output_id)? {
                    let consumer_id = consumer.transaction_id;
                    let Some(consumer_metadata) = self.utxo.transaction_metadata(&consumer_id)? else {
                        continue;
                    };
                    let branch = consumer_metadata.read().branch_id;
                    drop(consumer_metadata);
                    if branch.is_undefined() {
                        continue;
                    }

                    if branch == BranchId::from(consumer_id) {
                        for old in &old_parents {
                            self.branch_dag.elevate_conflict_branch(&branch, old, &target)?;
                        }
                    } else {
                        let branch = self.calculate_branch_of_transaction(&consumer_id)?;
                        stack.push((consumer_id, branch));
                    }
                }
            }
            debug!(
                transaction = %current.short_hex(),
                from = %source.short_hex(),
                to = %target.short_hex(),
                "transaction moved"
            );
        }
        Ok(moved)
    }

    /// The branch a transaction belongs to according to the outputs it
    /// consumes, aggregating if they live in several branches.
    pub fn calculate_branch_of_transaction(&self, id: &TransactionId) -> LedgerResult<BranchId> {
        let transaction = self
            .utxo
            .transaction(id)?
            .ok_or(LedgerError::TransactionNotFound(*id))?;
        let transaction = transaction.snapshot();

        let mut branches = BranchIds::new();
        let mut missing = Vec::new();
        for input in transaction.inputs() {
            match self.utxo.output(input)? {
                Some(output) => {
                    branches.insert(output.read().branch_id);
                }
                None => missing.push(*input),
            }
        }
        if !missing.is_empty() {
            return Err(LedgerError::MissingInputs {
                transaction: *id,
                missing,
            });
        }

        let (branch, _) = self.branch_dag.retrieve_aggregated_branch(&branches)?;
        let branch_id = branch.read().id();
        Ok(branch_id)
    }
}
