//! Error types for the booking engine.

use tangle_branchdag::BranchDagError;
use tangle_store::StoreError;
use tangle_types::{BranchIds, OutputId, TransactionId};

/// Errors produced by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Declared inputs do not resolve to stored outputs.
    #[error("transaction {transaction} references {} missing output(s)", missing.len())]
    MissingInputs {
        transaction: TransactionId,
        missing: Vec<OutputId>,
    },

    /// Produced balances do not match the consumed balances, or a produced
    /// balance is not positive.
    #[error("outputs of transaction {0} do not match its inputs")]
    OutputsDoNotMatchInputs(TransactionId),

    /// The same output is listed as an input more than once.
    #[error("transaction {transaction} lists input {input} more than once")]
    DuplicateInput {
        transaction: TransactionId,
        input: OutputId,
    },

    /// Summing the consumed balances of one color overflowed.
    #[error("consumed balances of transaction {0} overflow")]
    BalanceOverflow(TransactionId),

    /// The transaction consumes outputs of mutually exclusive branches.
    #[error("transaction {transaction} consumes outputs of conflicting branches: {source}")]
    ConflictingInputBranches {
        transaction: TransactionId,
        /// The branches of the consumed outputs, before normalization.
        branches: BranchIds,
        source: BranchDagError,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Metadata of a stored transaction is missing.
    #[error("metadata of transaction {0} not found")]
    MetadataNotFound(TransactionId),

    /// A snapshot output id is already stored.
    #[error("snapshot output {0} already exists")]
    DuplicateSnapshotOutput(OutputId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("booking lock poisoned")]
    LockPoisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    BranchDag(#[from] BranchDagError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Returns `true` for structural branch conflicts, as opposed to
    /// malformed transactions or faults.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::ConflictingInputBranches { .. } => true,
            Self::BranchDag(err) => err.is_conflict(),
            _ => false,
        }
    }

    /// Returns `true` if the transaction can never be booked.
    pub fn is_invalid_transaction(&self) -> bool {
        matches!(
            self,
            Self::OutputsDoNotMatchInputs(_)
                | Self::DuplicateInput { .. }
                | Self::BalanceOverflow(_)
                | Self::ConflictingInputBranches { .. }
        )
    }
}

/// Convenience alias for ledger results.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_types::{BranchId, ConflictId};

    #[test]
    fn classification() {
        let tx = TransactionId::random();
        let conflicting = LedgerError::ConflictingInputBranches {
            transaction: tx,
            branches: BranchIds::new(),
            source: BranchDagError::BranchesConflicting {
                first: BranchId::MASTER,
                second: BranchId::MASTER,
                conflict: ConflictId::from_hash([1; 32]),
            },
        };
        assert!(conflicting.is_conflict());
        assert!(conflicting.is_invalid_transaction());

        let mismatch = LedgerError::OutputsDoNotMatchInputs(tx);
        assert!(!mismatch.is_conflict());
        assert!(mismatch.is_invalid_transaction());

        let missing = LedgerError::MissingInputs {
            transaction: tx,
            missing: vec![],
        };
        assert!(!missing.is_invalid_transaction());
        assert!(LedgerError::BalanceOverflow(tx).is_invalid_transaction());
        let duplicate = LedgerError::DuplicateInput {
            transaction: tx,
            input: OutputId::new(tangle_types::Address::from_hash([1; 32]), TransactionId::GENESIS),
        };
        assert!(duplicate.is_invalid_transaction());
        assert!(!duplicate.is_conflict());
    }

    #[test]
    fn dag_conflicts_are_conflicts() {
        let err: LedgerError = BranchDagError::BranchesConflicting {
            first: BranchId::MASTER,
            second: BranchId::MASTER,
            conflict: ConflictId::from_hash([2; 32]),
        }
        .into();
        assert!(err.is_conflict());
        assert!(!LedgerError::from(BranchDagError::UndefinedBranch).is_conflict());
    }
}
