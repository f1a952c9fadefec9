//! Error types for the branch DAG.

use tangle_store::StoreError;
use tangle_types::{BranchId, ConflictId};

use crate::branch::BranchKind;

/// Errors that can occur during branch DAG operations.
#[derive(Debug, thiserror::Error)]
pub enum BranchDagError {
    /// A referenced branch is not stored.
    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    /// The undefined sentinel was used where a real branch is required.
    #[error("the undefined branch id cannot be stored")]
    UndefinedBranch,

    /// Two branches (or their ancestors) are members of the same conflict set.
    #[error("branches {first} and {second} are conflicting via conflict set {conflict}")]
    BranchesConflicting {
        /// The branch that claimed the conflict set first.
        first: BranchId,
        /// The branch that claimed it again.
        second: BranchId,
        /// The shared conflict set.
        conflict: ConflictId,
    },

    /// A branch has a different variant than the operation requires.
    #[error("branch {id} is a {actual} branch, expected a {expected} branch")]
    UnexpectedBranchKind {
        id: BranchId,
        expected: BranchKind,
        actual: BranchKind,
    },

    /// The master branch is always preferred and finalized.
    #[error("the opinion on the master branch cannot change")]
    MasterBranchImmutable,

    /// Aggregated branches derive their opinion from their parents.
    #[error("aggregated branch {0} derives its opinion from its parents")]
    AggregatedBranchOpinion(BranchId),

    /// The preference of a finalized branch is frozen.
    #[error("preference of finalized branch {0} cannot change")]
    FinalizedBranch(BranchId),

    /// Preferring the branch would unprefer a finalized member of its
    /// conflict sets.
    #[error("branch {branch} conflicts with finalized branch {finalized}")]
    ConflictsWithFinalized {
        branch: BranchId,
        finalized: BranchId,
    },

    /// The DAG mutation lock was poisoned by a panicking thread.
    #[error("branch dag lock poisoned")]
    LockPoisoned,

    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BranchDagError {
    /// Returns `true` for errors describing a structural conflict between
    /// branches rather than a fault.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::BranchesConflicting { .. })
    }
}

/// Convenience alias for branch DAG results.
pub type BranchDagResult<T> = Result<T, BranchDagError>;
