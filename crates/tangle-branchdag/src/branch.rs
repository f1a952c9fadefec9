//! Branch entities and their voting state.

use std::fmt;

use serde::{Deserialize, Serialize};

use tangle_store::StorableObject;
use tangle_types::{BranchId, BranchIds, ConflictId, ConflictIds};

/// Whether a branch is part of the ledger for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InclusionState {
    #[default]
    Pending,
    Confirmed,
    Rejected,
}

impl fmt::Display for InclusionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// The local opinion about a branch.
///
/// `preferred` and `finalized` are inputs from the voting layer (derived from
/// the parents for aggregated branches). `liked` and `inclusion` are always
/// derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VotingState {
    pub preferred: bool,
    pub liked: bool,
    pub finalized: bool,
    pub inclusion: InclusionState,
}

impl VotingState {
    /// The fixed opinion on the master branch.
    pub const MASTER: Self = Self {
        preferred: true,
        liked: true,
        finalized: true,
        inclusion: InclusionState::Confirmed,
    };

    pub fn confirmed(&self) -> bool {
        self.inclusion == InclusionState::Confirmed
    }

    pub fn rejected(&self) -> bool {
        self.inclusion == InclusionState::Rejected
    }
}

/// Discriminant of [`Branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchKind {
    Conflict,
    Aggregated,
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::Aggregated => write!(f, "aggregated"),
        }
    }
}

/// A node of the branch DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    /// Created by a double spend. Member of one conflict set per contested
    /// output.
    Conflict {
        id: BranchId,
        parents: BranchIds,
        conflicts: ConflictIds,
        voting: VotingState,
    },
    /// The combination of several non-conflicting conflict branches. Its id
    /// is derived from the parent set.
    Aggregated {
        id: BranchId,
        parents: BranchIds,
        voting: VotingState,
    },
}

impl Branch {
    /// The root of the DAG.
    pub fn master() -> Self {
        Self::Conflict {
            id: BranchId::MASTER,
            parents: BranchIds::new(),
            conflicts: ConflictIds::new(),
            voting: VotingState::MASTER,
        }
    }

    pub fn new_conflict(id: BranchId, parents: BranchIds, conflicts: ConflictIds) -> Self {
        Self::Conflict {
            id,
            parents,
            conflicts,
            voting: VotingState::default(),
        }
    }

    /// An aggregated branch over `parents`, identified by
    /// [`BranchId::aggregated`].
    pub fn new_aggregated(parents: BranchIds) -> Self {
        Self::Aggregated {
            id: BranchId::aggregated(&parents),
            parents,
            voting: VotingState::default(),
        }
    }

    pub fn id(&self) -> BranchId {
        match self {
            Self::Conflict { id, .. } | Self::Aggregated { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> BranchKind {
        match self {
            Self::Conflict { .. } => BranchKind::Conflict,
            Self::Aggregated { .. } => BranchKind::Aggregated,
        }
    }

    pub fn parents(&self) -> &BranchIds {
        match self {
            Self::Conflict { parents, .. } | Self::Aggregated { parents, .. } => parents,
        }
    }

    /// Conflict sets this branch belongs to. Empty for aggregated branches.
    pub fn conflicts(&self) -> ConflictIds {
        match self {
            Self::Conflict { conflicts, .. } => conflicts.clone(),
            Self::Aggregated { .. } => ConflictIds::new(),
        }
    }

    pub fn voting(&self) -> &VotingState {
        match self {
            Self::Conflict { voting, .. } | Self::Aggregated { voting, .. } => voting,
        }
    }

    pub fn voting_mut(&mut self) -> &mut VotingState {
        match self {
            Self::Conflict { voting, .. } | Self::Aggregated { voting, .. } => voting,
        }
    }

    pub fn preferred(&self) -> bool {
        self.voting().preferred
    }

    pub fn liked(&self) -> bool {
        self.voting().liked
    }

    pub fn finalized(&self) -> bool {
        self.voting().finalized
    }

    pub fn inclusion(&self) -> InclusionState {
        self.voting().inclusion
    }

    /// Add `conflict` to the branch's conflict sets. Returns `false` if it
    /// was already a member or the branch is aggregated.
    pub fn add_conflict(&mut self, conflict: ConflictId) -> bool {
        match self {
            Self::Conflict { conflicts, .. } => conflicts.insert(conflict),
            Self::Aggregated { .. } => false,
        }
    }

    /// Swap `old` for `new` in the parent set. Returns `false` if `old` was
    /// not a parent.
    pub fn replace_parent(&mut self, old: &BranchId, new: BranchId) -> bool {
        let parents = match self {
            Self::Conflict { parents, .. } | Self::Aggregated { parents, .. } => parents,
        };
        if !parents.remove(old) {
            return false;
        }
        parents.insert(new);
        if parents.len() > 1 {
            parents.remove(&BranchId::MASTER);
        }
        true
    }

    /// Recompute the derived part of the voting state from the parents'
    /// states.
    ///
    /// Conflict branches keep their explicit `preferred`/`finalized` flags;
    /// aggregated branches take them from the parents as well.
    pub fn derive_voting(&self, parents: &[VotingState]) -> VotingState {
        if self.id().is_master() {
            return VotingState::MASTER;
        }

        let mut voting = *self.voting();
        if self.kind() == BranchKind::Aggregated {
            voting.preferred = parents.iter().all(|p| p.preferred);
            voting.finalized = parents.iter().all(|p| p.finalized);
        }

        voting.liked = voting.preferred && parents.iter().all(|p| p.liked);
        voting.inclusion = if parents.iter().any(VotingState::rejected)
            || (voting.finalized && !voting.preferred)
        {
            InclusionState::Rejected
        } else if voting.finalized && voting.liked && parents.iter().all(VotingState::confirmed) {
            InclusionState::Confirmed
        } else {
            InclusionState::Pending
        };
        voting
    }
}

impl StorableObject for Branch {
    fn object_key(&self) -> Vec<u8> {
        self.id().as_bytes().to_vec()
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let voting = self.voting();
        write!(
            f,
            "{} branch {} (parents: {}, preferred: {}, liked: {}, finalized: {}, {})",
            self.kind(),
            self.id().short_hex(),
            self.parents().len(),
            voting.preferred,
            voting.liked,
            voting.finalized,
            voting.inclusion
        )
    }
}

/// Reverse edge of the DAG: `child` lists `parent` among its parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildBranch {
    pub parent: BranchId,
    pub child: BranchId,
    pub kind: BranchKind,
}

impl StorableObject for ChildBranch {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(self.parent.as_bytes());
        key.extend_from_slice(self.child.as_bytes());
        key
    }
}
