//! Conflict set registry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tangle_store::{KvStore, ObjectStorage, StorableObject, StoreResult};
use tangle_types::{BranchId, BranchIds, ConflictId, ConflictIds};

/// Storage realm of conflict set members, keyed `conflict || branch`.
pub const CONFLICT_MEMBER_REALM: &[u8] = &[0x12];
/// Storage realm of the inverse index, keyed `branch || conflict`.
pub const BRANCH_CONFLICT_REALM: &[u8] = &[0x13];

/// Membership of a branch in a conflict set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMember {
    pub conflict_id: ConflictId,
    pub branch_id: BranchId,
}

impl StorableObject for ConflictMember {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(self.conflict_id.as_bytes());
        key.extend_from_slice(self.branch_id.as_bytes());
        key
    }
}

/// Inverse of [`ConflictMember`], scanned by branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConflict {
    pub branch_id: BranchId,
    pub conflict_id: ConflictId,
}

impl StorableObject for BranchConflict {
    fn object_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(self.branch_id.as_bytes());
        key.extend_from_slice(self.conflict_id.as_bytes());
        key
    }
}

/// Tracks which branches are mutually exclusive members of which conflict
/// sets, indexed in both directions.
pub struct ConflictRegistry {
    members: ObjectStorage<ConflictMember>,
    memberships: ObjectStorage<BranchConflict>,
}

impl ConflictRegistry {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self {
            members: ObjectStorage::new(backend.clone(), CONFLICT_MEMBER_REALM),
            memberships: ObjectStorage::new(backend, BRANCH_CONFLICT_REALM),
        }
    }

    /// Add `branch_id` to the conflict set `conflict_id`. Idempotent;
    /// returns `true` if the membership is new.
    pub fn register_member(&self, conflict_id: ConflictId, branch_id: BranchId) -> StoreResult<bool> {
        let created = self
            .members
            .store_if_absent(ConflictMember {
                conflict_id,
                branch_id,
            })?
            .is_some();
        self.memberships.store_if_absent(BranchConflict {
            branch_id,
            conflict_id,
        })?;
        Ok(created)
    }

    /// Snapshot of the members of a conflict set.
    pub fn members(&self, conflict_id: &ConflictId) -> StoreResult<BranchIds> {
        let members = self.members.load_with_prefix(conflict_id.as_bytes())?;
        Ok(members.iter().map(|member| member.read().branch_id).collect())
    }

    /// Conflict sets `branch_id` belongs to.
    pub fn conflicts_of(&self, branch_id: &BranchId) -> StoreResult<ConflictIds> {
        let memberships = self.memberships.load_with_prefix(branch_id.as_bytes())?;
        Ok(memberships
            .iter()
            .map(|membership| membership.read().conflict_id)
            .collect())
    }

    /// Members of every conflict set in `conflicts`, except `branch_id`.
    pub fn rivals(&self, branch_id: &BranchId, conflicts: &ConflictIds) -> StoreResult<BranchIds> {
        let mut rivals = BranchIds::new();
        for conflict in conflicts {
            rivals.extend(self.members(conflict)?);
        }
        rivals.remove(branch_id);
        Ok(rivals)
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.members.flush()?;
        self.memberships.flush()?;
        Ok(())
    }
}
