//! The branch DAG: conflict and aggregated branches, normalization and
//! opinion propagation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use tangle_store::{CachedObject, KvStore, ObjectStorage, StorableObject};
use tangle_types::{BranchId, BranchIds, ConflictId, ConflictIds};

use crate::branch::{Branch, BranchKind, ChildBranch, VotingState};
use crate::config::BranchDagConfig;
use crate::conflict::ConflictRegistry;
use crate::error::{BranchDagError, BranchDagResult};
use crate::events::{BranchDagEvent, BranchEventKind, EventFilter, EventRouter, EventStream};

/// Storage realm of branches, keyed by branch id.
pub const BRANCH_REALM: &[u8] = &[0x10];
/// Storage realm of child edges, keyed `parent || child`.
pub const CHILD_BRANCH_REALM: &[u8] = &[0x11];

/// Manages the DAG of branches.
///
/// Every operation that creates branches or changes opinions runs under a
/// single DAG-wide lock: propagation touches an unknown set of ancestors and
/// descendants, and creation must register conflict sets atomically. Events
/// are collected while the lock is held and routed after the mutation has
/// been applied completely.
pub struct BranchDag {
    branches: ObjectStorage<Branch>,
    children: ObjectStorage<ChildBranch>,
    conflicts: ConflictRegistry,
    events: EventRouter<BranchDagEvent>,
    mutation: Mutex<()>,
}

impl BranchDag {
    /// Open the branch DAG on `backend`, creating the master branch if it is
    /// not stored yet.
    pub fn new(backend: Arc<dyn KvStore>, config: &BranchDagConfig) -> BranchDagResult<Self> {
        let dag = Self {
            branches: ObjectStorage::new(backend.clone(), BRANCH_REALM),
            children: ObjectStorage::new(backend.clone(), CHILD_BRANCH_REALM),
            conflicts: ConflictRegistry::new(backend),
            events: EventRouter::new(config.event_channel_capacity),
            mutation: Mutex::new(()),
        };

        let (_, created) = dag
            .branches
            .compute_if_absent(BranchId::MASTER.as_bytes(), Branch::master)?;
        if created {
            info!("master branch created");
        }
        Ok(dag)
    }

    fn lock(&self) -> BranchDagResult<MutexGuard<'_, ()>> {
        self.mutation.lock().map_err(|_| BranchDagError::LockPoisoned)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Load a branch.
    pub fn branch(&self, id: &BranchId) -> BranchDagResult<Option<CachedObject<Branch>>> {
        Ok(self.branches.load(id.as_bytes())?)
    }

    fn require(&self, id: &BranchId) -> BranchDagResult<CachedObject<Branch>> {
        if id.is_undefined() {
            return Err(BranchDagError::UndefinedBranch);
        }
        self.branch(id)?
            .ok_or(BranchDagError::BranchNotFound(*id))
    }

    /// Child edges of `id`.
    pub fn child_branches(&self, id: &BranchId) -> BranchDagResult<Vec<ChildBranch>> {
        let edges = self.children.load_with_prefix(id.as_bytes())?;
        Ok(edges.iter().map(|edge| *edge.read()).collect())
    }

    fn child_ids(&self, id: &BranchId) -> BranchDagResult<Vec<BranchId>> {
        Ok(self.child_branches(id)?.into_iter().map(|edge| edge.child).collect())
    }

    /// Members of a conflict set.
    pub fn conflict_members(&self, conflict: &ConflictId) -> BranchDagResult<BranchIds> {
        Ok(self.conflicts.members(conflict)?)
    }

    /// Subscribe to branch events.
    pub fn subscribe(&self, filter: EventFilter<BranchEventKind>) -> EventStream<BranchDagEvent> {
        self.events.subscribe(filter)
    }

    // -----------------------------------------------------------------------
    // Branch creation
    // -----------------------------------------------------------------------

    /// Retrieve the conflict branch `id`, creating it below `parents` as a
    /// member of `conflicts` if it does not exist.
    ///
    /// For an existing branch, conflict sets it is not a member of yet are
    /// added. The boolean is `true` iff this call created the branch.
    pub fn retrieve_conflict_branch(
        &self,
        id: BranchId,
        parents: &BranchIds,
        conflicts: &ConflictIds,
    ) -> BranchDagResult<(CachedObject<Branch>, bool)> {
        if id.is_undefined() {
            return Err(BranchDagError::UndefinedBranch);
        }
        let _guard = self.lock()?;
        let mut events = Vec::new();

        if let Some(existing) = self.branch(&id)? {
            self.extend_conflicts(&existing, conflicts, &mut events)?;
            drop(_guard);
            self.events.route_all(&events);
            return Ok((existing, false));
        }

        let parents = self.normalize(parents)?;
        let mut branch = Branch::new_conflict(id, parents.clone(), conflicts.clone());
        let parent_votes = self.parent_votes(&parents)?;
        *branch.voting_mut() = branch.derive_voting(&parent_votes);

        let (cached, created) = self.branches.compute_if_absent(id.as_bytes(), || branch)?;
        if created {
            for conflict in conflicts {
                self.conflicts.register_member(*conflict, id)?;
            }
            self.link_parents(id, &parents, BranchKind::Conflict)?;
            info!(
                branch = %id.short_hex(),
                parents = parents.len(),
                conflicts = conflicts.len(),
                "conflict branch created"
            );
        }
        Ok((cached, created))
    }

    fn extend_conflicts(
        &self,
        existing: &CachedObject<Branch>,
        conflicts: &ConflictIds,
        events: &mut Vec<BranchDagEvent>,
    ) -> BranchDagResult<()> {
        let (id, kind, current, preferred, finalized) = {
            let branch = existing.read();
            (
                branch.id(),
                branch.kind(),
                branch.conflicts(),
                branch.preferred(),
                branch.finalized(),
            )
        };
        if kind != BranchKind::Conflict {
            return Err(BranchDagError::UnexpectedBranchKind {
                id,
                expected: BranchKind::Conflict,
                actual: BranchKind::Aggregated,
            });
        }

        let added: ConflictIds = conflicts.difference(&current).copied().collect();
        if added.is_empty() {
            return Ok(());
        }

        let mut rivals = Vec::new();
        let mut rival_preferred = false;
        for rival in self.conflicts.rivals(&id, &added)? {
            let rival_cached = self.require(&rival)?;
            let (rival_is_preferred, rival_is_finalized) = {
                let branch = rival_cached.read();
                (branch.preferred(), branch.finalized())
            };
            if rival_is_preferred && rival_is_finalized && preferred && finalized {
                return Err(BranchDagError::ConflictsWithFinalized {
                    branch: id,
                    finalized: rival,
                });
            }
            rival_preferred |= rival_is_preferred;
            rivals.push((rival_cached, rival_is_preferred, rival_is_finalized));
        }

        {
            let mut branch = existing.write();
            for conflict in &added {
                branch.add_conflict(*conflict);
            }
        }
        for conflict in &added {
            self.conflicts.register_member(*conflict, id)?;
        }
        debug!(branch = %id.short_hex(), added = added.len(), "conflict branch extended");

        if preferred && finalized {
            // A decided branch rejects the members of the sets it joins.
            let mut seeds = Vec::new();
            for (rival, rival_is_preferred, rival_is_finalized) in &rivals {
                if *rival_is_preferred {
                    self.set_preferred_flag(rival, false, events);
                }
                if !*rival_is_finalized {
                    self.set_finalized_flag(rival, true, events);
                }
                seeds.push(rival.read().id());
            }
            self.propagate(seeds, events)?;
        } else if preferred && rival_preferred {
            self.set_preferred_flag(existing, false, events);
            self.propagate([id], events)?;
        }
        Ok(())
    }

    /// Retrieve the branch combining `ids`.
    ///
    /// The ids are normalized first. A single remaining branch is returned
    /// as is; otherwise the aggregated branch over the normalized set is
    /// loaded or created. The boolean is `true` iff a branch was created.
    pub fn retrieve_aggregated_branch(
        &self,
        ids: &BranchIds,
    ) -> BranchDagResult<(CachedObject<Branch>, bool)> {
        let _guard = self.lock()?;

        let parents = self.normalize(ids)?;
        if parents.len() == 1 {
            let only = parents.iter().next().copied().unwrap_or(BranchId::MASTER);
            return Ok((self.require(&only)?, false));
        }

        let mut branch = Branch::new_aggregated(parents.clone());
        let id = branch.id();
        let parent_votes = self.parent_votes(&parents)?;
        *branch.voting_mut() = branch.derive_voting(&parent_votes);

        let (cached, created) = self.branches.compute_if_absent(id.as_bytes(), || branch)?;
        if created {
            self.link_parents(id, &parents, BranchKind::Aggregated)?;
            debug!(branch = %id.short_hex(), parents = parents.len(), "aggregated branch created");
        }
        Ok((cached, created))
    }

    fn link_parents(&self, child: BranchId, parents: &BranchIds, kind: BranchKind) -> BranchDagResult<()> {
        for parent in parents {
            self.children.store(ChildBranch {
                parent: *parent,
                child,
                kind,
            })?;
        }
        Ok(())
    }

    /// Re-parent the conflict branch `id` from `old_parent` to `new_parent`.
    ///
    /// Used when the transactions of `old_parent` are moved into a freshly
    /// forked branch below it. Returns `false` if `old_parent` is not a
    /// parent of `id`.
    pub fn elevate_conflict_branch(
        &self,
        id: &BranchId,
        old_parent: &BranchId,
        new_parent: &BranchId,
    ) -> BranchDagResult<bool> {
        let _guard = self.lock()?;
        let cached = self.require(id)?;
        let kind = cached.read().kind();
        if kind != BranchKind::Conflict {
            return Err(BranchDagError::UnexpectedBranchKind {
                id: *id,
                expected: BranchKind::Conflict,
                actual: kind,
            });
        }
        self.require(new_parent)?;

        if !cached.write().replace_parent(old_parent, *new_parent) {
            return Ok(false);
        }
        let old_edge = ChildBranch {
            parent: *old_parent,
            child: *id,
            kind,
        };
        self.children.delete(&old_edge.object_key())?;
        let new_parents: BranchIds = [*new_parent].into_iter().collect();
        self.link_parents(*id, &new_parents, kind)?;
        drop(cached);

        let mut events = Vec::new();
        self.propagate([*id], &mut events)?;
        debug!(
            branch = %id.short_hex(),
            old_parent = %old_parent.short_hex(),
            new_parent = %new_parent.short_hex(),
            "conflict branch elevated"
        );

        drop(_guard);
        self.events.route_all(&events);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    /// Reduce `ids` to the minimal equivalent set of conflict branches.
    ///
    /// Aggregated branches are replaced by their parents, ancestors of other
    /// members are dropped and the master branch only survives on its own.
    /// Fails with [`BranchDagError::BranchesConflicting`] if two members, or
    /// any of their ancestors, share a conflict set.
    pub fn normalize_branches(&self, ids: &BranchIds) -> BranchDagResult<BranchIds> {
        self.normalize(ids)
    }

    fn normalize(&self, ids: &BranchIds) -> BranchDagResult<BranchIds> {
        let mut candidates = BranchIds::new();
        for id in ids {
            if id.is_master() {
                continue;
            }
            let branch = self.require(id)?;
            let branch = branch.read();
            match &*branch {
                Branch::Conflict { .. } => {
                    candidates.insert(*id);
                }
                Branch::Aggregated { parents, .. } => {
                    candidates.extend(parents.iter().filter(|p| !p.is_master()).copied());
                }
            }
        }

        match candidates.len() {
            0 => return Ok([BranchId::MASTER].into_iter().collect()),
            1 => return Ok(candidates),
            _ => {}
        }

        let mut normalized = candidates.clone();
        let mut traversed: HashSet<BranchId> = HashSet::new();
        let mut seen_conflicts: HashMap<ConflictId, BranchId> = HashMap::new();
        let mut ancestors: Vec<BranchId> = Vec::new();

        for id in &candidates {
            traversed.insert(*id);
            self.claim_conflicts(id, &mut seen_conflicts, &mut ancestors)?;
        }

        while let Some(id) = ancestors.pop() {
            if id.is_master() {
                continue;
            }
            normalized.remove(&id);
            if !traversed.insert(id) {
                continue;
            }
            self.claim_conflicts(&id, &mut seen_conflicts, &mut ancestors)?;
        }

        Ok(normalized)
    }

    fn claim_conflicts(
        &self,
        id: &BranchId,
        seen: &mut HashMap<ConflictId, BranchId>,
        ancestors: &mut Vec<BranchId>,
    ) -> BranchDagResult<()> {
        let cached = self.require(id)?;
        let branch = cached.read();
        for conflict in branch.conflicts() {
            if let Some(first) = seen.insert(conflict, *id) {
                return Err(BranchDagError::BranchesConflicting {
                    first,
                    second: *id,
                    conflict,
                });
            }
        }
        ancestors.extend(branch.parents().iter().copied());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Opinion
    // -----------------------------------------------------------------------

    /// Set whether the conflict branch `id` is preferred.
    ///
    /// Preferring a branch unprefers every preferred member of its conflict
    /// sets first. Liked and inclusion states are propagated to descendants
    /// before any event is routed. Returns `false` if nothing changed.
    pub fn set_branch_preferred(&self, id: &BranchId, preferred: bool) -> BranchDagResult<bool> {
        if id.is_master() {
            return if preferred {
                Ok(false)
            } else {
                Err(BranchDagError::MasterBranchImmutable)
            };
        }

        let _guard = self.lock()?;
        let cached = self.require(id)?;
        let (kind, current, finalized, conflicts) = {
            let branch = cached.read();
            (branch.kind(), branch.preferred(), branch.finalized(), branch.conflicts())
        };
        if kind == BranchKind::Aggregated {
            return Err(BranchDagError::AggregatedBranchOpinion(*id));
        }
        if current == preferred {
            return Ok(false);
        }
        if finalized {
            return Err(BranchDagError::FinalizedBranch(*id));
        }

        let mut events = Vec::new();
        if preferred {
            let mut rivals = Vec::new();
            for rival in self.conflicts.rivals(id, &conflicts)? {
                let rival_cached = self.require(&rival)?;
                let (rival_preferred, rival_finalized) = {
                    let branch = rival_cached.read();
                    (branch.preferred(), branch.finalized())
                };
                if !rival_preferred {
                    continue;
                }
                if rival_finalized {
                    return Err(BranchDagError::ConflictsWithFinalized {
                        branch: *id,
                        finalized: rival,
                    });
                }
                rivals.push(rival_cached);
            }

            for rival in &rivals {
                self.set_preferred_flag(rival, false, &mut events);
            }
            self.propagate(rivals.iter().map(|rival| rival.read().id()), &mut events)?;
        }

        self.set_preferred_flag(&cached, preferred, &mut events);
        drop(cached);
        self.propagate([*id], &mut events)?;

        info!(branch = %id.short_hex(), preferred, events = events.len(), "branch preference set");
        drop(_guard);
        self.events.route_all(&events);
        Ok(true)
    }

    fn set_preferred_flag(&self, cached: &CachedObject<Branch>, preferred: bool, events: &mut Vec<BranchDagEvent>) {
        let id = {
            let mut branch = cached.write();
            branch.voting_mut().preferred = preferred;
            branch.id()
        };
        let kind = if preferred {
            BranchEventKind::Preferred
        } else {
            BranchEventKind::Unpreferred
        };
        events.push(BranchDagEvent::new(kind, id));
    }

    /// Set whether the conflict branch `id` is finalized.
    ///
    /// Finalizing a preferred branch finalizes the other members of its
    /// conflict sets as well, which rejects them. Returns `false` if nothing
    /// changed.
    pub fn set_branch_finalized(&self, id: &BranchId, finalized: bool) -> BranchDagResult<bool> {
        if id.is_master() {
            return if finalized {
                Ok(false)
            } else {
                Err(BranchDagError::MasterBranchImmutable)
            };
        }

        let _guard = self.lock()?;
        let cached = self.require(id)?;
        let (kind, current, preferred, conflicts) = {
            let branch = cached.read();
            (branch.kind(), branch.finalized(), branch.preferred(), branch.conflicts())
        };
        if kind == BranchKind::Aggregated {
            return Err(BranchDagError::AggregatedBranchOpinion(*id));
        }
        if current == finalized {
            return Ok(false);
        }

        let mut events = Vec::new();
        let mut seeds = vec![*id];
        self.set_finalized_flag(&cached, finalized, &mut events);
        drop(cached);

        if finalized && preferred {
            for rival in self.conflicts.rivals(id, &conflicts)? {
                let rival_cached = self.require(&rival)?;
                if rival_cached.read().finalized() {
                    continue;
                }
                self.set_finalized_flag(&rival_cached, true, &mut events);
                seeds.push(rival);
            }
        }
        self.propagate(seeds, &mut events)?;

        info!(branch = %id.short_hex(), finalized, events = events.len(), "branch finalization set");
        drop(_guard);
        self.events.route_all(&events);
        Ok(true)
    }

    fn set_finalized_flag(&self, cached: &CachedObject<Branch>, finalized: bool, events: &mut Vec<BranchDagEvent>) {
        let id = {
            let mut branch = cached.write();
            branch.voting_mut().finalized = finalized;
            branch.id()
        };
        let kind = if finalized {
            BranchEventKind::Finalized
        } else {
            BranchEventKind::Unfinalized
        };
        events.push(BranchDagEvent::new(kind, id));
    }

    fn parent_votes(&self, parents: &BranchIds) -> BranchDagResult<Vec<VotingState>> {
        parents
            .iter()
            .map(|parent| Ok(*self.require(parent)?.read().voting()))
            .collect()
    }

    /// Re-derive the opinion of `seeds` and, transitively, of every
    /// descendant whose opinion changes.
    fn propagate(
        &self,
        seeds: impl IntoIterator<Item = BranchId>,
        events: &mut Vec<BranchDagEvent>,
    ) -> BranchDagResult<()> {
        let mut queue: VecDeque<(BranchId, bool)> = seeds.into_iter().map(|id| (id, true)).collect();
        while let Some((id, seed)) = queue.pop_front() {
            let changed = self.refresh(&id, events)?;
            if changed || seed {
                for child in self.child_ids(&id)? {
                    queue.push_back((child, false));
                }
            }
        }
        Ok(())
    }

    fn refresh(&self, id: &BranchId, events: &mut Vec<BranchDagEvent>) -> BranchDagResult<bool> {
        if id.is_master() {
            return Ok(false);
        }
        let cached = self.require(id)?;
        let branch = cached.snapshot();
        let parent_votes = self.parent_votes(branch.parents())?;
        let before = *branch.voting();
        let after = branch.derive_voting(&parent_votes);
        if before == after {
            return Ok(false);
        }

        *cached.write().voting_mut() = after;
        voting_events(*id, &before, &after, events);
        Ok(true)
    }

    /// Flush every cached branch, edge and conflict membership.
    pub fn shutdown(&self) -> BranchDagResult<()> {
        let _guard = self.lock()?;
        self.branches.flush()?;
        self.children.flush()?;
        self.conflicts.flush()?;
        info!("branch dag shut down");
        Ok(())
    }
}

fn voting_events(id: BranchId, before: &VotingState, after: &VotingState, events: &mut Vec<BranchDagEvent>) {
    if before.preferred != after.preferred {
        let kind = if after.preferred {
            BranchEventKind::Preferred
        } else {
            BranchEventKind::Unpreferred
        };
        events.push(BranchDagEvent::new(kind, id));
    }
    if before.liked != after.liked {
        let kind = if after.liked {
            BranchEventKind::Liked
        } else {
            BranchEventKind::Disliked
        };
        events.push(BranchDagEvent::new(kind, id));
    }
    if before.finalized != after.finalized {
        let kind = if after.finalized {
            BranchEventKind::Finalized
        } else {
            BranchEventKind::Unfinalized
        };
        events.push(BranchDagEvent::new(kind, id));
    }
    if before.inclusion != after.inclusion {
        let kind = if after.confirmed() {
            BranchEventKind::Confirmed
        } else if after.rejected() {
            BranchEventKind::Rejected
        } else {
            BranchEventKind::Pending
        };
        events.push(BranchDagEvent::new(kind, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::InclusionState;
    use crate::events::drain;
    use proptest::prelude::*;
    use std::thread;
    use tangle_store::InMemoryKvStore;

    fn bid(n: u8) -> BranchId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        BranchId::from_hash(bytes)
    }

    fn cid(n: u8) -> ConflictId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        ConflictId::from_hash(bytes)
    }

    fn set(ids: &[BranchId]) -> BranchIds {
        ids.iter().copied().collect()
    }

    fn conflicts(ns: &[u8]) -> ConflictIds {
        ns.iter().map(|n| cid(*n)).collect()
    }

    fn setup() -> BranchDag {
        BranchDag::new(Arc::new(InMemoryKvStore::new()), &BranchDagConfig::default()).unwrap()
    }

    fn conflict_branch(dag: &BranchDag, id: u8, parents: &[BranchId], conflict: u8) -> BranchId {
        let (branch, created) = dag
            .retrieve_conflict_branch(bid(id), &set(parents), &conflicts(&[conflict]))
            .unwrap();
        assert!(created);
        let id = branch.read().id();
        id
    }

    fn aggregate(dag: &BranchDag, parents: &[BranchId]) -> BranchId {
        let (branch, created) = dag.retrieve_aggregated_branch(&set(parents)).unwrap();
        assert!(created);
        let id = branch.read().id();
        id
    }

    fn normalized(dag: &BranchDag, ids: &[BranchId]) -> BranchDagResult<BranchIds> {
        dag.normalize_branches(&set(ids))
    }

    fn voting(dag: &BranchDag, id: BranchId) -> VotingState {
        *dag.branch(&id).unwrap().unwrap().read().voting()
    }

    fn events(stream: &mut EventStream<BranchDagEvent>) -> HashSet<BranchDagEvent> {
        drain(stream).into_iter().collect()
    }

    fn ev(kind: BranchEventKind, id: BranchId) -> BranchDagEvent {
        BranchDagEvent::new(kind, id)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    #[test]
    fn master_branch_exists() {
        let dag = setup();
        let master = dag.branch(&BranchId::MASTER).unwrap().unwrap();
        assert_eq!(*master.read().voting(), VotingState::MASTER);
        assert!(dag.branch(&bid(9)).unwrap().is_none());
    }

    #[test]
    fn retrieve_conflict_branch_extends_existing() {
        let dag = setup();
        let parent = conflict_branch(&dag, 2, &[BranchId::MASTER], 9);

        let (branch, created) = dag
            .retrieve_conflict_branch(bid(3), &set(&[parent]), &conflicts(&[0, 1]))
            .unwrap();
        assert!(created);
        assert_eq!(branch.read().parents(), &set(&[parent]));
        drop(branch);

        let (branch, created) = dag
            .retrieve_conflict_branch(bid(3), &set(&[parent]), &conflicts(&[0, 1, 2]))
            .unwrap();
        assert!(!created);
        assert_eq!(branch.read().conflicts(), conflicts(&[0, 1, 2]));
        assert_eq!(dag.conflict_members(&cid(2)).unwrap(), set(&[bid(3)]));
        assert_eq!(dag.child_branches(&parent).unwrap().len(), 1);
    }

    #[test]
    fn retrieve_conflict_branch_rejects_conflicting_parents() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 0);

        let err = dag
            .retrieve_conflict_branch(bid(4), &set(&[b2, b3]), &conflicts(&[1]))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(dag.branch(&bid(4)).unwrap().is_none());
    }

    #[test]
    fn undefined_branch_is_refused() {
        let dag = setup();
        let err = dag
            .retrieve_conflict_branch(BranchId::UNDEFINED, &set(&[BranchId::MASTER]), &conflicts(&[0]))
            .unwrap_err();
        assert!(matches!(err, BranchDagError::UndefinedBranch));
    }

    #[test]
    fn aggregated_branches_are_memoized() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b6 = conflict_branch(&dag, 6, &[BranchId::MASTER], 2);

        let (first, created) = dag.retrieve_aggregated_branch(&set(&[b2, b6])).unwrap();
        assert!(created);
        assert_eq!(first.read().kind(), BranchKind::Aggregated);

        let (second, created) = dag
            .retrieve_aggregated_branch(&set(&[b6, b2, BranchId::MASTER]))
            .unwrap();
        assert!(!created);
        assert_eq!(first.read().id(), second.read().id());
        assert_eq!(first.read().id(), BranchId::aggregated(&set(&[b2, b6])));
    }

    #[test]
    fn aggregating_a_single_branch_returns_it() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);

        let (branch, created) = dag
            .retrieve_aggregated_branch(&set(&[b2, BranchId::MASTER]))
            .unwrap();
        assert!(!created);
        assert_eq!(branch.read().id(), b2);

        let (branch, created) = dag.retrieve_aggregated_branch(&BranchIds::new()).unwrap();
        assert!(!created);
        assert!(branch.read().id().is_master());
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn normalize_unknown_branch_fails() {
        let dag = setup();
        let err = normalized(&dag, &[bid(42)]).unwrap_err();
        assert!(matches!(err, BranchDagError::BranchNotFound(id) if id == bid(42)));
    }

    #[test]
    fn normalize_branches() {
        let dag = setup();
        let m = BranchId::MASTER;

        let b2 = conflict_branch(&dag, 2, &[m], 0);
        let b3 = conflict_branch(&dag, 3, &[m], 0);
        assert_eq!(normalized(&dag, &[m, b2]).unwrap(), set(&[b2]));
        assert_eq!(normalized(&dag, &[m, b3]).unwrap(), set(&[b3]));
        assert!(normalized(&dag, &[b2, b3]).is_err());

        // branch 4 and 5 spawn from branch 2
        let b4 = conflict_branch(&dag, 4, &[b2], 1);
        let b5 = conflict_branch(&dag, 5, &[b2], 1);
        assert_eq!(normalized(&dag, &[m, b4]).unwrap(), set(&[b4]));
        assert!(normalized(&dag, &[b3, b4]).is_err());
        assert_eq!(normalized(&dag, &[m, b5]).unwrap(), set(&[b5]));
        assert!(normalized(&dag, &[b3, b5]).is_err());
        assert!(normalized(&dag, &[b4, b5]).is_err());

        // branch 6 and 7 are on the level of 2 and 3 but in another conflict set
        let b6 = conflict_branch(&dag, 6, &[m], 2);
        let b7 = conflict_branch(&dag, 7, &[m], 2);
        assert_eq!(normalized(&dag, &[b2, b6]).unwrap(), set(&[b2, b6]));
        assert_eq!(normalized(&dag, &[b3, b6]).unwrap(), set(&[b3, b6]));
        assert_eq!(normalized(&dag, &[b2, b7]).unwrap(), set(&[b2, b7]));
        assert_eq!(normalized(&dag, &[b3, b7]).unwrap(), set(&[b3, b7]));
        assert!(normalized(&dag, &[b6, b7]).is_err());
        assert_eq!(normalized(&dag, &[b4, b6]).unwrap(), set(&[b4, b6]));
        assert_eq!(normalized(&dag, &[b5, b6]).unwrap(), set(&[b5, b6]));
        assert_eq!(normalized(&dag, &[b4, b7]).unwrap(), set(&[b4, b7]));
        assert_eq!(normalized(&dag, &[b5, b7]).unwrap(), set(&[b5, b7]));

        let a8 = aggregate(&dag, &[b4, b6]);
        assert_eq!(normalized(&dag, &[a8, m]).unwrap(), set(&[b4, b6]));
        assert_eq!(normalized(&dag, &[a8, b2]).unwrap(), set(&[b4, b6]));
        assert!(normalized(&dag, &[a8, b3]).is_err());
        assert!(normalized(&dag, &[a8, b5]).is_err());
        assert!(normalized(&dag, &[a8, b7]).is_err());

        // 6 and 7 conflict
        let err = dag.retrieve_aggregated_branch(&set(&[a8, b7])).unwrap_err();
        assert!(err.is_conflict());

        let a9 = aggregate(&dag, &[b5, b7]);
        assert_eq!(normalized(&dag, &[a9, m]).unwrap(), set(&[b5, b7]));
        assert!(normalized(&dag, &[a8, a9]).is_err());
        assert!(normalized(&dag, &[b3, a9]).is_err());

        let a10 = aggregate(&dag, &[b3, b6]);
        assert_eq!(normalized(&dag, &[a10, m]).unwrap(), set(&[b3, b6]));
        assert!(normalized(&dag, &[a8, a10]).is_err());
        assert!(normalized(&dag, &[a9, a10]).is_err());

        let b11 = conflict_branch(&dag, 11, &[m], 3);
        let b12 = conflict_branch(&dag, 12, &[m], 3);
        assert_eq!(normalized(&dag, &[m, b11]).unwrap(), set(&[b11]));
        assert_eq!(normalized(&dag, &[m, b12]).unwrap(), set(&[b12]));
        assert!(normalized(&dag, &[b11, b12]).is_err());

        let a13 = aggregate(&dag, &[b6, b11]);
        assert!(normalized(&dag, &[a13, a9]).is_err());
        assert_eq!(normalized(&dag, &[a13, a8]).unwrap(), set(&[b4, b6, b11]));
        assert_eq!(normalized(&dag, &[a13, a10]).unwrap(), set(&[b3, b6, b11]));

        let a14 = aggregate(&dag, &[a10, a13]);
        // 7 (via 9) conflicts with ancestor 6 of 14
        assert!(normalized(&dag, &[a14, a9]).is_err());
        // ancestor 2 (via 8) conflicts with 3
        assert!(normalized(&dag, &[a14, a8]).is_err());

        let a15 = aggregate(&dag, &[b2, b7, b12]);
        assert!(normalized(&dag, &[a15, a13]).is_err());
        assert!(normalized(&dag, &[a15, a10]).is_err());
        assert!(normalized(&dag, &[a15, a8]).is_err());

        let a16 = aggregate(&dag, &[a15, a9]);
        assert_eq!(normalized(&dag, &[a16, a9]).unwrap(), set(&[b5, b7, b12]));
        assert_eq!(normalized(&dag, &[a16, b7]).unwrap(), set(&[b5, b7, b12]));
        assert!(normalized(&dag, &[a16, a13]).is_err());
        assert!(normalized(&dag, &[a16, a14]).is_err());
        assert!(normalized(&dag, &[a16, a8]).is_err());
    }

    #[test]
    fn conflicting_error_names_both_branches() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 0);

        match normalized(&dag, &[b2, b3]).unwrap_err() {
            BranchDagError::BranchesConflicting {
                first,
                second,
                conflict,
            } => {
                assert_eq!(set(&[first, second]), set(&[b2, b3]));
                assert_eq!(conflict, cid(0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // -----------------------------------------------------------------------
    // Preference
    // -----------------------------------------------------------------------

    #[test]
    fn set_branch_preferred() {
        let dag = setup();
        let mut stream = dag.subscribe(EventFilter::all());

        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 0);
        assert!(!voting(&dag, b2).preferred && !voting(&dag, b2).liked);
        assert!(!voting(&dag, b3).preferred && !voting(&dag, b3).liked);

        let b4 = conflict_branch(&dag, 4, &[b2], 1);
        let b5 = conflict_branch(&dag, 5, &[b2], 1);
        assert!(events(&mut stream).is_empty());

        // branch 4 is preferred but not liked, its parent is not liked
        assert!(dag.set_branch_preferred(&b4, true).unwrap());
        assert_eq!(events(&mut stream), [ev(BranchEventKind::Preferred, b4)].into_iter().collect());
        assert!(voting(&dag, b4).preferred);
        assert!(!voting(&dag, b4).liked);
        assert!(!voting(&dag, b5).preferred);

        // preferring branch 2 likes it and propagates to branch 4 only
        assert!(dag.set_branch_preferred(&b2, true).unwrap());
        assert_eq!(
            events(&mut stream),
            [
                ev(BranchEventKind::Preferred, b2),
                ev(BranchEventKind::Liked, b2),
                ev(BranchEventKind::Liked, b4),
            ]
            .into_iter()
            .collect()
        );
        assert!(voting(&dag, b2).liked);
        assert!(voting(&dag, b4).liked);
        assert!(!voting(&dag, b5).liked);

        // branch 5 takes over from branch 4
        assert!(dag.set_branch_preferred(&b5, true).unwrap());
        assert_eq!(
            events(&mut stream),
            [
                ev(BranchEventKind::Preferred, b5),
                ev(BranchEventKind::Liked, b5),
                ev(BranchEventKind::Unpreferred, b4),
                ev(BranchEventKind::Disliked, b4),
            ]
            .into_iter()
            .collect()
        );
        assert!(voting(&dag, b2).liked && voting(&dag, b2).preferred);
        assert!(!voting(&dag, b4).liked && !voting(&dag, b4).preferred);
        assert!(voting(&dag, b5).liked && voting(&dag, b5).preferred);

        // no change, no events
        assert!(!dag.set_branch_preferred(&b5, true).unwrap());
        assert!(events(&mut stream).is_empty());
    }

    #[test]
    fn unpreferring_a_parent_dislikes_descendants() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b4 = conflict_branch(&dag, 4, &[b2], 1);
        let b6 = conflict_branch(&dag, 6, &[BranchId::MASTER], 2);
        let a = aggregate(&dag, &[b4, b6]);
        for id in [b2, b4, b6] {
            dag.set_branch_preferred(&id, true).unwrap();
        }
        assert!(voting(&dag, a).liked);
        assert!(voting(&dag, a).preferred);

        let mut stream = dag.subscribe(EventFilter::kinds([BranchEventKind::Disliked]));
        dag.set_branch_preferred(&b2, false).unwrap();
        assert_eq!(
            events(&mut stream),
            [
                ev(BranchEventKind::Disliked, b2),
                ev(BranchEventKind::Disliked, b4),
                ev(BranchEventKind::Disliked, a),
            ]
            .into_iter()
            .collect()
        );
        // preference of 4 is kept, only the liked state is inherited
        assert!(voting(&dag, b4).preferred);
        assert!(voting(&dag, a).preferred);
    }

    #[test]
    fn opinion_on_master_and_aggregated_is_fixed() {
        let dag = setup();
        assert!(!dag.set_branch_preferred(&BranchId::MASTER, true).unwrap());
        assert!(matches!(
            dag.set_branch_preferred(&BranchId::MASTER, false),
            Err(BranchDagError::MasterBranchImmutable)
        ));
        assert!(matches!(
            dag.set_branch_finalized(&BranchId::MASTER, false),
            Err(BranchDagError::MasterBranchImmutable)
        ));

        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b6 = conflict_branch(&dag, 6, &[BranchId::MASTER], 2);
        let a = aggregate(&dag, &[b2, b6]);
        assert!(matches!(
            dag.set_branch_preferred(&a, true),
            Err(BranchDagError::AggregatedBranchOpinion(id)) if id == a
        ));
        assert!(matches!(
            dag.set_branch_preferred(&bid(99), true),
            Err(BranchDagError::BranchNotFound(_))
        ));
    }

    #[test]
    fn joining_a_conflict_set_drops_preference() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 1);
        dag.set_branch_preferred(&b2, true).unwrap();
        dag.set_branch_preferred(&b3, true).unwrap();

        // branch 3 now also spends the output behind conflict 0
        let (_, created) = dag
            .retrieve_conflict_branch(b3, &set(&[BranchId::MASTER]), &conflicts(&[0, 1]))
            .unwrap();
        assert!(!created);
        assert!(voting(&dag, b2).liked);
        assert!(!voting(&dag, b3).preferred);
        assert!(!voting(&dag, b3).liked);
    }

    #[test]
    fn finalized_branch_joining_a_conflict_set_rejects_rivals() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b7 = conflict_branch(&dag, 7, &[BranchId::MASTER], 1);
        let b8 = conflict_branch(&dag, 8, &[b7], 2);
        dag.set_branch_preferred(&b2, true).unwrap();
        dag.set_branch_preferred(&b7, true).unwrap();
        dag.set_branch_preferred(&b8, true).unwrap();
        dag.set_branch_finalized(&b2, true).unwrap();
        assert!(voting(&dag, b8).liked);

        dag.retrieve_conflict_branch(b2, &set(&[BranchId::MASTER]), &conflicts(&[0, 1]))
            .unwrap();
        assert!(voting(&dag, b2).liked);
        assert!(voting(&dag, b2).preferred);
        assert!(!voting(&dag, b7).preferred);
        assert!(!voting(&dag, b7).liked);
        assert_eq!(voting(&dag, b7).inclusion, InclusionState::Rejected);
        assert!(!voting(&dag, b8).liked);

        let liked: Vec<_> = dag
            .conflict_members(&cid(1))
            .unwrap()
            .into_iter()
            .filter(|member| voting(&dag, *member).liked)
            .collect();
        assert_eq!(liked, vec![b2]);
    }

    #[test]
    fn two_finalized_winners_cannot_share_a_conflict_set() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 1);
        for b in [b2, b3] {
            dag.set_branch_preferred(&b, true).unwrap();
            dag.set_branch_finalized(&b, true).unwrap();
        }

        assert!(matches!(
            dag.retrieve_conflict_branch(b2, &set(&[BranchId::MASTER]), &conflicts(&[0, 1])),
            Err(BranchDagError::ConflictsWithFinalized { branch, finalized }) if branch == b2 && finalized == b3
        ));
        assert!(dag.conflict_members(&cid(1)).unwrap().contains(&b3));
        assert!(!dag.conflict_members(&cid(1)).unwrap().contains(&b2));
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    #[test]
    fn finalizing_confirms_winner_and_rejects_rivals() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b3 = conflict_branch(&dag, 3, &[BranchId::MASTER], 0);
        let b4 = conflict_branch(&dag, 4, &[b3], 1);
        dag.set_branch_preferred(&b2, true).unwrap();

        let mut stream = dag.subscribe(EventFilter::all());
        assert!(dag.set_branch_finalized(&b2, true).unwrap());
        assert_eq!(
            events(&mut stream),
            [
                ev(BranchEventKind::Finalized, b2),
                ev(BranchEventKind::Confirmed, b2),
                ev(BranchEventKind::Finalized, b3),
                ev(BranchEventKind::Rejected, b3),
                ev(BranchEventKind::Rejected, b4),
            ]
            .into_iter()
            .collect()
        );
        assert_eq!(voting(&dag, b2).inclusion, InclusionState::Confirmed);
        assert_eq!(voting(&dag, b3).inclusion, InclusionState::Rejected);
        assert_eq!(voting(&dag, b4).inclusion, InclusionState::Rejected);
        assert!(!voting(&dag, b4).finalized);

        assert!(matches!(
            dag.set_branch_preferred(&b3, true),
            Err(BranchDagError::FinalizedBranch(id)) if id == b3
        ));
        assert!(matches!(
            dag.set_branch_preferred(&b2, false),
            Err(BranchDagError::FinalizedBranch(_))
        ));
    }

    #[test]
    fn unfinalizing_returns_to_pending() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        dag.set_branch_preferred(&b2, true).unwrap();
        dag.set_branch_finalized(&b2, true).unwrap();
        assert!(voting(&dag, b2).confirmed());

        let mut stream = dag.subscribe(EventFilter::all());
        assert!(dag.set_branch_finalized(&b2, false).unwrap());
        assert_eq!(
            events(&mut stream),
            [
                ev(BranchEventKind::Unfinalized, b2),
                ev(BranchEventKind::Pending, b2),
            ]
            .into_iter()
            .collect()
        );
        assert!(!dag.set_branch_finalized(&b2, false).unwrap());
    }

    #[test]
    fn preferring_against_finalized_rival_fails() {
        let dag = setup();
        let b6 = conflict_branch(&dag, 6, &[BranchId::MASTER], 2);
        dag.set_branch_preferred(&b6, true).unwrap();
        dag.set_branch_finalized(&b6, true).unwrap();

        let b8 = conflict_branch(&dag, 8, &[BranchId::MASTER], 2);
        assert!(matches!(
            dag.set_branch_preferred(&b8, true),
            Err(BranchDagError::ConflictsWithFinalized { branch, finalized }) if branch == b8 && finalized == b6
        ));
        assert!(!voting(&dag, b8).preferred);
        assert!(voting(&dag, b6).confirmed());
    }

    // -----------------------------------------------------------------------
    // Elevation
    // -----------------------------------------------------------------------

    #[test]
    fn elevate_conflict_branch_moves_child_edge() {
        let dag = setup();
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b9 = conflict_branch(&dag, 9, &[b2], 5);
        let b10 = conflict_branch(&dag, 10, &[b2], 6);
        dag.set_branch_preferred(&b2, true).unwrap();
        dag.set_branch_preferred(&b9, true).unwrap();
        assert!(voting(&dag, b9).liked);

        let mut stream = dag.subscribe(EventFilter::all());
        assert!(dag.elevate_conflict_branch(&b9, &b2, &b10).unwrap());
        assert_eq!(events(&mut stream), [ev(BranchEventKind::Disliked, b9)].into_iter().collect());

        let branch = dag.branch(&b9).unwrap().unwrap();
        assert_eq!(branch.read().parents(), &set(&[b10]));
        let children_of_2: Vec<BranchId> = dag.child_branches(&b2).unwrap().iter().map(|e| e.child).collect();
        assert_eq!(children_of_2, vec![b10]);
        let children_of_10: Vec<BranchId> = dag.child_branches(&b10).unwrap().iter().map(|e| e.child).collect();
        assert_eq!(children_of_10, vec![b9]);

        assert!(!dag.elevate_conflict_branch(&b9, &b2, &b10).unwrap());
    }

    // -----------------------------------------------------------------------
    // Concurrency and persistence
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_retrieval_creates_once() {
        let dag = Arc::new(setup());
        let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
        let b6 = conflict_branch(&dag, 6, &[BranchId::MASTER], 2);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let dag = dag.clone();
                thread::spawn(move || {
                    let (_, conflict_created) = dag
                        .retrieve_conflict_branch(bid(20), &set(&[BranchId::MASTER]), &conflicts(&[9]))
                        .unwrap();
                    let (_, aggregated_created) = dag.retrieve_aggregated_branch(&set(&[b2, b6])).unwrap();
                    (usize::from(conflict_created), usize::from(aggregated_created))
                })
            })
            .collect();

        let (conflict_created, aggregated_created) = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .fold((0, 0), |acc, (c, a)| (acc.0 + c, acc.1 + a));
        assert_eq!(conflict_created, 1);
        assert_eq!(aggregated_created, 1);
        assert_eq!(dag.conflict_members(&cid(9)).unwrap(), set(&[bid(20)]));
    }

    #[test]
    fn state_survives_reopen() {
        let backend: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        {
            let dag = BranchDag::new(backend.clone(), &BranchDagConfig::default()).unwrap();
            let b2 = conflict_branch(&dag, 2, &[BranchId::MASTER], 0);
            conflict_branch(&dag, 3, &[BranchId::MASTER], 0);
            dag.set_branch_preferred(&b2, true).unwrap();
            dag.shutdown().unwrap();
        }

        let dag = BranchDag::new(backend, &BranchDagConfig::default()).unwrap();
        assert!(voting(&dag, bid(2)).liked);
        assert!(!voting(&dag, bid(3)).preferred);
        assert_eq!(dag.conflict_members(&cid(0)).unwrap(), set(&[bid(2), bid(3)]));
        assert_eq!(dag.child_branches(&BranchId::MASTER).unwrap().len(), 2);
        assert!(normalized(&dag, &[bid(2), bid(3)]).is_err());
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    /// 2/3 conflict below master, 4/5 conflict below 2, 6/7 conflict below
    /// master, plus the aggregation of 4 and 6.
    fn sample_dag() -> (BranchDag, Vec<BranchId>) {
        let dag = setup();
        let m = BranchId::MASTER;
        let b2 = conflict_branch(&dag, 2, &[m], 0);
        conflict_branch(&dag, 3, &[m], 0);
        let b4 = conflict_branch(&dag, 4, &[b2], 1);
        conflict_branch(&dag, 5, &[b2], 1);
        let b6 = conflict_branch(&dag, 6, &[m], 2);
        conflict_branch(&dag, 7, &[m], 2);
        let a = aggregate(&dag, &[b4, b6]);
        let all = (2..=7).map(bid).chain([a]).collect();
        (dag, all)
    }

    fn assert_opinion_consistent(dag: &BranchDag, all: &[BranchId]) {
        for id in all {
            let branch = dag.branch(id).unwrap().unwrap().snapshot();
            let parents: Vec<VotingState> = branch.parents().iter().map(|p| voting(dag, *p)).collect();
            assert_eq!(*branch.voting(), branch.derive_voting(&parents), "stale opinion on {id:?}");
            if branch.liked() {
                assert!(parents.iter().all(|p| p.liked));
            }
        }
        for conflict in 0..3 {
            let members = dag.conflict_members(&cid(conflict)).unwrap();
            let liked = members.iter().filter(|m| voting(dag, **m).liked).count();
            let preferred = members.iter().filter(|m| voting(dag, **m).preferred).count();
            assert!(liked <= 1);
            assert!(preferred <= 1);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn preference_changes_keep_opinion_consistent(
            ops in proptest::collection::vec((2u8..=7, any::<bool>()), 1..24)
        ) {
            let (dag, all) = sample_dag();
            for (branch, preferred) in ops {
                dag.set_branch_preferred(&bid(branch), preferred).unwrap();
            }
            assert_opinion_consistent(&dag, &all);
        }

        #[test]
        fn normalization_ignores_redundant_members(extra in proptest::collection::vec(0usize..3, 0..4)) {
            let (dag, _) = sample_dag();
            let base = [bid(4), bid(6)];
            let redundant = [BranchId::MASTER, bid(2), BranchId::aggregated(&set(&base))];
            let mut ids: Vec<BranchId> = base.to_vec();
            ids.extend(extra.iter().map(|i| redundant[*i]));
            prop_assert_eq!(normalized(&dag, &ids).unwrap(), set(&base));
        }
    }
}
