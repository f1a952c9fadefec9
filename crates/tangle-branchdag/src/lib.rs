//! Branch DAG for the tangle ledger.
//!
//! A branch is one consistent view of the ledger. Double spends create
//! *conflict branches*, one per spending transaction; transactions that
//! consume outputs of several non-conflicting branches live in memoized
//! *aggregated branches*. This crate owns those branches, the conflict sets
//! that make them mutually exclusive, and the propagation of the local
//! opinion (preferred, liked, finalized, confirmed) through the DAG.
//!
//! # Key Types
//!
//! - [`BranchDag`] -- creation, normalization and opinion propagation
//! - [`Branch`] -- conflict or aggregated branch with its [`VotingState`]
//! - [`ConflictRegistry`] -- conflict set membership in both directions
//! - [`EventRouter`] -- typed event fan-out used for [`BranchDagEvent`]s

pub mod branch;
pub mod config;
pub mod conflict;
pub mod dag;
pub mod error;
pub mod events;

pub use branch::{Branch, BranchKind, ChildBranch, InclusionState, VotingState};
pub use config::BranchDagConfig;
pub use conflict::{BranchConflict, ConflictMember, ConflictRegistry};
pub use dag::BranchDag;
pub use error::{BranchDagError, BranchDagResult};
pub use events::{
    drain, BranchDagEvent, BranchEventKind, EventFilter, EventRouter, EventStream, RoutedEvent,
};
