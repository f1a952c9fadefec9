//! Foundation types for the tangle ledger.
//!
//! This crate provides the identifiers and value primitives shared by the
//! branch DAG and the booking engine. Every other tangle crate depends on
//! `tangle-types`.
//!
//! # Key Types
//!
//! - [`BranchId`] -- identity of a branch (one consistent view of the ledger)
//! - [`ConflictId`] -- identity of a conflict set, derived from a contested output
//! - [`TransactionId`] -- content hash of a transaction essence
//! - [`OutputId`] -- `(address, transaction)` pair addressing a single output
//! - [`Color`] / [`Balance`] -- colored token amounts

pub mod address;
pub mod balance;
pub mod error;
pub mod id;

pub use address::{Address, OutputId};
pub use balance::{Balance, Color};
pub use error::TypeError;
pub use id::{BranchId, BranchIds, ConflictId, ConflictIds, PayloadId, TransactionId};
