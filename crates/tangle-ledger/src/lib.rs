//! Booking engine for the tangle ledger.
//!
//! Transactions consume outputs and create new ones. This crate stores them
//! in a UTXO index, checks that their inputs are solid and their values
//! balance, and books each of them into a branch of the
//! [`BranchDag`](tangle_branchdag::BranchDag): first spends inherit the
//! branch of what they consume, double spends get conflict branches of their
//! own and fork the transactions that spent the contested outputs first.
//!
//! # Key Types
//!
//! - [`Tangle`] -- the ledger context: storage, booking, forking, queries
//! - [`Transaction`] / [`Output`] / [`Consumer`] -- the UTXO model
//! - [`TransactionMetadata`] -- booking state of a transaction
//! - [`Payload`] / [`PayloadApprover`] -- the vertices carrying transactions
//! - [`TangleEvent`] -- booked, forked and invalid transactions
//! - [`LedgerConfig`] -- TOML-loadable settings

pub mod booking;
pub mod config;
pub mod error;
pub mod events;
pub mod metadata;
pub mod output;
pub mod payload;
pub mod tangle;
pub mod transaction;
pub mod utxo;

pub use booking::{check_transaction_outputs, BookingOutcome, ConsumedInputs, ForkOutcome};
pub use config::LedgerConfig;
pub use error::{LedgerError, LedgerResult};
pub use events::{TangleEvent, TangleEventKind};
pub use metadata::{Attachment, TransactionMetadata};
pub use output::{Consumer, Output};
pub use payload::{Payload, PayloadApprover, PayloadMetadata};
pub use tangle::{StoredTransaction, Tangle};
pub use transaction::{Outputs, Transaction};
pub use utxo::{Snapshot, UtxoIndex};
