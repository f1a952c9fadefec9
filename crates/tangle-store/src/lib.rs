//! Keyed object storage for the tangle ledger.
//!
//! Entities (branches, outputs, transaction metadata, ...) are persisted in a
//! key/value backend and accessed through [`ObjectStorage`], which keeps one
//! decoded copy of each live entity in memory and hands out
//! reference-counted [`CachedObject`] handles to it.
//!
//! # Storage Backends
//!
//! All backends implement the [`KvStore`] trait:
//!
//! - [`InMemoryKvStore`] -- `BTreeMap`-based store for tests and embedding
//!
//! # Design Rules
//!
//! 1. One cache entry per key: every caller holding a handle sees the same value.
//! 2. Creation writes through to the backend immediately.
//! 3. Mutations made through [`CachedObject::write`] are persisted when the
//!    last handle is released, or on [`ObjectStorage::flush`].
//! 4. Releasing a handle is tied to `Drop`; there is no manual release call.
//! 5. Backend errors are propagated, never silently ignored (except inside
//!    `Drop`, where they are logged).

pub mod error;
pub mod memory;
pub mod object;
pub mod storage;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryKvStore;
pub use object::StorableObject;
pub use storage::{CachedObject, ObjectStorage};
pub use traits::KvStore;
