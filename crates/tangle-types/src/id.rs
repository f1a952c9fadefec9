//! Fixed-size 32-byte identifiers.
//!
//! All identifiers share the same shape (a BLAKE3-sized byte array) and the
//! same hex helpers; [`hash_id!`] stamps them out so the semantic types stay
//! distinct at compile time.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::OutputId;
use crate::error::TypeError;

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create the identifier from a pre-computed hash.
            pub const fn from_hash(hash: [u8; 32]) -> Self {
                Self(hash)
            }

            /// The raw 32-byte value.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Hex-encoded string representation.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Short hex representation (first 8 characters).
            pub fn short_hex(&self) -> String {
                hex::encode(&self.0[..4])
            }

            /// Parse from a 64 character hex string.
            pub fn from_hex(s: &str) -> Result<Self, TypeError> {
                let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
                if bytes.len() != 32 {
                    return Err(TypeError::InvalidLength {
                        expected: 32,
                        actual: bytes.len(),
                    });
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.short_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

hash_id!(
    /// Content hash of a transaction essence (inputs and outputs).
    TransactionId,
    "TransactionId"
);

hash_id!(
    /// Identifier of a payload that attaches a transaction to the tangle.
    PayloadId,
    "PayloadId"
);

hash_id!(
    /// Identifier of a branch in the branch DAG.
    ///
    /// Conflict branches reuse the id of the transaction that created them;
    /// aggregated branches hash their sorted parent set.
    BranchId,
    "BranchId"
);

hash_id!(
    /// Identifier of a conflict set, derived from the output being contested.
    ConflictId,
    "ConflictId"
);

/// An ordered set of branch ids. Ordering makes derived identities
/// independent of insertion order.
pub type BranchIds = BTreeSet<BranchId>;

/// An ordered set of conflict ids.
pub type ConflictIds = BTreeSet<ConflictId>;

impl TransactionId {
    /// Source id of outputs created by the genesis snapshot.
    pub const GENESIS: Self = Self([0u8; 32]);

    /// Derive a transaction id from the serialized transaction essence.
    pub fn from_essence(essence: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tangle-transaction-v1:");
        hasher.update(essence);
        Self(*hasher.finalize().as_bytes())
    }

    /// A random transaction id for tests and demos.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }
}

impl PayloadId {
    /// The payload every tangle starts from.
    pub const GENESIS: Self = Self([0u8; 32]);

    /// Derive a payload id from its serialized content.
    pub fn from_essence(essence: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tangle-payload-v1:");
        hasher.update(essence);
        Self(*hasher.finalize().as_bytes())
    }

    /// A random payload id for tests and demos.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }
}

impl BranchId {
    /// Sentinel for "not booked yet". Never stored as a branch.
    pub const UNDEFINED: Self = Self([0u8; 32]);

    /// The root of the branch DAG.
    pub const MASTER: Self = {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        Self(bytes)
    };

    /// Returns `true` for the undefined sentinel.
    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }

    /// Returns `true` for the master branch.
    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }

    /// Identity of the aggregated branch combining `parents`.
    ///
    /// The set is iterated in sorted order, so the same parents always yield
    /// the same id regardless of how the caller assembled them.
    pub fn aggregated(parents: &BranchIds) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tangle-aggregated-branch-v1:");
        for parent in parents {
            hasher.update(parent.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl From<TransactionId> for BranchId {
    fn from(id: TransactionId) -> Self {
        Self(*id.as_bytes())
    }
}

impl From<OutputId> for ConflictId {
    fn from(output: OutputId) -> Self {
        Self::from(&output)
    }
}

impl From<&OutputId> for ConflictId {
    fn from(output: &OutputId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tangle-conflict-v1:");
        hasher.update(&output.to_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use proptest::prelude::*;

    fn branch(byte: u8) -> BranchId {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        BranchId::from_hash(bytes)
    }

    #[test]
    fn reserved_branch_ids_are_distinct() {
        assert!(BranchId::UNDEFINED.is_undefined());
        assert!(BranchId::MASTER.is_master());
        assert_ne!(BranchId::UNDEFINED, BranchId::MASTER);
        assert!(!BranchId::MASTER.is_undefined());
    }

    #[test]
    fn branch_id_from_transaction_keeps_bytes() {
        let tx = TransactionId::random();
        assert_eq!(BranchId::from(tx).as_bytes(), tx.as_bytes());
    }

    #[test]
    fn conflict_id_is_derived_deterministically() {
        let output = OutputId::new(Address::from_hash([7; 32]), TransactionId::from_hash([9; 32]));
        assert_eq!(ConflictId::from(&output), ConflictId::from(output));

        let other = OutputId::new(Address::from_hash([7; 32]), TransactionId::from_hash([8; 32]));
        assert_ne!(ConflictId::from(&output), ConflictId::from(&other));
    }

    #[test]
    fn aggregated_id_differs_from_parents() {
        let parents: BranchIds = [branch(2), branch(6)].into_iter().collect();
        let aggregated = BranchId::aggregated(&parents);
        assert!(!parents.contains(&aggregated));
        assert_ne!(aggregated, BranchId::MASTER);
    }

    #[test]
    fn hex_roundtrip() {
        let id = TransactionId::from_essence(b"essence");
        assert_eq!(TransactionId::from_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(id.short_hex().len(), 8);
    }

    #[test]
    fn payload_and_transaction_ids_are_domain_separated() {
        let payload = PayloadId::from_essence(b"essence");
        assert_eq!(payload, PayloadId::from_essence(b"essence"));
        assert_ne!(payload.as_bytes(), TransactionId::from_essence(b"essence").as_bytes());
        assert_ne!(payload, PayloadId::GENESIS);
    }

    #[test]
    fn from_hex_rejects_short_input() {
        let err = BranchId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
    }

    #[test]
    fn debug_uses_label() {
        let debug = format!("{:?}", BranchId::MASTER);
        assert!(debug.starts_with("BranchId("));
    }

    #[test]
    fn bincode_roundtrip() {
        let id = ConflictId::from_hash([3; 32]);
        let bytes = bincode::serialize(&id).unwrap();
        let decoded: ConflictId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(id, decoded);
    }

    proptest! {
        #[test]
        fn aggregated_id_ignores_insertion_order(mut raw in proptest::collection::vec(1u8..=255, 2..8)) {
            let forward: BranchIds = raw.iter().map(|b| branch(*b)).collect();
            raw.reverse();
            let backward: BranchIds = raw.iter().map(|b| branch(*b)).collect();
            prop_assert_eq!(BranchId::aggregated(&forward), BranchId::aggregated(&backward));
        }
    }
}
