use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::TransactionId;

/// A ledger address that outputs are sent to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 32]);

impl Address {
    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// A random address for tests and demos.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifies a single output: the address it was sent to and the
/// transaction that created it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputId {
    pub address: Address,
    pub transaction_id: TransactionId,
}

impl OutputId {
    /// Serialized length of an output id.
    pub const LENGTH: usize = 64;

    pub fn new(address: Address, transaction_id: TransactionId) -> Self {
        Self {
            address,
            transaction_id,
        }
    }

    /// Address bytes followed by transaction id bytes. Used as storage key,
    /// so outputs of one address share a prefix.
    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[..32].copy_from_slice(self.address.as_bytes());
        bytes[32..].copy_from_slice(self.transaction_id.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        if bytes.len() != Self::LENGTH {
            return Err(TypeError::InvalidLength {
                expected: Self::LENGTH,
                actual: bytes.len(),
            });
        }
        let mut address = [0u8; 32];
        let mut transaction = [0u8; 32];
        address.copy_from_slice(&bytes[..32]);
        transaction.copy_from_slice(&bytes[32..]);
        Ok(Self::new(
            Address::from_hash(address),
            TransactionId::from_hash(transaction),
        ))
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OutputId({}:{})",
            self.address.short_hex(),
            self.transaction_id.short_hex()
        )
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.transaction_id)
    }
}
