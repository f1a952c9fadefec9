use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::TransactionId;

/// Color of a token amount.
///
/// Two colors are reserved: [`Color::IOTA`] for uncolored tokens and
/// [`Color::NEW`], a marker in transaction outputs meaning "color these
/// tokens with the id of the transaction that creates them".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Color([u8; 32]);

impl Color {
    pub const IOTA: Self = Self([0u8; 32]);
    pub const NEW: Self = Self([0xff; 32]);

    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_iota(&self) -> bool {
        *self == Self::IOTA
    }

    pub fn is_new(&self) -> bool {
        *self == Self::NEW
    }
}

/// Minted tokens take the id of the minting transaction as their color.
impl From<TransactionId> for Color {
    fn from(id: TransactionId) -> Self {
        Self(*id.as_bytes())
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_iota() {
            write!(f, "Color(IOTA)")
        } else if self.is_new() {
            write!(f, "Color(NEW)")
        } else {
            write!(f, "Color({})", hex::encode(&self.0[..4]))
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_iota() {
            write!(f, "IOTA")
        } else if self.is_new() {
            write!(f, "NEW")
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

/// An amount of tokens of a single color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Balance {
    pub color: Color,
    pub value: i64,
}

impl Balance {
    pub fn new(color: Color, value: i64) -> Self {
        Self { color, value }
    }

    pub fn iota(value: i64) -> Self {
        Self::new(Color::IOTA, value)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.color)
    }
}
