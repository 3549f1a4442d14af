//! Content addresses
//!
//! Every payload in the store is named by the BLAKE3 hash of its bytes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of an address in bytes
pub const ADDRESS_SIZE: usize = 32;

/// Address parse errors
#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    #[error("invalid hex in address: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("address must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// BLAKE3 content address (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// Nil address (denotes "no data")
    pub const NIL: Address = Address([0u8; ADDRESS_SIZE]);

    /// Create an address from raw bytes
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Address(bytes)
    }

    /// Compute the address of a payload
    pub fn of(data: &[u8]) -> Self {
        Address(blake3::hash(data).into())
    }

    /// Convert to lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex. The whole string must be exactly 64 hex digits.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        if s.len() != ADDRESS_SIZE * 2 {
            return Err(AddressError::InvalidLength {
                expected: ADDRESS_SIZE * 2,
                actual: s.len(),
            });
        }
        let mut arr = [0u8; ADDRESS_SIZE];
        hex::decode_to_slice(s, &mut arr)?;
        Ok(Address(arr))
    }

    /// Check if this is the nil address
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
