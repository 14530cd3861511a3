//! Core types for TraceBlock

use crate::{BlockError, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Object identifier, ordered byte-lexicographically
///
/// Trace ids are 8 or 16 bytes in practice; anything empty or longer
/// than [`Id::MAX_LEN`] is rejected.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Bytes);

impl Id {
    /// Longest accepted identifier
    pub const MAX_LEN: usize = 64;

    /// Validate and copy an identifier from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::validate(bytes)?;
        Ok(Self(Bytes::copy_from_slice(bytes)))
    }

    /// Parse a hex encoded identifier
    pub fn parse_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| BlockError::InvalidArgument(format!("invalid hex id {:?}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }

    /// Check that raw bytes form a well-formed identifier
    pub fn validate(bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(BlockError::InvalidArgument("id must not be empty".into()));
        }
        if bytes.len() > Self::MAX_LEN {
            return Err(BlockError::InvalidArgument(format!(
                "id is {} bytes, max is {}",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        Ok(())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated id
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}
