//! Network-wide node identifiers.
//!
//! A [`NodeId`] is the opaque, immutable identifier that dedups peers across
//! every table in the core: peer proxies, message contexts, trackers, and the
//! bootstrap cache all key on it.

use std::fmt;
use thiserror::Error;

/// Minimum accepted identifier length in bytes.
pub const MIN_LEN: usize = 16;
/// Maximum accepted identifier length in bytes.
pub const MAX_LEN: usize = 32;
/// Length produced by [`NodeId::from_public_key`].
pub const DEFAULT_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier length {0} is below the minimum of {MIN_LEN} bytes")]
    TooShort(usize),
    #[error("identifier length {0} exceeds the maximum of {MAX_LEN} bytes")]
    TooLong(usize),
    #[error("identifier is not valid hex: {0}")]
    InvalidHex(String),
}

/// A network-wide opaque identifier, 16-32 bytes, immutable once constructed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    /// Builds an identifier from raw bytes, rejecting lengths outside [`MIN_LEN`, `MAX_LEN`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, IdentifierError> {
        let bytes = bytes.into();
        match bytes.len() {
            len if len < MIN_LEN => Err(IdentifierError::TooShort(len)),
            len if len > MAX_LEN => Err(IdentifierError::TooLong(len)),
            _ => Ok(Self(bytes)),
        }
    }

    /// Derives a stable identifier from a node's static public key material by hashing it with
    /// BLAKE3 and truncating to [`DEFAULT_LEN`] bytes.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = blake3::hash(public_key);
        Self(digest.as_bytes()[..DEFAULT_LEN].to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, IdentifierError> {
        let bytes = hex::decode(value).map_err(|e| IdentifierError::InvalidHex(e.to_string()))?;
        Self::new(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl std::str::FromStr for NodeId {
    type Err = IdentifierError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_lengths_outside_bounds() {
        assert_eq!(NodeId::new(vec![0u8; 4]), Err(IdentifierError::TooShort(4)));
        assert_eq!(NodeId::new(vec![0u8; 40]), Err(IdentifierError::TooLong(40)));
        assert!(NodeId::new(vec![0u8; 16]).is_ok());
        assert!(NodeId::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn derived_identifiers_are_stable_and_deterministic() {
        let a = NodeId::from_public_key(b"node-a-public-key");
        let b = NodeId::from_public_key(b"node-a-public-key");
        let c = NodeId::from_public_key(b"node-b-public-key");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), DEFAULT_LEN);
    }

    #[test]
    fn hex_round_trips() {
        let id = NodeId::from_public_key(b"some-key-material");
        let hex = id.to_hex();
        let parsed = NodeId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn equality_and_hash_are_the_dedup_key() {
        use std::collections::HashSet;
        let a = NodeId::new(vec![1u8; 16]).unwrap();
        let b = NodeId::new(vec![1u8; 16]).unwrap();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
