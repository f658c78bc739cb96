use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod params;
pub mod policy;
pub mod relay_info;
pub mod types;

pub use config::{
    build_timeout, cells, path_bias, routing, CircuitConfig, ConfigError, PathBiasConfig,
};
pub use params::NetworkParams;
pub use policy::{ExitPolicy, PolicyAction, PolicyResult, PolicyRule};
pub use relay_info::{is_internal_addr, same_subnet_16, RelayInfo};
pub use types::{Bandwidth, Timestamp};

/// Length of a relay identity digest (SHA-1 of the identity key)
pub const DIGEST_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid relay id length: expected {expected}, got {actual}")]
    InvalidRelayId { expected: usize, actual: usize },
    #[error("invalid relay id hex: {0}")]
    InvalidRelayIdHex(String),
    #[error("invalid exit policy rule: {0}")]
    InvalidPolicy(String),
}

/// Identity fingerprint of a relay.
///
/// The all-zero digest is reserved for "identity unknown", which is only
/// legitimate for a first hop reached by address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RelayId([u8; DIGEST_LEN]);

impl RelayId {
    pub const ZERO: RelayId = RelayId([0u8; DIGEST_LEN]);

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != DIGEST_LEN {
            return Err(DomainError::InvalidRelayId {
                expected: DIGEST_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; DIGEST_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, DomainError> {
        let hex_str = hex_str.strip_prefix('$').unwrap_or(hex_str);
        let decoded = hex::decode(hex_str)
            .map_err(|err| DomainError::InvalidRelayIdHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        hex::encode_upper(&self.0[..4])
    }
}

impl fmt::Debug for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayId(${})", self.to_hex())
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.to_hex())
    }
}

impl From<[u8; DIGEST_LEN]> for RelayId {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for RelayId {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for RelayId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for RelayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RelayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_id_rejects_wrong_length() {
        let err = RelayId::try_from(&[1u8; 16][..]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidRelayId { .. }));
    }

    #[test]
    fn relay_id_parses_hex_roundtrip() {
        let hex_id = "AB".repeat(DIGEST_LEN);
        let parsed = RelayId::from_hex(&hex_id).expect("should parse valid hex");
        assert_eq!(parsed.to_hex(), hex_id);
        assert_eq!(parsed.to_string(), format!("${}", hex_id));
    }

    #[test]
    fn relay_id_accepts_dollar_prefix() {
        let hex_id = format!("${}", "01".repeat(DIGEST_LEN));
        let parsed: RelayId = hex_id.parse().unwrap();
        assert_eq!(parsed.as_bytes()[0], 1);
    }

    #[test]
    fn relay_id_rejects_bad_hex() {
        let err = RelayId::from_hex("not-hex").unwrap_err();
        assert!(matches!(err, DomainError::InvalidRelayIdHex(_)));
    }

    #[test]
    fn zero_relay_id() {
        assert!(RelayId::ZERO.is_zero());
        assert!(!RelayId::from([7u8; DIGEST_LEN]).is_zero());
    }

    #[test]
    fn relay_id_serializes_as_hex_string() {
        let id = RelayId::from([0xAAu8; DIGEST_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "AA".repeat(DIGEST_LEN)));
        let back: RelayId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
