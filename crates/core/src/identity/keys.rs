use ed25519_dalek::{SigningKey, VerifyingKey};
use onioncirc_common::{RelayId, RelayInfo};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::SocketAddr;
use x25519_dalek::{PublicKey, StaticSecret};

/// Long-term keys held by a relay: the identity key whose digest names the
/// relay, and the two onion keys used to answer CREATE cells.
pub struct RelayKeys {
    identity: SigningKey,
    legacy_onion: StaticSecret,
    ntor_onion: StaticSecret,
}

impl RelayKeys {
    /// Generate a fresh set of relay keys
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let mut secret_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_bytes);
        let identity = SigningKey::from_bytes(&secret_bytes);

        Self {
            identity,
            legacy_onion: StaticSecret::random_from_rng(OsRng),
            ntor_onion: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild keys from stored secrets
    pub fn from_secret_bytes(identity: &[u8; 32], legacy_onion: [u8; 32], ntor_onion: [u8; 32]) -> Self {
        Self {
            identity: SigningKey::from_bytes(identity),
            legacy_onion: StaticSecret::from(legacy_onion),
            ntor_onion: StaticSecret::from(ntor_onion),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.identity.verifying_key()
    }

    /// SHA-1 digest of the identity key
    pub fn identity_digest(&self) -> RelayId {
        let digest = Sha1::digest(self.verifying_key().as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        RelayId::from(out)
    }

    pub fn legacy_onion_public(&self) -> [u8; 32] {
        *PublicKey::from(&self.legacy_onion).as_bytes()
    }

    pub fn ntor_onion_public(&self) -> [u8; 32] {
        *PublicKey::from(&self.ntor_onion).as_bytes()
    }

    pub(crate) fn legacy_onion_secret(&self) -> &StaticSecret {
        &self.legacy_onion
    }

    pub(crate) fn ntor_onion_secret(&self) -> &StaticSecret {
        &self.ntor_onion
    }

    /// Directory entry advertising these keys at `or_addr`
    pub fn describe(&self, nickname: impl Into<String>, or_addr: SocketAddr) -> RelayInfo {
        let mut info = RelayInfo::new(self.identity_digest(), nickname, or_addr);
        info.onion_key = Some(self.legacy_onion_public());
        info.ntor_onion_key = Some(self.ntor_onion_public());
        info.supports_extend2 = true;
        info
    }
}

impl fmt::Debug for RelayKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayKeys")
            .field("identity", &self.identity_digest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_digest_is_stable() {
        let keys = RelayKeys::from_secret_bytes(&[1u8; 32], [2u8; 32], [3u8; 32]);
        let again = RelayKeys::from_secret_bytes(&[1u8; 32], [2u8; 32], [3u8; 32]);
        assert_eq!(keys.identity_digest(), again.identity_digest());
        assert!(!keys.identity_digest().is_zero());
    }

    #[test]
    fn test_distinct_onion_keys() {
        let keys = RelayKeys::generate();
        assert_ne!(keys.legacy_onion_public(), keys.ntor_onion_public());
    }

    #[test]
    fn test_describe() {
        let keys = RelayKeys::generate();
        let addr: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let info = keys.describe("alpha", addr);
        assert_eq!(info.identity, keys.identity_digest());
        assert_eq!(info.ntor_onion_key, Some(keys.ntor_onion_public()));
        assert!(info.supports_extend2);
    }
}
