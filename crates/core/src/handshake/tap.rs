use super::kdf::{kdf_tor_keys, KeyMaterial};
use super::HandshakeError;
use onioncirc_common::cells::TAP_ONIONSKIN_CHALLENGE_LEN;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const DH_LEN: usize = 32;
const KH_LEN: usize = 20;
/// Meaningful part of the legacy reply: `Y | KH`
pub const TAP_REPLY_LEN: usize = DH_LEN + KH_LEN;

/// Client state for the legacy handshake
pub struct TapClient {
    x: StaticSecret,
    onion_key: PublicKey,
}

impl TapClient {
    /// Returns the state and the padded onionskin carrying `X`
    pub fn start(onion_key: [u8; 32]) -> (Self, Vec<u8>) {
        let x = StaticSecret::random_from_rng(OsRng);
        let mut onionskin = vec![0u8; TAP_ONIONSKIN_CHALLENGE_LEN];
        onionskin[..DH_LEN].copy_from_slice(PublicKey::from(&x).as_bytes());
        rand::thread_rng().fill_bytes(&mut onionskin[DH_LEN..]);
        (
            Self {
                x,
                onion_key: PublicKey::from(onion_key),
            },
            onionskin,
        )
    }

    pub fn complete(self, reply: &[u8]) -> Result<KeyMaterial, HandshakeError> {
        if reply.len() < TAP_REPLY_LEN {
            return Err(HandshakeError::BadReplyLength {
                expected: TAP_REPLY_LEN,
                actual: reply.len(),
            });
        }
        let mut y = [0u8; DH_LEN];
        y.copy_from_slice(&reply[..DH_LEN]);
        let their_kh = &reply[DH_LEN..TAP_REPLY_LEN];

        let ephemeral = self.x.diffie_hellman(&PublicKey::from(y));
        let static_part = self.x.diffie_hellman(&self.onion_key);
        if !ephemeral.was_contributory() || !static_part.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }

        let mut k0 = Zeroizing::new(Vec::with_capacity(2 * DH_LEN));
        k0.extend_from_slice(ephemeral.as_bytes());
        k0.extend_from_slice(static_part.as_bytes());
        let (kh, keys) = kdf_tor_keys(&k0)?;

        if !bool::from(kh[..].ct_eq(their_kh)) {
            return Err(HandshakeError::KeyMismatch);
        }
        Ok(keys)
    }
}

/// Answer a legacy onionskin with our legacy onion key
pub fn server(
    onionskin: &[u8],
    onion_secret: &StaticSecret,
) -> Result<(Vec<u8>, KeyMaterial), HandshakeError> {
    if onionskin.len() != TAP_ONIONSKIN_CHALLENGE_LEN {
        return Err(HandshakeError::BadOnionskinLength {
            expected: TAP_ONIONSKIN_CHALLENGE_LEN,
            actual: onionskin.len(),
        });
    }
    let mut x = [0u8; DH_LEN];
    x.copy_from_slice(&onionskin[..DH_LEN]);
    let x = PublicKey::from(x);

    let y = StaticSecret::random_from_rng(OsRng);
    let ephemeral = y.diffie_hellman(&x);
    let static_part = onion_secret.diffie_hellman(&x);
    if !ephemeral.was_contributory() || !static_part.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let mut k0 = Zeroizing::new(Vec::with_capacity(2 * DH_LEN));
    k0.extend_from_slice(ephemeral.as_bytes());
    k0.extend_from_slice(static_part.as_bytes());
    let (kh, keys) = kdf_tor_keys(&k0)?;

    let mut reply = Vec::with_capacity(TAP_REPLY_LEN);
    reply.extend_from_slice(PublicKey::from(&y).as_bytes());
    reply.extend_from_slice(&kh);
    Ok((reply, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use onioncirc_common::cells::TAP_ONIONSKIN_REPLY_LEN;

    #[test]
    fn test_tap_agreement() {
        let onion = StaticSecret::random_from_rng(OsRng);
        let (client, onionskin) = TapClient::start(*PublicKey::from(&onion).as_bytes());
        assert_eq!(onionskin.len(), TAP_ONIONSKIN_CHALLENGE_LEN);

        let (mut reply, server_keys) = server(&onionskin, &onion).unwrap();
        // CREATED pads the reply; the client ignores the padding
        reply.resize(TAP_ONIONSKIN_REPLY_LEN, 0);

        let client_keys = client.complete(&reply).unwrap();
        assert_eq!(&client_keys[..], &server_keys[..]);
    }

    #[test]
    fn test_tap_wrong_onion_key() {
        let onion = StaticSecret::random_from_rng(OsRng);
        let other = StaticSecret::random_from_rng(OsRng);
        let (client, onionskin) = TapClient::start(*PublicKey::from(&other).as_bytes());
        let (reply, _) = server(&onionskin, &onion).unwrap();
        assert!(matches!(
            client.complete(&reply),
            Err(HandshakeError::KeyMismatch)
        ));
    }

    #[test]
    fn test_tap_short_onionskin() {
        let onion = StaticSecret::random_from_rng(OsRng);
        assert!(matches!(
            server(&[1u8; 40], &onion),
            Err(HandshakeError::BadOnionskinLength { .. })
        ));
    }
}
