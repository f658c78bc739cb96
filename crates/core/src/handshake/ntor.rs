//! ntor key agreement over curve25519 with HMAC-SHA256.
//!
//! Client message is `ID | B | X`, server reply is `Y | AUTH`.

use super::kdf::{expand_key_seed, hmac_sha256, KeyMaterial};
use super::HandshakeError;
use onioncirc_common::cells::{NTOR_ONIONSKIN_LEN, NTOR_REPLY_LEN};
use onioncirc_common::{RelayId, DIGEST_LEN};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";
const SERVER_STR: &[u8] = b"Server";

const KEY_LEN: usize = 32;

/// Client state between CREATE2 and CREATED2
pub struct NtorClient {
    relay_id: RelayId,
    relay_onion_key: PublicKey,
    x: StaticSecret,
    x_public: PublicKey,
}

impl NtorClient {
    pub fn start(relay_id: RelayId, relay_onion_key: [u8; 32]) -> (Self, Vec<u8>) {
        let x = StaticSecret::random_from_rng(OsRng);
        let x_public = PublicKey::from(&x);

        let mut onionskin = Vec::with_capacity(NTOR_ONIONSKIN_LEN);
        onionskin.extend_from_slice(relay_id.as_bytes());
        onionskin.extend_from_slice(&relay_onion_key);
        onionskin.extend_from_slice(x_public.as_bytes());

        (
            Self {
                relay_id,
                relay_onion_key: PublicKey::from(relay_onion_key),
                x,
                x_public,
            },
            onionskin,
        )
    }

    pub fn complete(self, reply: &[u8]) -> Result<KeyMaterial, HandshakeError> {
        if reply.len() < NTOR_REPLY_LEN {
            return Err(HandshakeError::BadReplyLength {
                expected: NTOR_REPLY_LEN,
                actual: reply.len(),
            });
        }
        let mut y = [0u8; KEY_LEN];
        y.copy_from_slice(&reply[..KEY_LEN]);
        let their_auth = &reply[KEY_LEN..NTOR_REPLY_LEN];
        let y = PublicKey::from(y);

        let xy = self.x.diffie_hellman(&y);
        let xb = self.x.diffie_hellman(&self.relay_onion_key);
        if !xy.was_contributory() || !xb.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }

        let (keys, auth) = derive(
            xy.as_bytes(),
            xb.as_bytes(),
            &self.relay_id,
            &self.relay_onion_key,
            &self.x_public,
            &y,
        )?;

        if !bool::from(auth[..].ct_eq(their_auth)) {
            return Err(HandshakeError::AuthFailed);
        }
        Ok(keys)
    }
}

/// Answer an ntor onionskin addressed to `our_id` and our ntor onion key
pub fn server(
    onionskin: &[u8],
    our_id: &RelayId,
    onion_secret: &StaticSecret,
) -> Result<(Vec<u8>, KeyMaterial), HandshakeError> {
    if onionskin.len() != NTOR_ONIONSKIN_LEN {
        return Err(HandshakeError::BadOnionskinLength {
            expected: NTOR_ONIONSKIN_LEN,
            actual: onionskin.len(),
        });
    }
    let (id, rest) = onionskin.split_at(DIGEST_LEN);
    let (b, x) = rest.split_at(KEY_LEN);

    let b_public = PublicKey::from(onion_secret);
    if id != our_id.as_bytes() || b != b_public.as_bytes() {
        return Err(HandshakeError::WrongRecipient);
    }

    let mut x_bytes = [0u8; KEY_LEN];
    x_bytes.copy_from_slice(x);
    let x_public = PublicKey::from(x_bytes);

    let y = StaticSecret::random_from_rng(OsRng);
    let y_public = PublicKey::from(&y);

    let xy = y.diffie_hellman(&x_public);
    let xb = onion_secret.diffie_hellman(&x_public);
    if !xy.was_contributory() || !xb.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }

    let (keys, auth) = derive(
        xy.as_bytes(),
        xb.as_bytes(),
        our_id,
        &b_public,
        &x_public,
        &y_public,
    )?;

    let mut reply = Vec::with_capacity(NTOR_REPLY_LEN);
    reply.extend_from_slice(y_public.as_bytes());
    reply.extend_from_slice(&auth);
    Ok((reply, keys))
}

/// Shared derivation: key block and the server's AUTH value
fn derive(
    xy: &[u8; 32],
    xb: &[u8; 32],
    id: &RelayId,
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<(KeyMaterial, [u8; 32]), HandshakeError> {
    let mut secret_input = Zeroizing::new(Vec::with_capacity(204));
    secret_input.extend_from_slice(xy);
    secret_input.extend_from_slice(xb);
    secret_input.extend_from_slice(id.as_bytes());
    secret_input.extend_from_slice(b.as_bytes());
    secret_input.extend_from_slice(x.as_bytes());
    secret_input.extend_from_slice(y.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = Zeroizing::new(hmac_sha256(T_KEY, &[secret_input.as_slice()])?);
    let verify = Zeroizing::new(hmac_sha256(T_VERIFY, &[secret_input.as_slice()])?);

    let auth = hmac_sha256(
        T_MAC,
        &[
            &verify[..],
            id.as_bytes(),
            b.as_bytes(),
            y.as_bytes(),
            x.as_bytes(),
            PROTOID,
            SERVER_STR,
        ],
    )?;

    let keys = expand_key_seed(&key_seed, M_EXPAND)?;
    Ok((keys, auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> (RelayId, StaticSecret) {
        (RelayId::from([0x42; 20]), StaticSecret::random_from_rng(OsRng))
    }

    #[test]
    fn test_ntor_agreement() {
        let (id, onion) = relay();
        let (client, onionskin) = NtorClient::start(id, *PublicKey::from(&onion).as_bytes());
        assert_eq!(onionskin.len(), NTOR_ONIONSKIN_LEN);
        assert_eq!(&onionskin[..20], id.as_bytes());

        let (reply, server_keys) = server(&onionskin, &id, &onion).unwrap();
        assert_eq!(reply.len(), NTOR_REPLY_LEN);

        let client_keys = client.complete(&reply).unwrap();
        assert_eq!(&client_keys[..], &server_keys[..]);
    }

    #[test]
    fn test_ntor_bad_auth() {
        let (id, onion) = relay();
        let (client, onionskin) = NtorClient::start(id, *PublicKey::from(&onion).as_bytes());
        let (mut reply, _) = server(&onionskin, &id, &onion).unwrap();
        reply[40] ^= 0xFF;
        assert!(matches!(
            client.complete(&reply),
            Err(HandshakeError::AuthFailed)
        ));
    }

    #[test]
    fn test_ntor_wrong_recipient() {
        let (id, onion) = relay();
        let (_, onionskin) = NtorClient::start(RelayId::from([1u8; 20]), *PublicKey::from(&onion).as_bytes());
        assert!(matches!(
            server(&onionskin, &id, &onion),
            Err(HandshakeError::WrongRecipient)
        ));
    }

    #[test]
    fn test_ntor_low_order_point() {
        let (id, onion) = relay();
        let (client, _) = NtorClient::start(id, *PublicKey::from(&onion).as_bytes());
        // The all-zero point yields an all-zero shared secret
        let reply = [0u8; NTOR_REPLY_LEN];
        assert!(matches!(
            client.complete(&reply),
            Err(HandshakeError::NonContributory)
        ));
    }
}
