use super::kdf::{kdf_tor_keys, KeyMaterial};
use super::HandshakeError;
use onioncirc_common::cells::{CREATED_FAST_LEN, CREATE_FAST_LEN};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Client state for a CREATE_FAST exchange
pub struct FastClient {
    x: Zeroizing<[u8; CREATE_FAST_LEN]>,
}

impl FastClient {
    /// Returns the state and the 20 random bytes to send
    pub fn start() -> (Self, Vec<u8>) {
        let mut x = Zeroizing::new([0u8; CREATE_FAST_LEN]);
        rand::thread_rng().fill_bytes(&mut x[..]);
        let onionskin = x.to_vec();
        (Self { x }, onionskin)
    }

    pub fn complete(self, reply: &[u8]) -> Result<KeyMaterial, HandshakeError> {
        if reply.len() < CREATED_FAST_LEN {
            return Err(HandshakeError::BadReplyLength {
                expected: CREATED_FAST_LEN,
                actual: reply.len(),
            });
        }
        let (y, their_kh) = reply[..CREATED_FAST_LEN].split_at(CREATE_FAST_LEN);

        let mut k0 = Zeroizing::new(Vec::with_capacity(2 * CREATE_FAST_LEN));
        k0.extend_from_slice(&self.x[..]);
        k0.extend_from_slice(y);
        let (kh, keys) = kdf_tor_keys(&k0)?;

        if !bool::from(kh[..].ct_eq(their_kh)) {
            return Err(HandshakeError::KeyMismatch);
        }
        Ok(keys)
    }
}

/// Answer a CREATE_FAST onionskin: returns `Y | KH` and the key block
pub fn server(onionskin: &[u8]) -> Result<(Vec<u8>, KeyMaterial), HandshakeError> {
    if onionskin.len() != CREATE_FAST_LEN {
        return Err(HandshakeError::BadOnionskinLength {
            expected: CREATE_FAST_LEN,
            actual: onionskin.len(),
        });
    }
    let mut y = [0u8; CREATE_FAST_LEN];
    rand::thread_rng().fill_bytes(&mut y);

    let mut k0 = Zeroizing::new(Vec::with_capacity(2 * CREATE_FAST_LEN));
    k0.extend_from_slice(onionskin);
    k0.extend_from_slice(&y);
    let (kh, keys) = kdf_tor_keys(&k0)?;

    let mut reply = Vec::with_capacity(CREATED_FAST_LEN);
    reply.extend_from_slice(&y);
    reply.extend_from_slice(&kh);
    Ok((reply, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_agreement() {
        let (client, onionskin) = FastClient::start();
        assert_eq!(onionskin.len(), CREATE_FAST_LEN);

        let (reply, server_keys) = server(&onionskin).unwrap();
        assert_eq!(reply.len(), CREATED_FAST_LEN);

        let client_keys = client.complete(&reply).unwrap();
        assert_eq!(&client_keys[..], &server_keys[..]);
    }

    #[test]
    fn test_fast_rejects_bad_kh() {
        let (client, onionskin) = FastClient::start();
        let (mut reply, _) = server(&onionskin).unwrap();
        reply[CREATED_FAST_LEN - 1] ^= 0x01;
        assert!(matches!(
            client.complete(&reply),
            Err(HandshakeError::KeyMismatch)
        ));
    }

    #[test]
    fn test_fast_short_reply() {
        let (client, _) = FastClient::start();
        assert!(matches!(
            client.complete(&[0u8; 10]),
            Err(HandshakeError::BadReplyLength { .. })
        ));
    }
}
