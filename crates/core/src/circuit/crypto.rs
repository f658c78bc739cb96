use crate::cell::{CellError, RelayMsg, DIGEST_OFFSET, RECOGNIZED_OFFSET};
use crate::handshake::KeyMaterial;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use onioncirc_common::DIGEST_LEN;
use sha1::{Digest, Sha1};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const CIPHER_KEY_LEN: usize = 16;
const DIGEST_FIELD_LEN: usize = 4;

/// Which end of a hop the keys are being set up for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoSide {
    /// The circuit's origin: sends forward, receives backward
    Client,
    /// The relay at that hop: receives forward, sends backward
    Relay,
}

/// Layer crypto for one hop: a stream cipher and a running digest for each
/// direction, named from the local point of view
pub struct HopCrypto {
    outbound_cipher: Aes128Ctr,
    inbound_cipher: Aes128Ctr,
    outbound_digest: Sha1,
    inbound_digest: Sha1,
}

impl HopCrypto {
    /// Split a key block `Df | Db | Kf | Kb` into layer state. The relay
    /// end uses the forward keys inbound and the backward keys outbound.
    pub fn new(keys: &KeyMaterial, side: CryptoSide) -> Self {
        let (df, rest) = keys.split_at(DIGEST_LEN);
        let (db, rest) = rest.split_at(DIGEST_LEN);
        let (kf, kb) = rest.split_at(CIPHER_KEY_LEN);

        let forward = (cipher(kf), seeded_digest(df));
        let backward = (cipher(kb), seeded_digest(db));

        let ((outbound_cipher, outbound_digest), (inbound_cipher, inbound_digest)) = match side {
            CryptoSide::Client => (forward, backward),
            CryptoSide::Relay => (backward, forward),
        };
        Self {
            outbound_cipher,
            inbound_cipher,
            outbound_digest,
            inbound_digest,
        }
    }

    /// Stamp a plaintext relay payload with our outbound digest
    pub fn set_digest(&mut self, payload: &mut [u8]) {
        payload[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_FIELD_LEN].fill(0);
        self.outbound_digest.update(&payload[..]);
        let digest = self.outbound_digest.clone().finalize();
        payload[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_FIELD_LEN]
            .copy_from_slice(&digest[..DIGEST_FIELD_LEN]);
    }

    /// Add or remove our layer in the outbound direction
    pub fn apply_outbound(&mut self, payload: &mut [u8]) {
        self.outbound_cipher.apply_keystream(payload);
    }

    /// Add or remove our layer in the inbound direction
    pub fn apply_inbound(&mut self, payload: &mut [u8]) {
        self.inbound_cipher.apply_keystream(payload);
    }

    /// Whether a payload with our layer removed is addressed to us. The
    /// running digest only advances when it is.
    pub fn is_recognized(&mut self, payload: &[u8]) -> bool {
        if payload[RECOGNIZED_OFFSET] != 0 || payload[RECOGNIZED_OFFSET + 1] != 0 {
            return false;
        }
        let mut received = [0u8; DIGEST_FIELD_LEN];
        received.copy_from_slice(&payload[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_FIELD_LEN]);

        let mut zeroed = payload.to_vec();
        zeroed[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_FIELD_LEN].fill(0);

        let mut candidate = self.inbound_digest.clone();
        candidate.update(&zeroed);
        let expected = candidate.clone().finalize();
        if expected[..DIGEST_FIELD_LEN] != received {
            return false;
        }
        self.inbound_digest = candidate;
        true
    }

    /// Encode, digest and encrypt a message we originate at this hop
    pub fn seal(&mut self, msg: &RelayMsg) -> Result<Vec<u8>, CellError> {
        let mut payload = msg.encode()?;
        self.set_digest(&mut payload);
        self.apply_outbound(&mut payload);
        Ok(payload)
    }
}

impl std::fmt::Debug for HopCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HopCrypto { .. }")
    }
}

fn cipher(key: &[u8]) -> Aes128Ctr {
    let mut k = [0u8; CIPHER_KEY_LEN];
    k.copy_from_slice(key);
    Aes128Ctr::new(&k.into(), &[0u8; 16].into())
}

fn seeded_digest(seed: &[u8]) -> Sha1 {
    let mut digest = Sha1::new();
    digest.update(seed);
    digest
}
