use super::HandshakeError;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use onioncirc_common::cells::KEY_MATERIAL_LEN;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Key block shared by both ends of a hop: Df | Db | Kf | Kb
pub type KeyMaterial = Zeroizing<[u8; KEY_MATERIAL_LEN]>;

type HmacSha256 = Hmac<Sha256>;

/// KDF-TOR: SHA1(K0 | 0) | SHA1(K0 | 1) | ... truncated to `out_len`
pub fn kdf_tor(k0: &[u8], out_len: usize) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    if out_len > 20 * 256 {
        return Err(HandshakeError::Internal("KDF output too long".into()));
    }
    let mut out = Zeroizing::new(Vec::with_capacity(out_len + 20));
    let mut counter: u8 = 0;
    while out.len() < out_len {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(out_len);
    Ok(out)
}

/// Split the output of `kdf_tor(K0, 20 + 72)` into (KH, key block)
pub fn kdf_tor_keys(k0: &[u8]) -> Result<([u8; 20], KeyMaterial), HandshakeError> {
    let out = kdf_tor(k0, 20 + KEY_MATERIAL_LEN)?;
    let mut kh = [0u8; 20];
    kh.copy_from_slice(&out[..20]);
    let mut keys = Zeroizing::new([0u8; KEY_MATERIAL_LEN]);
    keys.copy_from_slice(&out[20..]);
    Ok((kh, keys))
}

/// HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], HandshakeError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| HandshakeError::Internal(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// RFC 5869 expansion of an ntor KEY_SEED into the key block
pub fn expand_key_seed(key_seed: &[u8; 32], info: &[u8]) -> Result<KeyMaterial, HandshakeError> {
    let hk = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|e| HandshakeError::Internal(e.to_string()))?;
    let mut keys = Zeroizing::new([0u8; KEY_MATERIAL_LEN]);
    hk.expand(info, &mut keys[..])
        .map_err(|e| HandshakeError::Internal(e.to_string()))?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_tor_prefix_stable() {
        let short = kdf_tor(b"seed", 20).unwrap();
        let long = kdf_tor(b"seed", 92).unwrap();
        assert_eq!(&long[..20], &short[..]);
        assert_eq!(long.len(), 92);
    }

    #[test]
    fn test_kdf_tor_first_block() {
        let out = kdf_tor(b"abc", 20).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(b"abc");
        hasher.update([0u8]);
        assert_eq!(&out[..], &hasher.finalize()[..]);
    }

    #[test]
    fn test_kdf_tor_keys_split() {
        let (kh, keys) = kdf_tor_keys(b"k0").unwrap();
        let full = kdf_tor(b"k0", 92).unwrap();
        assert_eq!(&kh[..], &full[..20]);
        assert_eq!(&keys[..], &full[20..]);
    }

    #[test]
    fn test_expand_key_seed_deterministic() {
        let a = expand_key_seed(&[7u8; 32], b"info").unwrap();
        let b = expand_key_seed(&[7u8; 32], b"info").unwrap();
        let c = expand_key_seed(&[8u8; 32], b"info").unwrap();
        assert_eq!(&a[..], &b[..]);
        assert_ne!(&a[..], &c[..]);
    }
}
