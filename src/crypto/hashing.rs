//! Hash functions and MACs

use crate::error::{CollabError, CollabResult};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 hash, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash multiple items together
pub fn hash_concat(items: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item);
    }
    hasher.finalize().into()
}

/// HMAC-SHA256
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> CollabResult<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CollabError::CryptoError("invalid HMAC key".into()))?;
    mac.update(data);

    Ok(mac.finalize().into_bytes().into())
}

/// Verify HMAC-SHA256 in constant time
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], expected: &[u8]) -> CollabResult<bool> {
    let computed = hmac_sha256(key, data)?;
    Ok(crate::crypto::secure_compare(&computed, expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let expected =
            hex::decode("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824").unwrap();
        assert_eq!(sha256(b"hello").as_slice(), expected.as_slice());
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_concat_matches_single_pass() {
        assert_eq!(hash_concat(&[b"hel", b"lo"]), sha256(b"hello"));
    }

    #[test]
    fn test_hmac_sha256() {
        let key = b"secret_key";
        let data = b"message";

        let mac = hmac_sha256(key, data).unwrap();
        assert!(hmac_sha256_verify(key, data, &mac).unwrap());
        assert!(!hmac_sha256_verify(key, data, &[0u8; 32]).unwrap());
        assert!(!hmac_sha256_verify(b"other_key", data, &mac).unwrap());
    }
}
