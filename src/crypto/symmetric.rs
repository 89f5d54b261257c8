//! Symmetric authenticated encryption

use crate::error::{CollabError, CollabResult};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Symmetric key length in bytes
pub const KEY_LEN: usize = 32;

/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AEAD tag length in bytes
pub const TAG_LEN: usize = 16;

/// Encrypt data using AES-256-GCM
///
/// # Returns
/// * Ciphertext with the 16-byte authentication tag appended
pub fn aes256_gcm_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> CollabResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CollabError::EncryptionFailed)?;

    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CollabError::EncryptionFailed)
}

/// Decrypt data using AES-256-GCM
pub fn aes256_gcm_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> CollabResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CollabError::DecryptionFailed)?;

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CollabError::DecryptionFailed)
}

/// Encrypt data using ChaCha20-Poly1305
pub fn chacha20_poly1305_encrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> CollabResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CollabError::EncryptionFailed)?;

    cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: plaintext, aad },
        )
        .map_err(|_| CollabError::EncryptionFailed)
}

/// Decrypt data using ChaCha20-Poly1305
pub fn chacha20_poly1305_decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> CollabResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CollabError::DecryptionFailed)?;

    cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(nonce),
            chacha20poly1305::aead::Payload { msg: ciphertext, aad },
        )
        .map_err(|_| CollabError::DecryptionFailed)
}

/// Envelope algorithm tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymmetricAlgorithm {
    /// AES-256-GCM
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    #[serde(rename = "CHACHA20-POLY1305")]
    ChaCha20Poly1305,
}

impl SymmetricAlgorithm {
    /// Wire tag
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Parse a wire tag
    pub fn from_tag(tag: &str) -> CollabResult<Self> {
        match tag {
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            "CHACHA20-POLY1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(CollabError::UnsupportedAlgorithm(other.into())),
        }
    }

    /// Encrypt with the selected algorithm
    pub fn encrypt(
        self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CollabResult<Vec<u8>> {
        match self {
            Self::Aes256Gcm => aes256_gcm_encrypt(key, nonce, plaintext, aad),
            Self::ChaCha20Poly1305 => chacha20_poly1305_encrypt(key, nonce, plaintext, aad),
        }
    }

    /// Decrypt with the selected algorithm
    pub fn decrypt(
        self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CollabResult<Vec<u8>> {
        match self {
            Self::Aes256Gcm => aes256_gcm_decrypt(key, nonce, ciphertext, aad),
            Self::ChaCha20Poly1305 => chacha20_poly1305_decrypt(key, nonce, ciphertext, aad),
        }
    }
}

impl fmt::Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_key, random_nonce};

    #[test]
    fn test_aes256_gcm_wrong_key() {
        let key1 = random_key().unwrap();
        let key2 = random_key().unwrap();
        let nonce = random_nonce().unwrap();

        let ciphertext = aes256_gcm_encrypt(&key1, &nonce, b"secret", b"").unwrap();
        assert_eq!(ciphertext.len(), 6 + TAG_LEN);
        let result = aes256_gcm_decrypt(&key2, &nonce, &ciphertext, b"");

        assert_eq!(result, Err(CollabError::DecryptionFailed));
    }

    #[test]
    fn test_aes256_gcm_wrong_aad() {
        let key = random_key().unwrap();
        let nonce = random_nonce().unwrap();

        let ciphertext = aes256_gcm_encrypt(&key, &nonce, b"secret", b"aad1").unwrap();
        let result = aes256_gcm_decrypt(&key, &nonce, &ciphertext, b"aad2");

        assert!(result.is_err());
    }

    #[test]
    fn test_algorithm_enum() {
        let key = random_key().unwrap();
        let nonce = random_nonce().unwrap();
        let plaintext = b"col_a,col_b\n1,2\n";

        for alg in [SymmetricAlgorithm::Aes256Gcm, SymmetricAlgorithm::ChaCha20Poly1305] {
            let ct = alg.encrypt(&key, &nonce, plaintext, b"ds|s").unwrap();
            let pt = alg.decrypt(&key, &nonce, &ct, b"ds|s").unwrap();
            assert_eq!(plaintext.as_slice(), pt.as_slice());
            assert_eq!(SymmetricAlgorithm::from_tag(alg.tag()).unwrap(), alg);
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = SymmetricAlgorithm::from_tag("DES-CBC").unwrap_err();
        assert_eq!(err.error_code(), "unsupported_algorithm");
    }
}
