//! Cryptographic primitives for Collab Shield
//!
//! - Symmetric AEAD (AES-256-GCM, ChaCha20-Poly1305)
//! - RSA-OAEP key wrapping and RSA-PSS signatures
//! - SHA-256 and HMAC-SHA256
//! - OS randomness and constant-time comparison

use crate::error::{CollabError, CollabResult};

use core::sync::atomic::{AtomicBool, Ordering};

mod asymmetric;
mod hashing;
mod symmetric;

pub use asymmetric::*;
pub use hashing::*;
pub use symmetric::*;

/// Global initialization flag
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the cryptographic subsystem
///
/// Runs a self-test of the hash function and the OS RNG. Safe to call
/// multiple times. A failure here must stop the enclave from starting.
pub fn init() -> CollabResult<()> {
    if INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    verify_primitives()?;
    INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

fn verify_primitives() -> CollabResult<()> {
    let expected = [
        0x2c, 0xf2, 0x4d, 0xba, 0x5f, 0xb0, 0xa3, 0x0e, 0x26, 0xe8, 0x3b, 0x2a, 0xc5, 0xb9, 0xe2,
        0x9e, 0x1b, 0x16, 0x1e, 0x5c, 0x1f, 0xa7, 0x42, 0x5e, 0x73, 0x04, 0x33, 0x62, 0x93, 0x8b,
        0x98, 0x24,
    ];
    if sha256(b"hello") != expected {
        return Err(CollabError::CryptoError("SHA-256 self-test failed".into()));
    }

    let sample = random_bytes(32)?;
    if sample.iter().all(|&b| b == 0) {
        return Err(CollabError::RngFailed);
    }

    Ok(())
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> CollabResult<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).map_err(|_| CollabError::RngFailed)?;
    Ok(bytes)
}

/// Generate a random 96-bit AEAD nonce
pub fn random_nonce() -> CollabResult<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CollabError::RngFailed)?;
    Ok(nonce)
}

/// Generate a random 256-bit key
pub fn random_key() -> CollabResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    getrandom::getrandom(&mut key).map_err(|_| CollabError::RngFailed)?;
    Ok(key)
}

/// Random hex identifier of `len` bytes
pub fn random_id(len: usize) -> CollabResult<String> {
    Ok(hex::encode(random_bytes(len)?))
}

/// Constant-time comparison
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
