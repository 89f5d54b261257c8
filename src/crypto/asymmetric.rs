//! RSA key wrapping and signatures
//!
//! OAEP with SHA-256 wraps per-upload keys; PSS with SHA-256 signs
//! attestation claims.

use crate::error::{CollabError, CollabResult};

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Name of the signature scheme carried in attestations
pub const SIGNATURE_ALGORITHM: &str = "RSA-PSS-SHA256";

/// PSS signing key over SHA-256
pub type PssSigningKey = BlindedSigningKey<Sha256>;

/// Generate an RSA private key of `bits` modulus size
pub fn generate_rsa_key(bits: usize) -> CollabResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CollabError::CryptoError(format!("RSA key generation failed: {}", e)))
}

/// Wrap a symmetric key for the holder of `public_key`
pub fn rsa_oaep_wrap(public_key: &RsaPublicKey, key: &[u8]) -> CollabResult<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|_| CollabError::EncryptionFailed)
}

/// Unwrap a symmetric key
pub fn rsa_oaep_unwrap(
    private_key: &RsaPrivateKey,
    wrapped: &[u8],
) -> CollabResult<Zeroizing<Vec<u8>>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map(Zeroizing::new)
        .map_err(|_| CollabError::KeyUnwrapFailed)
}

/// Sign `message` with RSA-PSS
pub fn rsa_pss_sign(signing_key: &PssSigningKey, message: &[u8]) -> CollabResult<Vec<u8>> {
    let signature = signing_key
        .try_sign_with_rng(&mut OsRng, message)
        .map_err(|e| CollabError::CryptoError(format!("PSS signing failed: {}", e)))?;

    Ok(signature.to_vec())
}

/// Verify an RSA-PSS signature
pub fn rsa_pss_verify(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(message, &signature)
        .is_ok()
}

/// DER-encoded SubjectPublicKeyInfo
pub fn public_key_der(public_key: &RsaPublicKey) -> CollabResult<Vec<u8>> {
    public_key
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CollabError::CryptoError(format!("public key encoding failed: {}", e)))
}

/// PEM-encoded SubjectPublicKeyInfo
pub fn public_key_pem(public_key: &RsaPublicKey) -> CollabResult<String> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CollabError::CryptoError(format!("public key encoding failed: {}", e)))
}

/// Parse a DER-encoded SubjectPublicKeyInfo
pub fn public_key_from_der(der: &[u8]) -> CollabResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|_| CollabError::InvalidInput("malformed RSA public key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::test_support::shared_custodian;

    #[test]
    fn test_oaep_wrap_unwrap() {
        let custodian = shared_custodian();
        let key = [7u8; 32];

        let wrapped = rsa_oaep_wrap(custodian.public_key(), &key).unwrap();
        assert_ne!(wrapped.as_slice(), key.as_slice());

        let unwrapped = custodian.unwrap_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), key.as_slice());
    }

    #[test]
    fn test_oaep_unwrap_garbage() {
        let custodian = shared_custodian();
        let err = custodian.unwrap_key(&[0u8; 256]).unwrap_err();
        assert_eq!(err, CollabError::KeyUnwrapFailed);
    }

    #[test]
    fn test_pss_sign_verify() {
        let custodian = shared_custodian();
        let message = b"claims";

        let signature = custodian.sign(message).unwrap();
        assert!(rsa_pss_verify(custodian.public_key(), message, &signature));
        assert!(!rsa_pss_verify(custodian.public_key(), b"other claims", &signature));
        assert!(!rsa_pss_verify(custodian.public_key(), message, &signature[1..]));
    }

    #[test]
    fn test_public_key_der_parses_back() {
        let custodian = shared_custodian();
        let der = public_key_der(custodian.public_key()).unwrap();
        let parsed = public_key_from_der(&der).unwrap();
        assert_eq!(&parsed, custodian.public_key());

        let pem = public_key_pem(custodian.public_key()).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
