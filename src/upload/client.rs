//! Client side of the hybrid upload
//!
//! Encrypts a dataset under a fresh key, wraps that key to the attested
//! enclave key, and assembles the envelope.

use super::{AssociatedData, UploadEnvelope};
use crate::attestation::VerifiedEnclave;
use crate::crypto::{random_key, random_nonce, rsa_oaep_wrap, sha256_hex, SymmetricAlgorithm};
use crate::error::{CollabError, CollabResult};
use crate::types::{current_timestamp, DatasetId, SessionId};

/// Build an upload envelope for `plaintext`
///
/// Refuses to wrap a key to an enclave whose attestation has expired.
pub fn seal_upload(
    enclave: &VerifiedEnclave,
    session_id: &SessionId,
    dataset_id: &DatasetId,
    plaintext: &[u8],
    algorithm: SymmetricAlgorithm,
) -> CollabResult<UploadEnvelope> {
    if current_timestamp() >= enclave.expires_at() {
        return Err(CollabError::AttestationExpired);
    }

    let checksum = sha256_hex(plaintext);
    let associated_data = AssociatedData {
        dataset_id: dataset_id.clone(),
        session_id: session_id.clone(),
        plaintext_sha256: checksum.clone(),
    }
    .to_bytes()?;

    let key = zeroize::Zeroizing::new(random_key()?);
    let nonce = random_nonce()?;
    let ciphertext = algorithm.encrypt(&key, &nonce, plaintext, &associated_data)?;
    let wrapped_key = rsa_oaep_wrap(enclave.public_key(), key.as_slice())?;

    Ok(UploadEnvelope {
        session_id: session_id.clone(),
        dataset_id: dataset_id.clone(),
        key_id: enclave.key_id().to_vec(),
        ciphertext,
        wrapped_key,
        iv: nonce.to_vec(),
        associated_data,
        checksum,
        algorithm_tag: algorithm.tag().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::test_support::shared_custodian;
    use crate::upload::tests::verified_enclave;

    #[test]
    fn test_envelope_fields() {
        let enclave = verified_enclave();
        let envelope = seal_upload(
            &enclave,
            &"s1".into(),
            &"d1".into(),
            b"a,b\n1,2\n",
            SymmetricAlgorithm::Aes256Gcm,
        )
        .unwrap();

        assert_eq!(envelope.key_id, shared_custodian().key_id().to_vec());
        assert_eq!(envelope.iv.len(), 12);
        assert_eq!(envelope.algorithm_tag, "AES-256-GCM");
        assert_eq!(envelope.checksum, sha256_hex(b"a,b\n1,2\n"));
        assert_ne!(envelope.ciphertext.as_slice(), b"a,b\n1,2\n".as_slice());

        let ad = AssociatedData::parse(&envelope.associated_data).unwrap();
        assert_eq!(ad.dataset_id.as_str(), "d1");
        assert_eq!(ad.plaintext_sha256, envelope.checksum);
    }

    #[test]
    fn test_refuses_expired_attestation() {
        let mut enclave = verified_enclave();
        enclave.expires_at = 1;
        let err = seal_upload(
            &enclave,
            &"s1".into(),
            &"d1".into(),
            b"x",
            SymmetricAlgorithm::ChaCha20Poly1305,
        )
        .unwrap_err();
        assert_eq!(err, CollabError::AttestationExpired);
    }
}
