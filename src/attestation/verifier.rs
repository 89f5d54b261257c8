//! Client-side attestation verification

use super::{ClaimSet, SignedAttestation};
use crate::crypto::{public_key_from_der, rsa_pss_verify, secure_compare, SIGNATURE_ALGORITHM};
use crate::custodian::{key_identifier, KEY_ID_LEN};
use crate::error::{CollabError, CollabResult};
use crate::types::current_timestamp;

use rsa::RsaPublicKey;

/// Enclave key a client may wrap upload keys to
///
/// Only obtainable from a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedEnclave {
    pub(crate) public_key: RsaPublicKey,
    pub(crate) key_id: [u8; KEY_ID_LEN],
    pub(crate) expires_at: u64,
}

impl VerifiedEnclave {
    /// Attested public key
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Attested key identifier
    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.key_id
    }

    /// Expiry of the attestation this was derived from
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

/// Verifies attestations against a pinned key and a measurement allow-list
pub struct AttestationVerifier {
    trusted_public_key: RsaPublicKey,
    allowed_measurements: Vec<[u8; 32]>,
}

impl AttestationVerifier {
    /// Create a verifier
    pub fn new(trusted_public_key: RsaPublicKey, allowed_measurements: Vec<[u8; 32]>) -> Self {
        Self {
            trusted_public_key,
            allowed_measurements,
        }
    }

    /// Verify a claim set and its signature
    ///
    /// Any mismatch is a hard failure; the caller must not upload.
    pub fn verify(&self, claims: &ClaimSet, signature: &[u8]) -> bool {
        self.check_claims_at(claims, signature, current_timestamp())
            .is_ok()
    }

    /// Verify a signed attestation as of now
    pub fn check(&self, attestation: &SignedAttestation) -> CollabResult<VerifiedEnclave> {
        self.check_at(attestation, current_timestamp())
    }

    /// Verify a signed attestation as of `now`
    pub fn check_at(
        &self,
        attestation: &SignedAttestation,
        now: u64,
    ) -> CollabResult<VerifiedEnclave> {
        if attestation.signature_algorithm != SIGNATURE_ALGORITHM {
            return Err(CollabError::UnsupportedAlgorithm(
                attestation.signature_algorithm.clone(),
            ));
        }

        let signature = hex::decode(&attestation.signature)
            .map_err(|_| CollabError::AttestationSignatureInvalid)?;
        self.check_claims_at(&attestation.claims, &signature, now)
    }

    fn check_claims_at(
        &self,
        claims: &ClaimSet,
        signature: &[u8],
        now: u64,
    ) -> CollabResult<VerifiedEnclave> {
        if !rsa_pss_verify(&self.trusted_public_key, &claims.signing_bytes()?, signature) {
            tracing::warn!(key_id = %claims.key_id, "attestation signature rejected");
            return Err(CollabError::AttestationSignatureInvalid);
        }

        if claims.issued_at > claims.expires_at || claims.is_expired_at(now) {
            return Err(CollabError::AttestationExpired);
        }

        let measurement = hex::decode(&claims.code_measurement)
            .map_err(|_| CollabError::MeasurementMismatch)?;
        let allowed = self
            .allowed_measurements
            .iter()
            .any(|expected| secure_compare(expected, &measurement));
        if !allowed {
            return Err(CollabError::MeasurementMismatch);
        }

        let attested_der =
            hex::decode(&claims.public_key_der).map_err(|_| CollabError::KeyBindingMismatch)?;
        let attested_key =
            public_key_from_der(&attested_der).map_err(|_| CollabError::KeyBindingMismatch)?;
        if attested_key != self.trusted_public_key {
            return Err(CollabError::KeyBindingMismatch);
        }

        let key_id = key_identifier(&attested_key)?;
        let claimed_key_id =
            hex::decode(&claims.key_id).map_err(|_| CollabError::KeyBindingMismatch)?;
        if !secure_compare(&key_id, &claimed_key_id) {
            return Err(CollabError::KeyBindingMismatch);
        }

        Ok(VerifiedEnclave {
            public_key: attested_key,
            key_id,
            expires_at: claims.expires_at,
        })
    }
}
