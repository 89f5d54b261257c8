//! Attestation Issuer
//!
//! Produces a signed, time-bounded claim set proving the enclave's identity,
//! code measurement, and platform security properties. Clients verify it with
//! [`AttestationVerifier`] before wrapping an upload key to the attested key.

mod verifier;

pub use verifier::{AttestationVerifier, VerifiedEnclave};

use crate::config::AttestationConfig;
use crate::crypto::{sha256, SIGNATURE_ALGORITHM};
use crate::custodian::KeyCustodian;
use crate::error::{CollabError, CollabResult};
use crate::types::current_timestamp;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Platform security properties reported in the claim set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    /// Guest memory encrypted by the platform
    pub memory_encryption: bool,
    /// Secure boot enforced
    pub secure_boot: bool,
    /// Boot chain measured
    pub measured_boot: bool,
    /// No interactive shell access
    pub ssh_disabled: bool,
    /// Code image is read-only
    pub immutable_code: bool,
}

/// Attested claims; the signature covers their JSON encoding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    /// Issuer
    pub issuer: String,
    /// Subject
    pub subject: String,
    /// Issuance time (Unix seconds)
    pub issued_at: u64,
    /// Expiry time (Unix seconds)
    pub expires_at: u64,
    /// Trusted execution environment kind
    pub tee_type: String,
    /// Image the enclave booted from
    pub image_id: Option<String>,
    /// Hex key identifier of the enclave key
    pub key_id: String,
    /// Hex DER SubjectPublicKeyInfo of the enclave key
    pub public_key_der: String,
    /// PEM form of the same key, for clients that prefer it
    pub public_key_pem: String,
    /// Hex SHA-256 code measurement
    pub code_measurement: String,
    /// Security properties
    pub security: SecurityFlags,
}

impl ClaimSet {
    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> CollabResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check whether the claims are past their expiry at `now`
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Claim set plus its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAttestation {
    /// Claims
    pub claims: ClaimSet,
    /// Hex RSA-PSS signature over `claims.signing_bytes()`
    pub signature: String,
    /// Signature scheme name
    pub signature_algorithm: String,
}

/// Issues attestations signed by the enclave identity
pub struct AttestationIssuer {
    config: AttestationConfig,
    custodian: Arc<KeyCustodian>,
    code_measurement: [u8; 32],
    cached: RwLock<Option<SignedAttestation>>,
}

impl AttestationIssuer {
    /// Create an issuer for `custodian`'s identity
    ///
    /// The code measurement comes from configuration, or is the SHA-256 of
    /// the running executable when none is configured.
    pub fn new(config: &AttestationConfig, custodian: Arc<KeyCustodian>) -> CollabResult<Self> {
        let code_measurement = match &config.code_measurement {
            Some(hex_measurement) => {
                let bytes = hex::decode(hex_measurement)?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    CollabError::ConfigurationError("code_measurement must be 32 bytes".into())
                })?
            }
            None => measure_running_binary()?,
        };

        Ok(Self {
            config: config.clone(),
            custodian,
            code_measurement,
            cached: RwLock::new(None),
        })
    }

    /// Code measurement this issuer attests to
    pub fn code_measurement(&self) -> [u8; 32] {
        self.code_measurement
    }

    /// Issue the current attestation
    pub fn issue(&self) -> CollabResult<SignedAttestation> {
        self.issue_at(current_timestamp())
    }

    /// Issue an attestation as of `now`, serving from cache within the TTL
    pub fn issue_at(&self, now: u64) -> CollabResult<SignedAttestation> {
        if let Ok(cached) = self.cached.read() {
            if let Some(attestation) = cached.as_ref() {
                let issued_at = attestation.claims.issued_at;
                if now >= issued_at && now - issued_at < self.config.cache_ttl_seconds {
                    return Ok(attestation.clone());
                }
            }
        }

        let attestation = self.sign_claims(now)?;

        let mut cached = self
            .cached
            .write()
            .map_err(|_| CollabError::InternalError("attestation cache poisoned".into()))?;
        *cached = Some(attestation.clone());

        tracing::debug!(
            key_id = %attestation.claims.key_id,
            expires_at = attestation.claims.expires_at,
            "attestation issued"
        );

        Ok(attestation)
    }

    fn sign_claims(&self, now: u64) -> CollabResult<SignedAttestation> {
        let claims = ClaimSet {
            issuer: self.config.issuer.clone(),
            subject: self.config.subject.clone(),
            issued_at: now,
            expires_at: now + self.config.validity_seconds,
            tee_type: self.config.tee_type.clone(),
            image_id: self.config.image_id.clone(),
            key_id: self.custodian.key_id_hex(),
            public_key_der: hex::encode(self.custodian.public_key_der()),
            public_key_pem: self.custodian.public_key_pem().to_owned(),
            code_measurement: hex::encode(self.code_measurement),
            security: SecurityFlags {
                memory_encryption: self.config.memory_encryption,
                secure_boot: self.config.secure_boot,
                measured_boot: self.config.measured_boot,
                ssh_disabled: self.config.ssh_disabled,
                immutable_code: self.config.immutable_code,
            },
        };

        let signature = self
            .custodian
            .sign(&claims.signing_bytes()?)
            .map_err(|e| CollabError::AttestationFailed(e.to_string()))?;

        Ok(SignedAttestation {
            claims,
            signature: hex::encode(signature),
            signature_algorithm: SIGNATURE_ALGORITHM.into(),
        })
    }
}

fn measure_running_binary() -> CollabResult<[u8; 32]> {
    let path = std::env::current_exe()
        .map_err(|e| CollabError::AttestationFailed(format!("cannot locate executable: {}", e)))?;
    let image = std::fs::read(&path)
        .map_err(|e| CollabError::AttestationFailed(format!("cannot read executable: {}", e)))?;
    Ok(sha256(&image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custodian::test_support::shared_custodian;

    pub(super) const MEASUREMENT: &str =
        "5f2b1c7a9d3e4f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8";

    pub(super) fn issuer() -> AttestationIssuer {
        let config = AttestationConfig {
            code_measurement: Some(MEASUREMENT.into()),
            ..AttestationConfig::default()
        };
        AttestationIssuer::new(&config, shared_custodian()).unwrap()
    }

    #[test]
    fn test_issue_contains_identity() {
        let issuer = issuer();
        let custodian = shared_custodian();
        let attestation = issuer.issue_at(1_000).unwrap();

        assert_eq!(attestation.claims.key_id, custodian.key_id_hex());
        assert_eq!(attestation.claims.code_measurement, MEASUREMENT);
        assert_eq!(attestation.claims.expires_at, 1_000 + 3600);
        assert_eq!(attestation.signature_algorithm, "RSA-PSS-SHA256");
        assert!(attestation.claims.security.memory_encryption);
    }

    #[test]
    fn test_cache_ttl() {
        let issuer = issuer();
        let first = issuer.issue_at(1_000).unwrap();
        let cached = issuer.issue_at(1_100).unwrap();
        assert_eq!(first, cached);

        let refreshed = issuer.issue_at(1_000 + 300).unwrap();
        assert_eq!(refreshed.claims.issued_at, 1_300);
    }

    #[test]
    fn test_measurement_defaults_to_binary_hash() {
        let issuer = AttestationIssuer::new(&AttestationConfig::default(), shared_custodian()).unwrap();
        assert_ne!(issuer.code_measurement(), [0u8; 32]);
    }

    #[test]
    fn test_expiry() {
        let attestation = issuer().issue_at(1_000).unwrap();
        assert!(!attestation.claims.is_expired_at(1_000));
        assert!(attestation.claims.is_expired_at(1_000 + 3600));
    }
}
