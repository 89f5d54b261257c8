//! Key Custodian
//!
//! Owns the enclave's long-lived RSA identity. The private half never leaves
//! this module: callers get the public key, its identifier, and two narrow
//! capabilities (sign attestation claims, unwrap upload keys).

use crate::config::CustodianConfig;
use crate::crypto::{
    generate_rsa_key, public_key_der, public_key_pem, rsa_oaep_unwrap, rsa_pss_sign, sha256,
    PssSigningKey,
};
use crate::error::CollabResult;

use core::fmt;
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

/// Length of a key identifier in bytes
pub const KEY_ID_LEN: usize = 16;

/// Key identifier: truncated SHA-256 over the public key's DER encoding
pub fn key_identifier(public_key: &RsaPublicKey) -> CollabResult<[u8; KEY_ID_LEN]> {
    let der = public_key_der(public_key)?;
    Ok(key_identifier_from_der(&der))
}

/// Key identifier computed from an already-encoded public key
pub fn key_identifier_from_der(der: &[u8]) -> [u8; KEY_ID_LEN] {
    let digest = sha256(der);
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&digest[..KEY_ID_LEN]);
    id
}

/// Enclave identity keypair
pub struct KeyCustodian {
    private_key: RsaPrivateKey,
    signing_key: PssSigningKey,
    public_key: RsaPublicKey,
    public_key_der: Vec<u8>,
    public_key_pem: String,
    key_id: [u8; KEY_ID_LEN],
}

impl KeyCustodian {
    /// Generate a fresh identity
    ///
    /// Called once at process start. An error here is fatal: the enclave
    /// must not serve requests without an identity.
    pub fn generate_identity(config: &CustodianConfig) -> CollabResult<Self> {
        let private_key = generate_rsa_key(config.key_bits)?;
        let custodian = Self::from_private_key(private_key)?;

        tracing::info!(
            key_id = %custodian.key_id_hex(),
            bits = config.key_bits,
            "enclave identity generated"
        );

        Ok(custodian)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> CollabResult<Self> {
        let public_key = private_key.to_public_key();
        let public_key_der = public_key_der(&public_key)?;
        let public_key_pem = public_key_pem(&public_key)?;
        let key_id = key_identifier_from_der(&public_key_der);
        let signing_key = PssSigningKey::new(private_key.clone());

        Ok(Self {
            private_key,
            signing_key,
            public_key,
            public_key_der,
            public_key_pem,
            key_id,
        })
    }

    /// Public key
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// DER-encoded public key
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// PEM-encoded public key
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Key identifier
    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.key_id
    }

    /// Key identifier, hex-encoded
    pub fn key_id_hex(&self) -> String {
        hex::encode(self.key_id)
    }

    /// Sign attestation claims with RSA-PSS-SHA256
    pub(crate) fn sign(&self, message: &[u8]) -> CollabResult<Vec<u8>> {
        rsa_pss_sign(&self.signing_key, message)
    }

    /// Unwrap an upload key wrapped to this identity
    pub(crate) fn unwrap_key(&self, wrapped: &[u8]) -> CollabResult<Zeroizing<Vec<u8>>> {
        rsa_oaep_unwrap(&self.private_key, wrapped)
    }
}

impl fmt::Debug for KeyCustodian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCustodian")
            .field("key_id", &self.key_id_hex())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, OnceLock};

    /// One 2048-bit identity shared by every test; RSA keygen is slow.
    pub(crate) fn shared_custodian() -> Arc<KeyCustodian> {
        static CUSTODIAN: OnceLock<Arc<KeyCustodian>> = OnceLock::new();
        CUSTODIAN
            .get_or_init(|| {
                let config = CustodianConfig { key_bits: 2048 };
                Arc::new(KeyCustodian::generate_identity(&config).unwrap())
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::shared_custodian;
    use super::*;

    #[test]
    fn test_key_id_is_stable() {
        let custodian = shared_custodian();
        assert_eq!(custodian.key_id(), key_identifier(custodian.public_key()).unwrap());
        assert_eq!(custodian.key_id_hex().len(), KEY_ID_LEN * 2);
        assert_eq!(
            custodian.key_id(),
            key_identifier_from_der(custodian.public_key_der())
        );
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let custodian = shared_custodian();
        let debug = format!("{:?}", custodian);
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains(&custodian.key_id_hex()));
    }

    #[test]
    fn test_pem_matches_der() {
        let custodian = shared_custodian();
        assert!(custodian.public_key_pem().contains("PUBLIC KEY"));
        assert!(!custodian.public_key_der().is_empty());
    }
}
