//! Hybrid Upload Codec
//!
//! Envelope encryption from client to enclave:
//!
//! ```text
//! client:  K, N <- random
//!          C    <- AEAD(K, N, data, AD = {dataset_id, session_id, sha256(data)})
//!          W    <- RSA-OAEP(enclave_pk, K)
//! enclave: K    <- unwrap(W)
//!          data <- AEAD^-1(K, N, C, AD)
//!          check sha256(data)
//!          store AEAD(session_key, N', data, session AD)
//! ```
//!
//! The upload key is wrapped directly to the long-term enclave key, so a later
//! compromise of that key exposes recorded uploads. There is no ephemeral
//! key agreement step.

mod client;
mod credential;

pub use client::seal_upload;
pub use credential::{UploadCredential, DEFAULT_CREDENTIAL_TTL_SECS};

use crate::config::UploadConfig;
use crate::crypto::{secure_compare, sha256, sha256_hex, SymmetricAlgorithm, KEY_LEN, NONCE_LEN};
use crate::custodian::KeyCustodian;
use crate::data::{session_aad, DatasetVault, SessionKeyStore};
use crate::error::{CollabError, CollabResult};
use crate::notifier::{StatusEvent, StatusSink};
use crate::session::SessionDirectory;
use crate::types::{current_timestamp, DatasetId, DatasetStatus, SessionId};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Wire object carrying one encrypted dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEnvelope {
    /// Target session
    pub session_id: SessionId,
    /// Dataset being uploaded
    pub dataset_id: DatasetId,
    /// Identifier of the enclave key the upload key was wrapped to
    #[serde(with = "hex")]
    pub key_id: Vec<u8>,
    /// AEAD ciphertext with tag
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
    /// Upload key wrapped with RSA-OAEP-SHA256
    #[serde(with = "hex")]
    pub wrapped_key: Vec<u8>,
    /// AEAD nonce
    #[serde(with = "hex")]
    pub iv: Vec<u8>,
    /// Encoded [`AssociatedData`]
    #[serde(with = "hex")]
    pub associated_data: Vec<u8>,
    /// Hex SHA-256 of the plaintext
    pub checksum: String,
    /// AEAD algorithm tag
    pub algorithm_tag: String,
}

/// Associated data bound into the client-side AEAD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedData {
    /// Dataset identifier
    pub dataset_id: DatasetId,
    /// Session identifier
    pub session_id: SessionId,
    /// Hex SHA-256 of the plaintext
    pub plaintext_sha256: String,
}

impl AssociatedData {
    /// Canonical encoding
    pub fn to_bytes(&self) -> CollabResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode; any malformation is a binding failure
    pub fn parse(bytes: &[u8]) -> CollabResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| CollabError::EnvelopeBindingMismatch {
            field: "associated_data".into(),
        })
    }
}

/// Returned to the uploader on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Dataset stored
    pub dataset_id: DatasetId,
    /// Session it belongs to
    pub session_id: SessionId,
    /// New dataset state
    pub status: DatasetStatus,
    /// Hex SHA-256 of the plaintext
    pub checksum: String,
    /// Plaintext size
    pub size_bytes: usize,
}

/// Enclave-side upload endpoint
pub struct UploadService {
    credential_secret: Zeroizing<Vec<u8>>,
    max_envelope_bytes: usize,
    allowed_algorithms: Vec<SymmetricAlgorithm>,
    custodian: Arc<KeyCustodian>,
    keys: Arc<SessionKeyStore>,
    vault: Arc<DatasetVault>,
    sessions: Arc<SessionDirectory>,
    sink: Arc<dyn StatusSink>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl UploadService {
    /// Create the endpoint; fails without a credential secret
    pub fn new(
        config: &UploadConfig,
        custodian: Arc<KeyCustodian>,
        keys: Arc<SessionKeyStore>,
        vault: Arc<DatasetVault>,
        sessions: Arc<SessionDirectory>,
        sink: Arc<dyn StatusSink>,
    ) -> CollabResult<Self> {
        let credential_secret = Zeroizing::new(config.secret_bytes()?);
        let allowed_algorithms = config
            .allowed_algorithms
            .iter()
            .map(|tag| SymmetricAlgorithm::from_tag(tag))
            .collect::<CollabResult<Vec<_>>>()
            .map_err(|e| CollabError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            credential_secret,
            max_envelope_bytes: config.max_envelope_bytes,
            allowed_algorithms,
            custodian,
            keys,
            vault,
            sessions,
            sink,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Uploads stored
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Uploads refused or failed
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Issue a credential for the owner of a pending dataset, valid for
    /// [`DEFAULT_CREDENTIAL_TTL_SECS`]
    pub fn issue_credential(&self, dataset_id: &DatasetId, now: u64) -> CollabResult<String> {
        let record = self
            .vault
            .get(dataset_id)
            .ok_or_else(|| CollabError::DatasetNotFound(dataset_id.to_string()))?;
        if record.status != DatasetStatus::Pending {
            return Err(CollabError::DuplicateUpload {
                dataset_id: dataset_id.to_string(),
            });
        }
        self.sessions.require_active(&record.descriptor.session_id)?;

        UploadCredential {
            dataset_id: record.descriptor.id,
            session_id: record.descriptor.session_id,
            uploader_id: record.descriptor.owner_id,
            expires_at: now + DEFAULT_CREDENTIAL_TTL_SECS,
        }
        .issue(&self.credential_secret)
    }

    /// Receive an envelope
    pub fn receive(&self, credential: &str, envelope: &UploadEnvelope) -> CollabResult<UploadReceipt> {
        self.receive_at(credential, envelope, current_timestamp())
    }

    /// Receive an envelope as of `now`
    pub fn receive_at(
        &self,
        credential: &str,
        envelope: &UploadEnvelope,
        now: u64,
    ) -> CollabResult<UploadReceipt> {
        let result = self.admit(credential, envelope, now).and_then(|algorithm| {
            self.vault.claim(&envelope.dataset_id)?;
            self.process_claimed(envelope, algorithm)
        });

        match &result {
            Ok(receipt) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    dataset_id = %receipt.dataset_id,
                    session_id = %receipt.session_id,
                    size = receipt.size_bytes,
                    checksum = %receipt.checksum,
                    "dataset available"
                );
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if e.is_critical() {
                    tracing::error!(dataset_id = %envelope.dataset_id, code = e.error_code(), error = %e, "upload failed");
                } else if e.is_suspicious() {
                    tracing::warn!(dataset_id = %envelope.dataset_id, code = e.error_code(), error = %e, "upload rejected");
                } else {
                    tracing::info!(dataset_id = %envelope.dataset_id, code = e.error_code(), "upload rejected");
                }
            }
        }

        result.map_err(CollabError::sanitized)
    }

    /// Checks that run before any key material or dataset state is touched
    fn admit(
        &self,
        credential: &str,
        envelope: &UploadEnvelope,
        now: u64,
    ) -> CollabResult<SymmetricAlgorithm> {
        let credential = UploadCredential::validate_at(credential, &self.credential_secret, now)?;
        if !credential.covers(&envelope.session_id, &envelope.dataset_id) {
            return Err(CollabError::CredentialScopeMismatch);
        }

        if envelope.ciphertext.len() > self.max_envelope_bytes {
            return Err(CollabError::EnvelopeTooLarge {
                max_size: self.max_envelope_bytes,
            });
        }

        let algorithm = SymmetricAlgorithm::from_tag(&envelope.algorithm_tag)?;
        if !self.allowed_algorithms.contains(&algorithm) {
            return Err(CollabError::UnsupportedAlgorithm(envelope.algorithm_tag.clone()));
        }

        if !secure_compare(&envelope.key_id, &self.custodian.key_id()) {
            return Err(CollabError::UnknownEnclaveKey);
        }

        if envelope.iv.len() != NONCE_LEN {
            return Err(binding("iv"));
        }

        let ad = AssociatedData::parse(&envelope.associated_data)?;
        if ad.dataset_id != envelope.dataset_id {
            return Err(binding("dataset_id"));
        }
        if ad.session_id != envelope.session_id {
            return Err(binding("session_id"));
        }
        if ad.plaintext_sha256 != envelope.checksum {
            return Err(binding("checksum"));
        }

        self.sessions.require_active(&envelope.session_id)?;
        let record = self
            .vault
            .get(&envelope.dataset_id)
            .ok_or_else(|| CollabError::DatasetNotFound(envelope.dataset_id.to_string()))?;
        if record.descriptor.session_id != envelope.session_id {
            return Err(binding("session_id"));
        }
        if record.descriptor.owner_id != credential.uploader_id {
            return Err(CollabError::NotAuthorized {
                party: credential.uploader_id.to_string(),
            });
        }

        Ok(algorithm)
    }

    /// Steps after the dataset was claimed; any failure marks it `failed`
    fn process_claimed(
        &self,
        envelope: &UploadEnvelope,
        algorithm: SymmetricAlgorithm,
    ) -> CollabResult<UploadReceipt> {
        match self.decrypt_and_store(envelope, algorithm) {
            Ok(receipt) => {
                self.sink.publish(
                    StatusEvent::dataset(receipt.dataset_id.as_str(), DatasetStatus::Available.as_str())
                        .with("checksum", &receipt.checksum)
                        .with("size", receipt.size_bytes),
                );
                Ok(receipt)
            }
            Err(e) => {
                // the dataset is gone if its session was closed meanwhile
                if let Err(mark) = self.vault.fail(&envelope.dataset_id) {
                    tracing::warn!(dataset_id = %envelope.dataset_id, error = %mark, "could not mark dataset failed");
                }
                self.sink.publish(
                    StatusEvent::dataset(envelope.dataset_id.as_str(), DatasetStatus::Failed.as_str())
                        .with("error_code", e.error_code()),
                );
                Err(e)
            }
        }
    }

    fn decrypt_and_store(
        &self,
        envelope: &UploadEnvelope,
        algorithm: SymmetricAlgorithm,
    ) -> CollabResult<UploadReceipt> {
        let unwrapped = self.custodian.unwrap_key(&envelope.wrapped_key)?;
        if unwrapped.len() != KEY_LEN {
            return Err(CollabError::KeyUnwrapFailed);
        }
        let mut upload_key = Zeroizing::new([0u8; KEY_LEN]);
        upload_key.copy_from_slice(&unwrapped);
        drop(unwrapped);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&envelope.iv);

        let plaintext = Zeroizing::new(algorithm.decrypt(
            &upload_key,
            &nonce,
            &envelope.ciphertext,
            &envelope.associated_data,
        )?);
        drop(upload_key);

        let declared = hex::decode(&envelope.checksum).map_err(|_| CollabError::ChecksumMismatch)?;
        if !secure_compare(&sha256(&plaintext), &declared) {
            return Err(CollabError::ChecksumMismatch);
        }

        let sealed = self.keys.seal(
            &envelope.session_id,
            &plaintext,
            &session_aad(&envelope.session_id, &envelope.dataset_id),
        )?;
        let size_bytes = plaintext.len();
        let checksum = sha256_hex(&plaintext);
        drop(plaintext);

        let record = self
            .vault
            .complete(&envelope.dataset_id, sealed, checksum.clone(), size_bytes)?;

        Ok(UploadReceipt {
            dataset_id: envelope.dataset_id.clone(),
            session_id: envelope.session_id.clone(),
            status: record.status,
            checksum,
            size_bytes,
        })
    }
}

fn binding(field: &str) -> CollabError {
    CollabError::EnvelopeBindingMismatch { field: field.into() }
}
