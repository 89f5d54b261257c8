//! Short-lived upload credential
//!
//! Issued by the control plane, validated by the enclave. Token format:
//! `hex(json claims) "." hex(HMAC-SHA256(secret, json claims))`.

use crate::crypto::{hmac_sha256, hmac_sha256_verify};
use crate::error::{CollabError, CollabResult};
use crate::types::{DatasetId, ParticipantId, SessionId};

use serde::{Deserialize, Serialize};

/// Default credential lifetime used by the control plane
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 3600;

/// Claims carried by an upload credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    /// Dataset the holder may upload
    pub dataset_id: DatasetId,
    /// Session the dataset belongs to
    pub session_id: SessionId,
    /// Uploading participant
    pub uploader_id: ParticipantId,
    /// Expiry (Unix seconds)
    pub expires_at: u64,
}

impl UploadCredential {
    /// Sign the claims into a bearer token
    pub fn issue(&self, secret: &[u8]) -> CollabResult<String> {
        let payload = serde_json::to_vec(self)?;
        let mac = hmac_sha256(secret, &payload)?;
        Ok(format!("{}.{}", hex::encode(payload), hex::encode(mac)))
    }

    /// Validate a token's MAC and expiry as of `now`
    pub fn validate_at(token: &str, secret: &[u8], now: u64) -> CollabResult<Self> {
        let (payload_hex, mac_hex) = token.split_once('.').ok_or(CollabError::CredentialInvalid)?;
        let payload = hex::decode(payload_hex).map_err(|_| CollabError::CredentialInvalid)?;
        let mac = hex::decode(mac_hex).map_err(|_| CollabError::CredentialInvalid)?;

        if !hmac_sha256_verify(secret, &payload, &mac)? {
            return Err(CollabError::CredentialInvalid);
        }

        let credential: Self =
            serde_json::from_slice(&payload).map_err(|_| CollabError::CredentialInvalid)?;
        if now >= credential.expires_at {
            return Err(CollabError::CredentialExpired);
        }

        Ok(credential)
    }

    /// Whether the credential covers this dataset in this session
    pub fn covers(&self, session_id: &SessionId, dataset_id: &DatasetId) -> bool {
        &self.session_id == session_id && &self.dataset_id == dataset_id
    }
}
