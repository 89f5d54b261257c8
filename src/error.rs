//! Error types for Collab Shield
//!
//! Every failure is either returned to the caller with no state change or
//! recorded as a terminal state on the entity it concerns. Messages never
//! carry plaintext or key material, and cryptographic failures collapse to a
//! single external code so the upload endpoint cannot be used as an oracle.

use core::fmt;

/// Result type for Collab Shield operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Main error type for Collab Shield
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    // === Authentication / authorization ===
    /// Upload credential is malformed or its MAC does not verify
    CredentialInvalid,

    /// Upload credential is past its expiry
    CredentialExpired,

    /// Credential scope does not match the envelope it accompanies
    CredentialScopeMismatch,

    /// Caller is not an authorized party for this operation
    NotAuthorized {
        /// Identity that was refused
        party: String,
    },

    // === Upload protocol ===
    /// Envelope fields disagree with each other or with the credential
    EnvelopeBindingMismatch {
        /// Field that failed to bind
        field: String,
    },

    /// Envelope was addressed to a different enclave key
    UnknownEnclaveKey,

    /// Algorithm tag not accepted by this enclave
    UnsupportedAlgorithm(String),

    /// Envelope exceeds the configured maximum size
    EnvelopeTooLarge {
        /// Maximum accepted size in bytes
        max_size: usize,
    },

    /// Another upload for this dataset already claimed it
    DuplicateUpload {
        /// Dataset that was already claimed
        dataset_id: String,
    },

    // === Cryptographic ===
    /// The wrapped upload key could not be unwrapped
    KeyUnwrapFailed,

    /// Authenticated decryption failed (tag or associated-data mismatch)
    DecryptionFailed,

    /// Recovered plaintext does not match the declared checksum
    ChecksumMismatch,

    /// Encryption operation failed
    EncryptionFailed,

    /// Random number generation failed
    RngFailed,

    /// Cryptographic operation failed
    CryptoError(String),

    // === Attestation ===
    /// Attestation could not be issued
    AttestationFailed(String),

    /// Attestation signature did not verify
    AttestationSignatureInvalid,

    /// Attestation is past its expiry
    AttestationExpired,

    /// Declared code measurement is not the expected one
    MeasurementMismatch,

    /// Attested public key does not match the trusted key or its identifier
    KeyBindingMismatch,

    // === State machine ===
    /// Party already has an approval record for this query
    AlreadyApproved {
        /// Query the record belongs to
        query_id: String,
    },

    /// Operation is not allowed in the entity's current state
    InvalidState {
        /// Current state
        current: String,
        /// Operation that was attempted
        operation: String,
    },

    /// Session is unknown
    SessionNotFound(String),

    /// Session is closed
    SessionClosed(String),

    /// Dataset is unknown
    DatasetNotFound(String),

    /// Dataset exists but is not in the `available` state
    DatasetUnavailable(String),

    /// Query is unknown
    QueryNotFound(String),

    // === Execution ===
    /// Query execution failed
    ExecutionFailed(String),

    /// Execution output violates the declared privacy level
    PrivacyViolation(String),

    // === System ===
    /// Input failed validation
    InvalidInput(String),

    /// Configuration error
    ConfigurationError(String),

    /// Feature not supported by this build
    NotSupported(String),

    /// Internal error (should not happen)
    InternalError(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialInvalid => write!(f, "Upload credential is invalid"),
            Self::CredentialExpired => write!(f, "Upload credential has expired"),
            Self::CredentialScopeMismatch => {
                write!(f, "Upload credential does not cover this upload")
            }
            Self::NotAuthorized { party } => {
                write!(f, "Party '{}' is not authorized for this operation", party)
            }

            Self::EnvelopeBindingMismatch { field } => {
                write!(f, "Upload envelope binding mismatch on '{}'", field)
            }
            Self::UnknownEnclaveKey => {
                write!(f, "Envelope is addressed to a different enclave key")
            }
            Self::UnsupportedAlgorithm(tag) => write!(f, "Unsupported algorithm: {}", tag),
            Self::EnvelopeTooLarge { max_size } => {
                write!(f, "Envelope too large. Maximum size: {} bytes", max_size)
            }
            Self::DuplicateUpload { dataset_id } => {
                write!(f, "Dataset {} has already been uploaded or is uploading", dataset_id)
            }

            Self::KeyUnwrapFailed => write!(f, "Key unwrap failed"),
            Self::DecryptionFailed => write!(f, "Decryption failed"),
            Self::ChecksumMismatch => write!(f, "Plaintext checksum mismatch"),
            Self::EncryptionFailed => write!(f, "Encryption operation failed"),
            Self::RngFailed => write!(f, "Random number generation failed"),
            Self::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),

            Self::AttestationFailed(msg) => write!(f, "Attestation failed: {}", msg),
            Self::AttestationSignatureInvalid => {
                write!(f, "Attestation signature verification failed")
            }
            Self::AttestationExpired => write!(f, "Attestation has expired"),
            Self::MeasurementMismatch => write!(f, "Code measurement mismatch"),
            Self::KeyBindingMismatch => write!(f, "Attested key binding mismatch"),

            Self::AlreadyApproved { query_id } => {
                write!(f, "Query {} already has a decision from this party", query_id)
            }
            Self::InvalidState { current, operation } => {
                write!(f, "Cannot {} while in state '{}'", operation, current)
            }
            Self::SessionNotFound(id) => write!(f, "Session {} not found", id),
            Self::SessionClosed(id) => write!(f, "Session {} is closed", id),
            Self::DatasetNotFound(id) => write!(f, "Dataset {} not found", id),
            Self::DatasetUnavailable(id) => write!(f, "Dataset {} is not available", id),
            Self::QueryNotFound(id) => write!(f, "Query {} not found", id),

            Self::ExecutionFailed(msg) => write!(f, "Query execution failed: {}", msg),
            Self::PrivacyViolation(msg) => write!(f, "Privacy level violated: {}", msg),

            Self::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Self::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            Self::NotSupported(feature) => write!(f, "Feature not supported: {}", feature),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<hex::FromHexError> for CollabError {
    fn from(e: hex::FromHexError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl CollabError {
    /// Stable, non-sensitive error code reported to callers
    ///
    /// All decryption-path failures share `decryption_failed`.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CredentialInvalid => "credential_invalid",
            Self::CredentialExpired => "credential_expired",
            Self::CredentialScopeMismatch => "credential_scope_mismatch",
            Self::NotAuthorized { .. } => "not_authorized",
            Self::EnvelopeBindingMismatch { .. } => "envelope_binding_mismatch",
            Self::UnknownEnclaveKey => "unknown_enclave_key",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::EnvelopeTooLarge { .. } => "envelope_too_large",
            Self::DuplicateUpload { .. } => "duplicate_upload",
            Self::KeyUnwrapFailed | Self::DecryptionFailed | Self::ChecksumMismatch => {
                "decryption_failed"
            }
            Self::EncryptionFailed
            | Self::RngFailed
            | Self::CryptoError(_)
            | Self::InternalError(_) => "internal_error",
            Self::AttestationFailed(_) => "attestation_failed",
            Self::AttestationSignatureInvalid
            | Self::AttestationExpired
            | Self::MeasurementMismatch
            | Self::KeyBindingMismatch => "attestation_rejected",
            Self::AlreadyApproved { .. } => "already_approved",
            Self::InvalidState { .. } => "invalid_state",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionClosed(_) => "session_closed",
            Self::DatasetNotFound(_) => "dataset_not_found",
            Self::DatasetUnavailable(_) => "dataset_unavailable",
            Self::QueryNotFound(_) => "query_not_found",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::PrivacyViolation(_) => "privacy_violation",
            Self::InvalidInput(_) => "invalid_input",
            Self::ConfigurationError(_) => "configuration_error",
            Self::NotSupported(_) => "not_supported",
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::InternalError(_)
                | Self::CryptoError(_)
                | Self::RngFailed
                | Self::EncryptionFailed
                | Self::AttestationFailed(_)
        )
    }

    /// Check if this error indicates a potential attack
    pub fn is_suspicious(&self) -> bool {
        matches!(
            self,
            Self::CredentialInvalid
                | Self::CredentialScopeMismatch
                | Self::EnvelopeBindingMismatch { .. }
                | Self::KeyUnwrapFailed
                | Self::DecryptionFailed
                | Self::ChecksumMismatch
                | Self::AttestationSignatureInvalid
                | Self::KeyBindingMismatch
        )
    }

    /// Form safe to return to an uploader
    ///
    /// Unwrap, AEAD and checksum failures all become `DecryptionFailed` so the
    /// caller cannot tell which step rejected the envelope.
    pub fn sanitized(self) -> Self {
        match self {
            Self::KeyUnwrapFailed | Self::ChecksumMismatch => Self::DecryptionFailed,
            other => other,
        }
    }

    /// Get HTTP status code for this error
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::CredentialInvalid | Self::CredentialExpired => 401,
            Self::CredentialScopeMismatch | Self::NotAuthorized { .. } => 403,
            Self::EnvelopeBindingMismatch { .. }
            | Self::UnknownEnclaveKey
            | Self::UnsupportedAlgorithm(_)
            | Self::KeyUnwrapFailed
            | Self::DecryptionFailed
            | Self::ChecksumMismatch
            | Self::InvalidInput(_) => 400,
            Self::EnvelopeTooLarge { .. } => 413,
            Self::DuplicateUpload { .. }
            | Self::AlreadyApproved { .. }
            | Self::InvalidState { .. }
            | Self::SessionClosed(_)
            | Self::DatasetUnavailable(_) => 409,
            Self::SessionNotFound(_) | Self::DatasetNotFound(_) | Self::QueryNotFound(_) => 404,
            Self::PrivacyViolation(_) => 422,
            Self::NotSupported(_) => 501,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CollabError::EnvelopeTooLarge { max_size: 1024 };
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_crypto_failures_share_one_code() {
        assert_eq!(CollabError::DecryptionFailed.error_code(), "decryption_failed");
        assert_eq!(CollabError::ChecksumMismatch.error_code(), "decryption_failed");
        assert_eq!(CollabError::KeyUnwrapFailed.error_code(), "decryption_failed");
        assert_ne!(CollabError::DecryptionFailed, CollabError::ChecksumMismatch);
    }

    #[test]
    fn test_sanitized_hides_decryption_step() {
        for err in [
            CollabError::KeyUnwrapFailed,
            CollabError::DecryptionFailed,
            CollabError::ChecksumMismatch,
        ] {
            let public = err.sanitized();
            assert_eq!(public, CollabError::DecryptionFailed);
            assert_eq!(public.to_string(), "Decryption failed");
        }
        assert_eq!(
            CollabError::CredentialExpired.sanitized(),
            CollabError::CredentialExpired
        );
    }

    #[test]
    fn test_state_machine_codes() {
        let err = CollabError::AlreadyApproved { query_id: "q1".into() };
        assert_eq!(err.error_code(), "already_approved");
        assert_eq!(err.http_status_code(), 409);

        let err = CollabError::NotAuthorized { party: "mallory".into() };
        assert_eq!(err.error_code(), "not_authorized");
        assert_eq!(err.http_status_code(), 403);
    }

    #[test]
    fn test_critical_and_suspicious() {
        assert!(CollabError::RngFailed.is_critical());
        assert!(!CollabError::CredentialExpired.is_critical());
        assert!(CollabError::DecryptionFailed.is_suspicious());
        assert!(!CollabError::SessionClosed("s".into()).is_suspicious());
    }
}
