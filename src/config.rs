//! Configuration for Collab Shield
//!
//! One section per component, each with sensible defaults and its own
//! validation. The control plane hands the enclave a JSON document at boot.

use crate::error::{CollabError, CollabResult};

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Key custodian configuration
    pub custodian: CustodianConfig,
    /// Attestation issuer configuration
    pub attestation: AttestationConfig,
    /// Upload endpoint configuration
    pub upload: UploadConfig,
    /// Control-plane notifier configuration
    pub notifier: NotifierConfig,
    /// Query execution configuration
    pub execution: ExecutionConfig,
}

impl CollabConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> CollabResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(CollabError::ConfigurationError)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.custodian.validate()?;
        self.attestation.validate()?;
        self.upload.validate()?;
        self.notifier.validate()?;
        self.execution.validate()?;
        Ok(())
    }
}

/// Key custodian configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodianConfig {
    /// RSA modulus size in bits
    pub key_bits: usize,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self { key_bits: 4096 }
    }
}

impl CustodianConfig {
    fn validate(&self) -> Result<(), String> {
        if self.key_bits < 2048 {
            return Err("key_bits must be >= 2048".into());
        }
        if self.key_bits % 8 != 0 {
            return Err("key_bits must be a multiple of 8".into());
        }
        Ok(())
    }
}

/// Attestation issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// `iss` claim
    pub issuer: String,
    /// `sub` claim
    pub subject: String,
    /// Kind of trusted execution environment
    pub tee_type: String,
    /// Image the VM was booted from, if known
    pub image_id: Option<String>,
    /// Hex SHA-256 of the measured code; derived from the running binary when absent
    pub code_measurement: Option<String>,
    /// Claim set validity window in seconds
    pub validity_seconds: u64,
    /// How long an issued claim set may be served from cache
    pub cache_ttl_seconds: u64,
    /// Guest memory is encrypted by the platform
    pub memory_encryption: bool,
    /// Firmware enforced secure boot
    pub secure_boot: bool,
    /// Boot chain was measured
    pub measured_boot: bool,
    /// No interactive shell access to the guest
    pub ssh_disabled: bool,
    /// Code image is read-only
    pub immutable_code: bool,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            issuer: "collab-shield".into(),
            subject: "enclave".into(),
            tee_type: "confidential_vm".into(),
            image_id: None,
            code_measurement: None,
            validity_seconds: 3600, // 1 hour
            cache_ttl_seconds: 300,
            memory_encryption: true,
            secure_boot: true,
            measured_boot: true,
            ssh_disabled: true,
            immutable_code: true,
        }
    }
}

impl AttestationConfig {
    fn validate(&self) -> Result<(), String> {
        if self.validity_seconds == 0 {
            return Err("validity_seconds must be > 0".into());
        }
        if self.cache_ttl_seconds >= self.validity_seconds {
            return Err("cache_ttl_seconds must be < validity_seconds".into());
        }
        if let Some(measurement) = &self.code_measurement {
            match hex::decode(measurement) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => return Err("code_measurement must be 32 hex-encoded bytes".into()),
            }
        }
        if self.issuer.is_empty() || self.subject.is_empty() {
            return Err("issuer and subject must be set".into());
        }
        Ok(())
    }
}

/// Upload endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Hex-encoded MAC secret shared with the control plane
    pub credential_secret: String,
    /// Maximum ciphertext size accepted in one envelope
    pub max_envelope_bytes: usize,
    /// Accepted envelope algorithm tags
    pub allowed_algorithms: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            credential_secret: String::new(),
            max_envelope_bytes: 256 * 1024 * 1024, // 256 MiB
            allowed_algorithms: vec!["AES-256-GCM".into(), "CHACHA20-POLY1305".into()],
        }
    }
}

impl UploadConfig {
    fn validate(&self) -> Result<(), String> {
        // An empty secret is allowed here; the orchestrator refuses to start without one.
        if !self.credential_secret.is_empty() {
            match hex::decode(&self.credential_secret) {
                Ok(bytes) if bytes.len() >= 32 => {}
                _ => return Err("credential_secret must be >= 32 hex-encoded bytes".into()),
            }
        }
        if self.max_envelope_bytes == 0 {
            return Err("max_envelope_bytes must be > 0".into());
        }
        if self.allowed_algorithms.is_empty() {
            return Err("allowed_algorithms must not be empty".into());
        }
        Ok(())
    }

    /// Decoded credential secret
    pub fn secret_bytes(&self) -> CollabResult<Vec<u8>> {
        let bytes = hex::decode(&self.credential_secret)?;
        if bytes.len() < 32 {
            return Err(CollabError::ConfigurationError(
                "credential_secret must be >= 32 bytes".into(),
            ));
        }
        Ok(bytes)
    }
}

/// Control-plane notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Delivery attempts per event before it is dropped
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay
    pub max_backoff_ms: u64,
    /// Events buffered before `notify` starts dropping
    pub queue_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            queue_capacity: 1024,
        }
    }
}

impl NotifierConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".into());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err("max_backoff_ms must be >= initial_backoff_ms".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be > 0".into());
        }
        Ok(())
    }
}

/// Query execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Minimum group size kept under `k_anonymized`
    pub k_anonymity_threshold: u64,
    /// Rows kept in a stored result
    pub max_result_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            k_anonymity_threshold: 5,
            max_result_rows: 10_000,
        }
    }
}

impl ExecutionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.k_anonymity_threshold < 2 {
            return Err("k_anonymity_threshold must be >= 2".into());
        }
        if self.max_result_rows == 0 {
            return Err("max_result_rows must be > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CollabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.custodian.key_bits, 4096);
        assert_eq!(config.attestation.validity_seconds, 3600);
    }

    #[test]
    fn test_from_json_partial() {
        let json = r#"{
            "custodian": { "key_bits": 2048 },
            "upload": { "credential_secret": "0000000000000000000000000000000000000000000000000000000000000000" }
        }"#;

        let config = CollabConfig::from_json(json).unwrap();
        assert_eq!(config.custodian.key_bits, 2048);
        assert_eq!(config.upload.secret_bytes().unwrap().len(), 32);
        assert_eq!(config.notifier.max_attempts, 5);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = CollabConfig::default();
        config.custodian.key_bits = 1024;
        assert!(config.validate().is_err());

        let mut config = CollabConfig::default();
        config.attestation.cache_ttl_seconds = config.attestation.validity_seconds;
        assert!(config.validate().is_err());

        let mut config = CollabConfig::default();
        config.upload.credential_secret = "abcd".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = CollabConfig::from_json(r#"{ "notifier": { "max_attempts": 0 } }"#).unwrap_err();
        assert_eq!(err.error_code(), "configuration_error");
    }
}
