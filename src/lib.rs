//! # Collab Shield
//!
//! Trusted core of a zero-trust data collaboration service. Several parties
//! upload sensitive datasets into a confidential VM; a query over those
//! datasets runs only after the required parties approve it, and only the
//! privacy-treated result leaves the enclave.
//!
//! ## Architecture
//!
//! 1. **Key Custodian** - enclave RSA identity, generated in memory and never
//!    exported
//! 2. **Attestation Issuer** - signed claims binding the enclave public key to
//!    the code measurement
//! 3. **Hybrid Upload Codec** - AEAD-encrypted datasets with RSA-OAEP wrapped
//!    keys, re-sealed under a per-session key
//! 4. **Session Key Store** - one symmetric key per collaboration session,
//!    zeroized on destruction
//! 5. **Query Lifecycle Controller** - approval ledger, threshold check and
//!    execution inside the enclave
//! 6. **Control-Plane Notifier** - non-blocking status events with retry
//!
//! ## Security Model
//!
//! - Plaintext and key material never leave the enclave and are never logged
//! - An approval is counted at most once per party
//! - Decryption failures are reported with one code, without detail
//! - A rejected query never runs
//!
//! ## Example
//!
//! ```rust,no_run
//! use collab_shield::{CollabConfig, CollabShield, CsvSummaryExecutor};
//! use collab_shield::notifier::StatusSink;
//! use std::sync::Arc;
//!
//! # fn run(sink: Arc<dyn StatusSink>) -> collab_shield::CollabResult<()> {
//! let config = CollabConfig::from_json(r#"{"upload": {"credential_secret": "..."}}"#)?;
//! let shield = CollabShield::new(config, Arc::new(CsvSummaryExecutor), sink)?;
//!
//! // Hand the attestation to clients before they upload
//! let attestation = shield.attestation()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod attestation;
pub mod config;
pub mod crypto;
pub mod custodian;
pub mod data;
pub mod error;
pub mod notifier;
pub mod query;
pub mod session;
pub mod types;
pub mod upload;

pub use attestation::{AttestationIssuer, AttestationVerifier, SignedAttestation, VerifiedEnclave};
pub use config::CollabConfig;
pub use custodian::KeyCustodian;
pub use error::{CollabError, CollabResult};
pub use query::{CsvSummaryExecutor, LedgerSnapshot, QueryExecutor};
pub use types::*;
pub use upload::{seal_upload, UploadCredential, UploadEnvelope, UploadReceipt};

use data::{DatasetRecord, DatasetVault, SessionKeyStore};
use notifier::StatusSink;
use query::QueryController;
use session::{SessionDirectory, SessionRecord};
use types::current_timestamp;
use upload::UploadService;

use std::sync::Arc;

/// Collab Shield - enclave orchestrator
///
/// Wires the components together and enforces cross-component rules such
/// as session membership and session teardown.
pub struct CollabShield {
    custodian: Arc<KeyCustodian>,
    issuer: AttestationIssuer,
    sessions: Arc<SessionDirectory>,
    vault: Arc<DatasetVault>,
    keys: Arc<SessionKeyStore>,
    uploads: UploadService,
    queries: QueryController,
    sink: Arc<dyn StatusSink>,
    started_at: u64,
}

impl CollabShield {
    /// Create a shield with a freshly generated enclave identity
    ///
    /// # Security
    /// - The private key is generated inside the enclave and never exported
    /// - Runs the crypto self-test before anything else
    pub fn new(
        config: CollabConfig,
        executor: Arc<dyn QueryExecutor>,
        sink: Arc<dyn StatusSink>,
    ) -> CollabResult<Self> {
        crypto::init()?;
        config.validate().map_err(CollabError::ConfigurationError)?;

        let custodian = Arc::new(KeyCustodian::generate_identity(&config.custodian)?);
        Self::with_custodian(config, custodian, executor, sink)
    }

    /// Create a shield around an existing identity
    pub fn with_custodian(
        config: CollabConfig,
        custodian: Arc<KeyCustodian>,
        executor: Arc<dyn QueryExecutor>,
        sink: Arc<dyn StatusSink>,
    ) -> CollabResult<Self> {
        crypto::init()?;
        config.validate().map_err(CollabError::ConfigurationError)?;

        let sessions = Arc::new(SessionDirectory::new());
        let vault = Arc::new(DatasetVault::new());
        let keys = Arc::new(SessionKeyStore::new());

        let issuer = AttestationIssuer::new(&config.attestation, Arc::clone(&custodian))?;
        let uploads = UploadService::new(
            &config.upload,
            Arc::clone(&custodian),
            Arc::clone(&keys),
            Arc::clone(&vault),
            Arc::clone(&sessions),
            Arc::clone(&sink),
        )?;
        let queries = QueryController::new(
            &config.execution,
            Arc::clone(&sessions),
            Arc::clone(&vault),
            Arc::clone(&keys),
            executor,
            Arc::clone(&sink),
        );

        tracing::info!(
            key_id = %custodian.key_id_hex(),
            measurement = %hex::encode(issuer.code_measurement()),
            "collab shield initialized"
        );

        Ok(Self {
            custodian,
            issuer,
            sessions,
            vault,
            keys,
            uploads,
            queries,
            sink,
            started_at: current_timestamp(),
        })
    }

    /// Current signed attestation
    pub fn attestation(&self) -> CollabResult<SignedAttestation> {
        self.issuer.issue()
    }

    /// Enclave public key, PEM encoded
    pub fn public_key_pem(&self) -> &str {
        self.custodian.public_key_pem()
    }

    /// Enclave key identifier, hex encoded
    pub fn key_id_hex(&self) -> String {
        self.custodian.key_id_hex()
    }

    /// Code measurement in attestations
    pub fn code_measurement(&self) -> [u8; 32] {
        self.issuer.code_measurement()
    }

    /// Seconds since initialization
    pub fn uptime(&self) -> u64 {
        current_timestamp().saturating_sub(self.started_at)
    }

    // ---- sessions ----

    /// Open a collaboration session
    pub fn open_session(&self, session: CollaborationSession) -> CollabResult<SessionRecord> {
        let record = self.sessions.open(session)?;
        tracing::info!(
            session_id = %record.session.id,
            participants = record.session.participants.len(),
            "session opened"
        );
        Ok(record)
    }

    /// Close a session: reject its open queries, destroy its key, purge its
    /// datasets
    pub fn close_session(&self, session_id: &SessionId) -> CollabResult<SessionRecord> {
        let record = self.sessions.close(session_id)?;
        let rejected = self.queries.close_session(session_id)?;
        let destroyed = self.keys.retire(session_id)?;
        let purged = self.vault.purge_session(session_id)?;

        tracing::info!(
            session_id = %session_id,
            rejected_queries = rejected,
            key_destroyed = destroyed,
            purged_datasets = purged,
            "session closed"
        );
        Ok(record)
    }

    /// Session state
    pub fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id)
    }

    // ---- datasets ----

    /// Register a dataset ahead of its upload
    ///
    /// The owner must participate in the (active) session.
    pub fn register_dataset(&self, descriptor: DatasetDescriptor) -> CollabResult<DatasetRecord> {
        let session = self.sessions.require_active(&descriptor.session_id)?;
        if !session.is_participant(&descriptor.owner_id) {
            return Err(CollabError::NotAuthorized {
                party: descriptor.owner_id.to_string(),
            });
        }

        let record = self.vault.register(descriptor)?;
        self.sink.publish(
            notifier::StatusEvent::dataset(
                record.descriptor.id.as_str(),
                record.status.as_str(),
            )
            .with("session_id", &record.descriptor.session_id),
        );
        Ok(record)
    }

    /// Dataset state
    pub fn dataset(&self, dataset_id: &DatasetId) -> Option<DatasetRecord> {
        self.vault.get(dataset_id)
    }

    /// Issue an upload credential for the registered owner of a pending
    /// dataset
    pub fn upload_credential(&self, dataset_id: &DatasetId) -> CollabResult<String> {
        self.uploads.issue_credential(dataset_id, current_timestamp())
    }

    /// Receive an upload envelope under `credential`
    pub fn upload(&self, credential: &str, envelope: &UploadEnvelope) -> CollabResult<UploadReceipt> {
        self.uploads.receive(credential, envelope)
    }

    // ---- queries ----

    /// Submit a query
    pub fn submit_query(
        &self,
        session_id: &SessionId,
        submitter: &ParticipantId,
        dataset_ids: &[DatasetId],
        query_text: &str,
        privacy_level: PrivacyLevel,
    ) -> CollabResult<Query> {
        self.queries
            .submit(session_id, submitter, dataset_ids, query_text, privacy_level)
    }

    /// Approve a query; may trigger execution
    pub fn approve_query(
        &self,
        query_id: &QueryId,
        approver_id: &ParticipantId,
        notes: &str,
    ) -> CollabResult<DecisionOutcome> {
        self.queries.approve(query_id, approver_id, notes)
    }

    /// Reject a query
    pub fn reject_query(
        &self,
        query_id: &QueryId,
        rejector_id: &ParticipantId,
        reason: &str,
    ) -> CollabResult<DecisionOutcome> {
        self.queries.reject(query_id, rejector_id, reason)
    }

    /// Query state
    pub fn query(&self, query_id: &QueryId) -> CollabResult<Query> {
        self.queries.query(query_id)
    }

    /// Approval tally of a query
    pub fn tally(&self, query_id: &QueryId) -> CollabResult<ApprovalTally> {
        self.queries.tally(query_id)
    }

    /// Decisions recorded on a query
    pub fn approvals(&self, query_id: &QueryId) -> Vec<ApprovalRecord> {
        self.queries.approvals(query_id)
    }

    /// Result of a completed query
    pub fn result(&self, query_id: &QueryId, requester: &ParticipantId) -> CollabResult<QueryResult> {
        self.queries.result(query_id, requester)
    }

    // ---- integrity & persistence ----

    /// Tampering suspected: destroy the session key
    ///
    /// Datasets sealed under the key become unreadable; queries over them end
    /// in `error`.
    pub fn integrity_alert(&self, session_id: &SessionId) -> CollabResult<bool> {
        let destroyed = self.keys.destroy(session_id)?;
        tracing::error!(session_id = %session_id, key_destroyed = destroyed, "integrity alert");
        Ok(destroyed)
    }

    /// Shutdown: destroy every session key
    pub fn destroy_all(&self) -> CollabResult<usize> {
        let destroyed = self.keys.destroy_all()?;
        tracing::info!(destroyed, "all session keys destroyed");
        Ok(destroyed)
    }

    /// Export the durable state
    pub fn snapshot(&self) -> CollabResult<LedgerSnapshot> {
        self.queries.snapshot()
    }

    /// Restore durable state after a restart
    pub fn restore(&self, snapshot: LedgerSnapshot) -> CollabResult<()> {
        let queries = snapshot.queries.len();
        self.queries.restore(snapshot)?;
        tracing::info!(queries, "ledger restored");
        Ok(())
    }

    /// Counters for monitoring
    pub fn stats(&self) -> CollabStats {
        let (submitted, completed, rejected, errored) = self.queries.counts();
        CollabStats {
            uploads_accepted: self.uploads.accepted(),
            uploads_rejected: self.uploads.rejected(),
            queries_submitted: submitted,
            queries_completed: completed,
            queries_rejected: rejected,
            queries_errored: errored,
            active_session_keys: self.keys.active_sessions(),
            active_sessions: self.sessions.active_count(),
            uptime_secs: self.uptime(),
            notifications_delivered: self.sink.delivered_count(),
            notifications_dropped: self.sink.dropped_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricAlgorithm;
    use crate::custodian::test_support::shared_custodian;
    use crate::data::DecryptedDataset;
    use crate::notifier::test_support::RecordingSink;
    use crate::upload::tests::SECRET_HEX;

    struct Harness {
        shield: CollabShield,
        sink: Arc<RecordingSink>,
        enclave: VerifiedEnclave,
    }

    fn count_rows(_: &str, datasets: &[DecryptedDataset], _: PrivacyLevel) -> CollabResult<QueryOutput> {
        let total: usize = datasets
            .iter()
            .map(|d| d.bytes().iter().filter(|b| **b == b'\n').count())
            .sum();
        Ok(QueryOutput::aggregate(
            vec!["lines".into()],
            vec![vec![total.to_string()]],
            vec![total as u64],
        ))
    }

    fn harness() -> Harness {
        let mut config = CollabConfig::default();
        config.upload.credential_secret = SECRET_HEX.into();
        config.attestation.code_measurement = Some(hex::encode([0x42u8; 32]));

        let sink = Arc::new(RecordingSink::default());
        let shield =
            CollabShield::with_custodian(config, shared_custodian(), Arc::new(count_rows), sink.clone())
                .unwrap();

        // client side: verify the attestation before trusting the key
        let attestation = shield.attestation().unwrap();
        let enclave = AttestationVerifier::new(
            shared_custodian().public_key().clone(),
            vec![shield.code_measurement()],
        )
        .check(&attestation)
        .unwrap();

        shield
            .open_session(CollaborationSession::new(
                "s1",
                ["alice", "bob"],
                ApprovalPolicy::Unanimous,
            ))
            .unwrap();

        Harness {
            shield,
            sink,
            enclave,
        }
    }

    fn credential(dataset: &str, uploader: &str) -> String {
        UploadCredential {
            dataset_id: dataset.into(),
            session_id: "s1".into(),
            uploader_id: uploader.into(),
            expires_at: current_timestamp() + 300,
        }
        .issue(&hex::decode(SECRET_HEX).unwrap())
        .unwrap()
    }

    fn upload(h: &Harness, dataset: &str, owner: &str, data: &[u8]) -> UploadReceipt {
        h.shield
            .register_dataset(DatasetDescriptor {
                id: dataset.into(),
                session_id: "s1".into(),
                owner_id: owner.into(),
            })
            .unwrap();
        let envelope = seal_upload(
            &h.enclave,
            &"s1".into(),
            &dataset.into(),
            data,
            SymmetricAlgorithm::Aes256Gcm,
        )
        .unwrap();
        let credential = h.shield.upload_credential(&dataset.into()).unwrap();
        h.shield.upload(&credential, &envelope).unwrap()
    }

    fn submitted(h: &Harness) -> Query {
        upload(h, "d1", "alice", b"a\n1\n2\n");
        upload(h, "d2", "bob", b"a\n3\n");
        h.shield
            .submit_query(
                &"s1".into(),
                &"alice".into(),
                &["d1".into(), "d2".into()],
                "COUNT",
                PrivacyLevel::AggregateOnly,
            )
            .unwrap()
    }

    #[test]
    fn test_two_approvals_complete_the_query() {
        let h = harness();
        let q = submitted(&h);

        let first = h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        assert_eq!(first.query.status, QueryStatus::Verifying);
        assert_eq!(first.tally.to_string(), "1/2");

        let second = h.shield.approve_query(&q.id, &"bob".into(), "fine").unwrap();
        assert_eq!(second.query.status, QueryStatus::Completed);
        assert_eq!(second.tally.to_string(), "2/2");

        let for_alice = h.shield.result(&q.id, &"alice".into()).unwrap();
        let for_bob = h.shield.result(&q.id, &"bob".into()).unwrap();
        assert_eq!(for_alice, for_bob);
        assert_eq!(for_alice.output.rows, vec![vec!["5".to_string()]]);

        assert_eq!(
            h.sink.statuses_for(q.id.as_str()),
            vec!["submitted", "verifying", "completed"]
        );
    }

    #[test]
    fn test_rejected_query_accepts_no_approval() {
        let h = harness();
        let q = submitted(&h);

        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        let rejected = h.shield.reject_query(&q.id, &"bob".into(), "no").unwrap();
        assert_eq!(rejected.query.status, QueryStatus::Rejected);

        for party in ["alice", "bob"] {
            let err = h.shield.approve_query(&q.id, &party.into(), "").unwrap_err();
            assert_eq!(err.error_code(), "invalid_state");
        }
        assert!(h.shield.result(&q.id, &"alice".into()).is_err());
    }

    #[test]
    fn test_misbound_upload_stores_nothing() {
        let h = harness();
        h.shield
            .register_dataset(DatasetDescriptor {
                id: "d1".into(),
                session_id: "s1".into(),
                owner_id: "alice".into(),
            })
            .unwrap();

        // encrypted for d2, presented as d1
        let mut envelope = seal_upload(
            &h.enclave,
            &"s1".into(),
            &"d2".into(),
            b"a\n1\n",
            SymmetricAlgorithm::Aes256Gcm,
        )
        .unwrap();
        envelope.dataset_id = "d1".into();

        let err = h.shield.upload(&credential("d1", "alice"), &envelope).unwrap_err();
        assert_eq!(err.error_code(), "envelope_binding_mismatch");
        assert_eq!(h.shield.dataset(&"d1".into()).unwrap().status, DatasetStatus::Pending);
        assert_eq!(h.shield.stats().active_session_keys, 0);
        assert_eq!(h.shield.stats().uploads_rejected, 1);
    }

    #[test]
    fn test_repeat_approval_is_not_counted() {
        let h = harness();
        let q = submitted(&h);

        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        let err = h.shield.approve_query(&q.id, &"alice".into(), "").unwrap_err();
        assert_eq!(err.error_code(), "already_approved");
        assert_eq!(h.shield.tally(&q.id).unwrap().to_string(), "1/2");
        assert_eq!(h.shield.query(&q.id).unwrap().status, QueryStatus::Verifying);
        assert_eq!(h.shield.approvals(&q.id).len(), 1);
    }

    #[test]
    fn test_register_requires_participant() {
        let h = harness();
        let err = h
            .shield
            .register_dataset(DatasetDescriptor {
                id: "d9".into(),
                session_id: "s1".into(),
                owner_id: "mallory".into(),
            })
            .unwrap_err();
        assert_eq!(err.error_code(), "not_authorized");
    }

    #[test]
    fn test_integrity_alert_breaks_execution() {
        let h = harness();
        let q = submitted(&h);
        assert!(h.shield.integrity_alert(&"s1".into()).unwrap());

        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        let done = h.shield.approve_query(&q.id, &"bob".into(), "").unwrap();
        assert_eq!(done.query.status, QueryStatus::Error);
        assert_eq!(h.shield.stats().queries_errored, 1);
    }

    #[test]
    fn test_close_session_tears_down() {
        let h = harness();
        let q = submitted(&h);
        assert_eq!(h.shield.stats().active_session_keys, 1);

        h.shield.close_session(&"s1".into()).unwrap();
        assert_eq!(h.shield.query(&q.id).unwrap().status, QueryStatus::Rejected);
        assert!(h.shield.dataset(&"d1".into()).is_none());
        assert_eq!(h.shield.stats().active_session_keys, 0);
        assert!(h
            .shield
            .submit_query(&"s1".into(), &"alice".into(), &["d1".into()], "COUNT", PrivacyLevel::AggregateOnly)
            .is_err());
    }

    #[test]
    fn test_closed_session_refuses_uploads_and_keys() {
        let h = harness();
        h.shield
            .register_dataset(DatasetDescriptor {
                id: "d1".into(),
                session_id: "s1".into(),
                owner_id: "alice".into(),
            })
            .unwrap();
        let token = h.shield.upload_credential(&"d1".into()).unwrap();
        let envelope = seal_upload(
            &h.enclave,
            &"s1".into(),
            &"d1".into(),
            b"a\n1\n",
            SymmetricAlgorithm::Aes256Gcm,
        )
        .unwrap();

        h.shield.close_session(&"s1".into()).unwrap();
        let err = h.shield.upload(&token, &envelope).unwrap_err();
        assert_eq!(err.error_code(), "session_closed");
        assert_eq!(h.shield.stats().active_session_keys, 0);
        assert_eq!(h.shield.stats().active_sessions, 0);
    }

    #[test]
    fn test_approver_can_still_veto() {
        let h = harness();
        let q = submitted(&h);
        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();

        let out = h.shield.reject_query(&q.id, &"alice".into(), "wrong dataset").unwrap();
        assert_eq!(out.query.status, QueryStatus::Rejected);
        assert_eq!(out.tally.to_string(), "1/2");
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let h = harness();
        let q = submitted(&h);
        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        let json = serde_json::to_string(&h.shield.snapshot().unwrap()).unwrap();

        let restarted = harness();
        restarted.shield.restore(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restarted.shield.tally(&q.id).unwrap().to_string(), "1/2");
    }

    #[test]
    fn test_stats() {
        let h = harness();
        let q = submitted(&h);
        h.shield.approve_query(&q.id, &"alice".into(), "").unwrap();
        h.shield.approve_query(&q.id, &"bob".into(), "").unwrap();

        let stats = h.shield.stats();
        assert_eq!(stats.uploads_accepted, 2);
        assert_eq!(stats.queries_submitted, 1);
        assert_eq!(stats.queries_completed, 1);
        assert_eq!(stats.active_sessions, 1);
        assert!(stats.uptime_secs < 60);
        assert_eq!(h.shield.destroy_all().unwrap(), 1);
    }
}
