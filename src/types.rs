//! Core types for Collab Shield
//!
//! Identifiers, collaboration sessions, dataset and query lifecycles, and
//! approval records. Lifecycles are closed enums with explicit transition
//! functions; an illegal transition is an `InvalidState` error.

use crate::error::{CollabError, CollabResult};

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow as `&str`
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Collaboration session identifier (issued by the control plane)
    SessionId
);
string_id!(
    /// Dataset identifier (issued by the control plane)
    DatasetId
);
string_id!(
    /// Participant identity (user or organization)
    ParticipantId
);
string_id!(
    /// Query identifier (issued by this core on submission)
    QueryId
);

/// Who must approve a query before it may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Every session participant must approve
    Unanimous,
    /// Every owner of a dataset the query reads must approve
    OwnerOnly,
}

/// Collaboration session as consumed by the core
///
/// The full record lives in the control plane; only the id, participant
/// set, and policy cross into the enclave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaborationSession {
    /// Session identifier
    pub id: SessionId,
    /// Authorized participants
    pub participants: BTreeSet<ParticipantId>,
    /// Approval policy
    pub policy: ApprovalPolicy,
}

impl CollaborationSession {
    /// Create a session description
    pub fn new<I, P>(id: impl Into<SessionId>, participants: I, policy: ApprovalPolicy) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ParticipantId>,
    {
        Self {
            id: id.into(),
            participants: participants.into_iter().map(Into::into).collect(),
            policy,
        }
    }

    /// Check whether a party participates in this session
    pub fn is_participant(&self, party: &ParticipantId) -> bool {
        self.participants.contains(party)
    }
}

/// Session lifecycle inside the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting uploads and queries
    Active,
    /// Closed; key destroyed, datasets purged
    Closed,
}

/// Dataset lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    /// Registered, waiting for the client upload
    Pending,
    /// An upload has claimed the dataset and is being processed
    Uploading,
    /// Re-encrypted under the session key, ready for queries
    Available,
    /// Upload failed; the dataset id cannot be reused
    Failed,
}

impl DatasetStatus {
    /// Name used in logs, errors, and notifications
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Available => "available",
            Self::Failed => "failed",
        }
    }

    /// Move to `next`, or fail if the lifecycle does not allow it
    pub fn transition(self, next: DatasetStatus) -> CollabResult<DatasetStatus> {
        let allowed = matches!(
            (self, next),
            (Self::Pending, Self::Uploading)
                | (Self::Uploading, Self::Available)
                | (Self::Uploading, Self::Failed)
        );

        if allowed {
            Ok(next)
        } else {
            Err(CollabError::InvalidState {
                current: self.as_str().into(),
                operation: format!("move dataset to {}", next.as_str()),
            })
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration of a dataset by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset identifier
    pub id: DatasetId,
    /// Session the dataset belongs to
    pub session_id: SessionId,
    /// Participant that owns (and uploads) the dataset
    pub owner_id: ParticipantId,
}

/// Privacy treatment applied to results before they leave execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    /// Only aggregate output may leave
    AggregateOnly,
    /// Aggregate output with small groups suppressed
    KAnonymized,
    /// Aggregate output; noise injection is not performed by this core
    DifferentialPrivacy,
    /// Row-level output allowed
    FullAccess,
}

impl PrivacyLevel {
    /// Name used in logs and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AggregateOnly => "aggregate_only",
            Self::KAnonymized => "k_anonymized",
            Self::DifferentialPrivacy => "differential_privacy",
            Self::FullAccess => "full_access",
        }
    }

    /// Parse from the wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aggregate_only" => Some(Self::AggregateOnly),
            "k_anonymized" => Some(Self::KAnonymized),
            "differential_privacy" => Some(Self::DifferentialPrivacy),
            "full_access" => Some(Self::FullAccess),
            _ => None,
        }
    }
}

impl Default for PrivacyLevel {
    fn default() -> Self {
        Self::AggregateOnly
    }
}

/// Query lifecycle
///
/// ```text
/// submitted -> verifying -> approved -> executing -> completed
///                  |                        |
///                  +-> rejected             +-> error
/// ```
/// `submitted` may also move straight to `rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Created, no decisions yet
    Submitted,
    /// At least one approval recorded, threshold not yet met
    Verifying,
    /// Threshold met
    Approved,
    /// Running inside the execution context
    Executing,
    /// Finished; result stored
    Completed,
    /// Rejected by an authorized party
    Rejected,
    /// Execution failed; message retained
    Error,
}

impl QueryStatus {
    /// Name used in logs, errors, and notifications
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Verifying => "verifying",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Error)
    }

    /// Whether approval/rejection decisions are accepted
    pub fn accepts_decisions(&self) -> bool {
        matches!(self, Self::Submitted | Self::Verifying)
    }

    /// Move to `next`, or fail if the lifecycle does not allow it
    pub fn transition(self, next: QueryStatus) -> CollabResult<QueryStatus> {
        let allowed = matches!(
            (self, next),
            (Self::Submitted, Self::Verifying)
                | (Self::Submitted, Self::Rejected)
                | (Self::Verifying, Self::Approved)
                | (Self::Verifying, Self::Rejected)
                | (Self::Approved, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Error)
        );

        if allowed {
            Ok(next)
        } else {
            Err(CollabError::InvalidState {
                current: self.as_str().into(),
                operation: format!("move query to {}", next.as_str()),
            })
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A query submitted to a collaboration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Query identifier
    pub id: QueryId,
    /// Session the query runs in
    pub session_id: SessionId,
    /// Submitting participant
    pub submitter: ParticipantId,
    /// Datasets the query reads
    pub dataset_ids: Vec<DatasetId>,
    /// Query text handed to the executor
    pub query_text: String,
    /// SHA-256 of the query text (hex)
    pub query_hash: String,
    /// Declared privacy level
    pub privacy_level: PrivacyLevel,
    /// Current lifecycle state
    pub status: QueryStatus,
    /// Submission time (Unix seconds)
    pub submitted_at: u64,
    /// Time the threshold was met
    pub approved_at: Option<u64>,
    /// Time execution started
    pub executed_at: Option<u64>,
    /// Time execution finished
    pub completed_at: Option<u64>,
    /// Execution duration in milliseconds
    pub execution_time_ms: Option<u64>,
    /// Error message for the `error` state
    pub error_message: Option<String>,
    /// Reason given by the rejecting party
    pub rejection_reason: Option<String>,
}

/// One party's decision on one query; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Query decided on
    pub query_id: QueryId,
    /// Deciding party
    pub approver_id: ParticipantId,
    /// `true` for approval, `false` for rejection
    pub approved: bool,
    /// Free-form notes or rejection reason
    pub notes: String,
    /// Decision time (Unix seconds)
    pub timestamp: u64,
}

/// Approvals counted against the policy threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTally {
    /// Distinct required parties that approved
    pub current: usize,
    /// Parties whose approval is required
    pub required: usize,
}

impl ApprovalTally {
    /// Threshold met
    pub fn is_met(&self) -> bool {
        self.required > 0 && self.current >= self.required
    }

    /// Approvals still outstanding
    pub fn awaiting(&self) -> usize {
        self.required.saturating_sub(self.current)
    }
}

impl fmt::Display for ApprovalTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.required)
    }
}

/// Returned by approval and rejection calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    /// Query after the decision was applied
    pub query: Query,
    /// Tally after the decision was applied
    pub tally: ApprovalTally,
}

/// Output of an execution, before and after privacy treatment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Vec<String>>,
    /// Whether each row aggregates a group of records
    pub aggregate: bool,
    /// Records contributing to each row; parallel to `rows` when `aggregate`
    pub group_sizes: Vec<u64>,
}

impl QueryOutput {
    /// Aggregate output with one group size per row
    pub fn aggregate(columns: Vec<String>, rows: Vec<Vec<String>>, group_sizes: Vec<u64>) -> Self {
        Self {
            columns,
            rows,
            aggregate: true,
            group_sizes,
        }
    }

    /// Row-level output
    pub fn rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            columns,
            rows,
            aggregate: false,
            group_sizes: Vec::new(),
        }
    }
}

/// Stored result of a completed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Query that produced the result
    pub query_id: QueryId,
    /// Privacy-treated output
    pub output: QueryOutput,
    /// Number of rows in the output
    pub row_count: usize,
    /// SHA-256 over the serialized output (hex)
    pub checksum: String,
    /// Creation time (Unix seconds)
    pub created_at: u64,
}

/// Counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabStats {
    /// Uploads stored under a session key
    pub uploads_accepted: u64,
    /// Uploads refused or failed
    pub uploads_rejected: u64,
    /// Queries submitted
    pub queries_submitted: u64,
    /// Queries completed
    pub queries_completed: u64,
    /// Queries rejected
    pub queries_rejected: u64,
    /// Queries that ended in `error`
    pub queries_errored: u64,
    /// Session keys currently held
    pub active_session_keys: usize,
    /// Sessions currently open
    pub active_sessions: usize,
    /// Seconds since the shield started
    pub uptime_secs: u64,
    /// Status events delivered to the control plane
    pub notifications_delivered: u64,
    /// Status events dropped after exhausting retries or a full queue
    pub notifications_dropped: u64,
}

/// Current Unix timestamp in seconds
pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
