//! Collaboration session directory
//!
//! The control plane owns the full session record; the core keeps only the
//! id, participant set, policy, and whether the session is still open.

use crate::error::{CollabError, CollabResult};
use crate::types::{current_timestamp, CollaborationSession, ParticipantId, SessionId, SessionStatus};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Session as tracked by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Participants and policy
    pub session: CollaborationSession,
    /// Open or closed
    pub status: SessionStatus,
    /// Open time (Unix seconds)
    pub opened_at: u64,
    /// Close time (Unix seconds)
    pub closed_at: Option<u64>,
}

/// Sessions known to this enclave
#[derive(Default)]
pub struct SessionDirectory {
    sessions: RwLock<BTreeMap<SessionId, SessionRecord>>,
}

impl SessionDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session
    pub fn open(&self, session: CollaborationSession) -> CollabResult<SessionRecord> {
        if session.participants.is_empty() {
            return Err(CollabError::InvalidInput(
                "session needs at least one participant".into(),
            ));
        }

        let mut sessions = self.sessions.write().map_err(|_| lock_poisoned())?;
        if let Some(existing) = sessions.get(&session.id) {
            return Err(CollabError::InvalidState {
                current: status_name(existing.status).into(),
                operation: "open session".into(),
            });
        }

        let record = SessionRecord {
            session: session.clone(),
            status: SessionStatus::Active,
            opened_at: current_timestamp(),
            closed_at: None,
        };
        sessions.insert(session.id, record.clone());
        Ok(record)
    }

    /// Mark a session closed
    pub fn close(&self, session_id: &SessionId) -> CollabResult<SessionRecord> {
        let mut sessions = self.sessions.write().map_err(|_| lock_poisoned())?;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;

        if record.status == SessionStatus::Closed {
            return Err(CollabError::SessionClosed(session_id.to_string()));
        }

        record.status = SessionStatus::Closed;
        record.closed_at = Some(current_timestamp());
        Ok(record.clone())
    }

    /// Look up a session
    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.read().ok()?.get(session_id).cloned()
    }

    /// Session details, if it exists and is active
    pub fn require_active(&self, session_id: &SessionId) -> CollabResult<CollaborationSession> {
        let sessions = self.sessions.read().map_err(|_| lock_poisoned())?;
        let record = sessions
            .get(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))?;

        match record.status {
            SessionStatus::Active => Ok(record.session.clone()),
            SessionStatus::Closed => Err(CollabError::SessionClosed(session_id.to_string())),
        }
    }

    /// Whether `party` participates in the session (open or closed)
    pub fn is_participant(&self, session_id: &SessionId, party: &ParticipantId) -> bool {
        self.get(session_id)
            .map(|record| record.session.is_participant(party))
            .unwrap_or(false)
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .map(|s| s.values().filter(|r| r.status == SessionStatus::Active).count())
            .unwrap_or(0)
    }
}

fn status_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Closed => "closed",
    }
}

fn lock_poisoned() -> CollabError {
    CollabError::InternalError("session directory lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalPolicy;

    fn session(id: &str) -> CollaborationSession {
        CollaborationSession::new(id, ["alice", "bob"], ApprovalPolicy::Unanimous)
    }

    #[test]
    fn test_open_and_close() {
        let directory = SessionDirectory::new();
        directory.open(session("s1")).unwrap();
        assert_eq!(directory.active_count(), 1);
        assert!(directory.require_active(&"s1".into()).is_ok());
        assert!(directory.is_participant(&"s1".into(), &"bob".into()));

        let closed = directory.close(&"s1".into()).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(
            directory.require_active(&"s1".into()).unwrap_err(),
            CollabError::SessionClosed("s1".into())
        );
        assert!(directory.close(&"s1".into()).is_err());
    }

    #[test]
    fn test_duplicate_and_empty_sessions() {
        let directory = SessionDirectory::new();
        directory.open(session("s1")).unwrap();
        assert!(directory.open(session("s1")).is_err());

        let empty = CollaborationSession::new("s2", Vec::<&str>::new(), ApprovalPolicy::OwnerOnly);
        assert!(directory.open(empty).is_err());
    }

    #[test]
    fn test_unknown_session() {
        let directory = SessionDirectory::new();
        assert_eq!(
            directory.require_active(&"nope".into()).unwrap_err().error_code(),
            "session_not_found"
        );
        assert!(!directory.is_participant(&"nope".into(), &"alice".into()));
    }
}
