//! Approval Ledger
//!
//! Append-only record of decisions. A party holds at most one approval and
//! at most one rejection per query, so a party that approved can still veto.
//! The tally is recomputed from the records on every call.

use crate::error::{CollabError, CollabResult};
use crate::types::{ApprovalRecord, ApprovalTally, ParticipantId, QueryId};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Decisions per query
#[derive(Default)]
pub struct ApprovalLedger {
    records: RwLock<BTreeMap<QueryId, Vec<ApprovalRecord>>>,
}

impl ApprovalLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decision
    ///
    /// Fails with `AlreadyApproved` if the party already recorded the same
    /// decision on the query.
    pub fn record(&self, record: ApprovalRecord) -> CollabResult<()> {
        let mut records = self.records.write().map_err(|_| lock_poisoned())?;
        let entries = records.entry(record.query_id.clone()).or_default();

        if entries.iter().any(|r| same_decision(r, &record)) {
            return Err(CollabError::AlreadyApproved {
                query_id: record.query_id.to_string(),
            });
        }

        entries.push(record);
        Ok(())
    }

    /// Decisions recorded for a query, in order
    pub fn records(&self, query_id: &QueryId) -> Vec<ApprovalRecord> {
        self.records
            .read()
            .ok()
            .and_then(|r| r.get(query_id).cloned())
            .unwrap_or_default()
    }

    /// Count distinct approvals from `required` parties
    pub fn tally(&self, query_id: &QueryId, required: &BTreeSet<ParticipantId>) -> ApprovalTally {
        let current = self
            .records(query_id)
            .iter()
            .filter(|r| r.approved && required.contains(&r.approver_id))
            .map(|r| &r.approver_id)
            .collect::<BTreeSet<_>>()
            .len();

        ApprovalTally {
            current,
            required: required.len(),
        }
    }

    /// Every record, for persistence
    pub fn export(&self) -> Vec<ApprovalRecord> {
        self.records
            .read()
            .map(|r| r.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the ledger with persisted records
    pub fn import(&self, imported: Vec<ApprovalRecord>) -> CollabResult<()> {
        let mut rebuilt: BTreeMap<QueryId, Vec<ApprovalRecord>> = BTreeMap::new();
        for record in imported {
            let entries = rebuilt.entry(record.query_id.clone()).or_default();
            if entries.iter().any(|r| same_decision(r, &record)) {
                return Err(CollabError::InvalidInput(format!(
                    "duplicate decision by {} on {}",
                    record.approver_id, record.query_id
                )));
            }
            entries.push(record);
        }

        let mut records = self.records.write().map_err(|_| lock_poisoned())?;
        *records = rebuilt;
        Ok(())
    }
}

fn same_decision(a: &ApprovalRecord, b: &ApprovalRecord) -> bool {
    a.approver_id == b.approver_id && a.approved == b.approved
}

fn lock_poisoned() -> CollabError {
    CollabError::InternalError("approval ledger lock poisoned".into())
}
