//! Query Lifecycle Controller
//!
//! Drives each query through
//! `submitted -> verifying -> approved -> executing -> completed`, with
//! `rejected` and `error` as side exits. Decisions on one query are
//! serialized by a per-query lock, so the threshold check can never let two
//! approvals trigger execution twice.

mod executor;
mod ledger;

pub use executor::{CsvSummaryExecutor, PrivacyFilter, QueryExecutor};
pub use ledger::ApprovalLedger;

use crate::config::ExecutionConfig;
use crate::crypto::{random_id, sha256_hex};
use crate::data::{DatasetVault, SessionKeyStore};
use crate::error::{CollabError, CollabResult};
use crate::notifier::{StatusEvent, StatusSink};
use crate::session::SessionDirectory;
use crate::types::{
    current_timestamp, ApprovalPolicy, ApprovalRecord, ApprovalTally, DatasetId, DecisionOutcome,
    ParticipantId, PrivacyLevel, Query, QueryId, QueryOutput, QueryResult, QueryStatus, SessionId,
};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

struct QueryEntry {
    query: Query,
    required: BTreeSet<ParticipantId>,
}

/// Persisted form of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Query and its status
    pub query: Query,
    /// Parties whose approval was required at submission
    pub required_approvers: BTreeSet<ParticipantId>,
}

/// Durable controller state: queries and the approval ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Every query
    pub queries: Vec<QueryRecord>,
    /// Every decision
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Default)]
struct QueryCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    errored: AtomicU64,
}

/// Query state machine and approval bookkeeping
pub struct QueryController {
    sessions: Arc<SessionDirectory>,
    vault: Arc<DatasetVault>,
    keys: Arc<SessionKeyStore>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn StatusSink>,
    filter: PrivacyFilter,
    ledger: ApprovalLedger,
    queries: RwLock<BTreeMap<QueryId, Arc<Mutex<QueryEntry>>>>,
    results: RwLock<BTreeMap<QueryId, QueryResult>>,
    counters: QueryCounters,
}

impl QueryController {
    /// Create a controller
    pub fn new(
        config: &ExecutionConfig,
        sessions: Arc<SessionDirectory>,
        vault: Arc<DatasetVault>,
        keys: Arc<SessionKeyStore>,
        executor: Arc<dyn QueryExecutor>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            sessions,
            vault,
            keys,
            executor,
            sink,
            filter: PrivacyFilter::new(config.k_anonymity_threshold, config.max_result_rows),
            ledger: ApprovalLedger::new(),
            queries: RwLock::new(BTreeMap::new()),
            results: RwLock::new(BTreeMap::new()),
            counters: QueryCounters::default(),
        }
    }

    /// Submit a query
    ///
    /// Every dataset must belong to the session and be `available`;
    /// otherwise nothing is created.
    pub fn submit(
        &self,
        session_id: &SessionId,
        submitter: &ParticipantId,
        dataset_ids: &[DatasetId],
        query_text: &str,
        privacy_level: PrivacyLevel,
    ) -> CollabResult<Query> {
        let session = self.sessions.require_active(session_id)?;
        if !session.is_participant(submitter) {
            return Err(CollabError::NotAuthorized {
                party: submitter.to_string(),
            });
        }
        if query_text.trim().is_empty() {
            return Err(CollabError::InvalidInput("query text is empty".into()));
        }

        let mut unique = BTreeSet::new();
        let dataset_ids: Vec<DatasetId> = dataset_ids
            .iter()
            .filter(|id| unique.insert((*id).clone()))
            .cloned()
            .collect();
        if dataset_ids.is_empty() {
            return Err(CollabError::InvalidInput("query reads no datasets".into()));
        }

        let descriptors = self.vault.require_available(session_id, &dataset_ids)?;
        let required = match session.policy {
            ApprovalPolicy::Unanimous => session.participants.clone(),
            ApprovalPolicy::OwnerOnly => descriptors.into_iter().map(|d| d.owner_id).collect(),
        };

        let query = Query {
            id: QueryId::new(format!("q-{}", random_id(16)?)),
            session_id: session_id.clone(),
            submitter: submitter.clone(),
            dataset_ids,
            query_text: query_text.to_owned(),
            query_hash: sha256_hex(query_text.as_bytes()),
            privacy_level,
            status: QueryStatus::Submitted,
            submitted_at: current_timestamp(),
            approved_at: None,
            executed_at: None,
            completed_at: None,
            execution_time_ms: None,
            error_message: None,
            rejection_reason: None,
        };

        // Re-checked under the table lock so a concurrent close_session either
        // sees this query in its scan or makes this submit fail.
        let mut queries = self.queries.write().map_err(|_| lock_poisoned())?;
        self.sessions.require_active(session_id)?;
        queries.insert(
            query.id.clone(),
            Arc::new(Mutex::new(QueryEntry {
                query: query.clone(),
                required,
            })),
        );
        drop(queries);

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            query_id = %query.id,
            session_id = %query.session_id,
            privacy = query.privacy_level.as_str(),
            "query submitted"
        );
        self.sink.publish(
            StatusEvent::query(query.id.as_str(), query.status.as_str())
                .with("session_id", &query.session_id)
                .with("query_hash", &query.query_hash),
        );

        Ok(query)
    }

    /// Record an approval
    ///
    /// The first approval moves `submitted -> verifying`; the approval that
    /// meets the threshold moves to `approved` and runs the query.
    pub fn approve(
        &self,
        query_id: &QueryId,
        approver_id: &ParticipantId,
        notes: &str,
    ) -> CollabResult<DecisionOutcome> {
        let handle = self.entry(query_id)?;
        let mut entry = handle.lock().map_err(|_| lock_poisoned())?;

        self.check_decision(&entry, approver_id, "approve query")?;
        self.ledger.record(ApprovalRecord {
            query_id: query_id.clone(),
            approver_id: approver_id.clone(),
            approved: true,
            notes: notes.to_owned(),
            timestamp: current_timestamp(),
        })?;

        if entry.query.status == QueryStatus::Submitted {
            entry.query.status = entry.query.status.transition(QueryStatus::Verifying)?;
        }

        let tally = self.ledger.tally(query_id, &entry.required);
        tracing::info!(query_id = %query_id, approver = %approver_id, tally = %tally, "approval recorded");

        if tally.is_met() {
            entry.query.status = entry.query.status.transition(QueryStatus::Approved)?;
            entry.query.approved_at = Some(current_timestamp());
            self.execute(&mut entry);
        } else {
            self.sink.publish(
                StatusEvent::query(query_id.as_str(), entry.query.status.as_str())
                    .with("current_approvals", tally.current)
                    .with("required_approvals", tally.required),
            );
        }

        Ok(DecisionOutcome {
            query: entry.query.clone(),
            tally,
        })
    }

    /// Reject a query; final
    pub fn reject(
        &self,
        query_id: &QueryId,
        rejector_id: &ParticipantId,
        reason: &str,
    ) -> CollabResult<DecisionOutcome> {
        let handle = self.entry(query_id)?;
        let mut entry = handle.lock().map_err(|_| lock_poisoned())?;

        self.check_decision(&entry, rejector_id, "reject query")?;
        self.ledger.record(ApprovalRecord {
            query_id: query_id.clone(),
            approver_id: rejector_id.clone(),
            approved: false,
            notes: reason.to_owned(),
            timestamp: current_timestamp(),
        })?;

        entry.query.status = entry.query.status.transition(QueryStatus::Rejected)?;
        entry.query.rejection_reason = Some(reason.to_owned());
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);

        let tally = self.ledger.tally(query_id, &entry.required);
        tracing::info!(query_id = %query_id, rejector = %rejector_id, "query rejected");
        self.sink.publish(
            StatusEvent::query(query_id.as_str(), QueryStatus::Rejected.as_str())
                .with("rejected_by", rejector_id),
        );

        Ok(DecisionOutcome {
            query: entry.query.clone(),
            tally,
        })
    }

    /// State check first, then session, then authorization; the ledger
    /// reports duplicates
    fn check_decision(
        &self,
        entry: &QueryEntry,
        party: &ParticipantId,
        operation: &str,
    ) -> CollabResult<()> {
        if !entry.query.status.accepts_decisions() {
            return Err(CollabError::InvalidState {
                current: entry.query.status.as_str().into(),
                operation: operation.into(),
            });
        }
        self.sessions.require_active(&entry.query.session_id)?;
        if !entry.required.contains(party) {
            tracing::warn!(query_id = %entry.query.id, party = %party, "decision from unauthorized party");
            return Err(CollabError::NotAuthorized {
                party: party.to_string(),
            });
        }
        Ok(())
    }

    /// Run an approved query to `completed` or `error`
    fn execute(&self, entry: &mut QueryEntry) {
        let query_id = entry.query.id.clone();
        entry.query.status = match entry.query.status.transition(QueryStatus::Executing) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(query_id = %query_id, error = %e, "cannot start execution");
                return;
            }
        };
        entry.query.executed_at = Some(current_timestamp());

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(&entry.query)))
            .unwrap_or_else(|_| Err(CollabError::ExecutionFailed("executor panicked".into())))
            .and_then(|output| self.store_result(&query_id, output));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        entry.query.execution_time_ms = Some(elapsed_ms);
        entry.query.completed_at = Some(current_timestamp());

        match outcome {
            Ok(row_count) => {
                entry.query.status = QueryStatus::Completed;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(query_id = %query_id, rows = row_count, elapsed_ms, "query completed");
                self.sink.publish(
                    StatusEvent::query(query_id.as_str(), QueryStatus::Completed.as_str())
                        .with("execution_time_ms", elapsed_ms)
                        .with("row_count", row_count),
                );
            }
            Err(e) => {
                entry.query.status = QueryStatus::Error;
                entry.query.error_message = Some(e.to_string());
                self.counters.errored.fetch_add(1, Ordering::Relaxed);
                if e.is_critical() {
                    tracing::error!(query_id = %query_id, code = e.error_code(), error = %e, "query execution failed");
                } else {
                    tracing::warn!(query_id = %query_id, code = e.error_code(), "query execution failed");
                }
                self.sink.publish(
                    StatusEvent::query(query_id.as_str(), QueryStatus::Error.as_str())
                        .with("error_code", e.error_code()),
                );
            }
        }
    }

    fn run(&self, query: &Query) -> CollabResult<QueryOutput> {
        let datasets = self
            .vault
            .open_for_execution(&query.session_id, &query.dataset_ids, &self.keys)?;
        let output = self
            .executor
            .execute(&query.query_text, &datasets, query.privacy_level)?;
        drop(datasets);

        self.filter.apply(output, query.privacy_level)
    }

    fn store_result(&self, query_id: &QueryId, output: QueryOutput) -> CollabResult<usize> {
        let checksum = sha256_hex(&serde_json::to_vec(&output)?);
        let row_count = output.rows.len();
        let result = QueryResult {
            query_id: query_id.clone(),
            output,
            row_count,
            checksum,
            created_at: current_timestamp(),
        };

        let mut results = self.results.write().map_err(|_| lock_poisoned())?;
        results.insert(query_id.clone(), result);
        Ok(row_count)
    }

    fn entry(&self, query_id: &QueryId) -> CollabResult<Arc<Mutex<QueryEntry>>> {
        let queries = self.queries.read().map_err(|_| lock_poisoned())?;
        queries
            .get(query_id)
            .cloned()
            .ok_or_else(|| CollabError::QueryNotFound(query_id.to_string()))
    }

    /// Current state of a query
    pub fn query(&self, query_id: &QueryId) -> CollabResult<Query> {
        let handle = self.entry(query_id)?;
        let entry = handle.lock().map_err(|_| lock_poisoned())?;
        Ok(entry.query.clone())
    }

    /// Current approval tally
    pub fn tally(&self, query_id: &QueryId) -> CollabResult<ApprovalTally> {
        let handle = self.entry(query_id)?;
        let entry = handle.lock().map_err(|_| lock_poisoned())?;
        Ok(self.ledger.tally(query_id, &entry.required))
    }

    /// Decisions recorded on a query
    pub fn approvals(&self, query_id: &QueryId) -> Vec<ApprovalRecord> {
        self.ledger.records(query_id)
    }

    /// Result of a completed query, for session participants only
    pub fn result(&self, query_id: &QueryId, requester: &ParticipantId) -> CollabResult<QueryResult> {
        let query = self.query(query_id)?;
        if !self.sessions.is_participant(&query.session_id, requester) {
            return Err(CollabError::NotAuthorized {
                party: requester.to_string(),
            });
        }
        if query.status != QueryStatus::Completed {
            return Err(CollabError::InvalidState {
                current: query.status.as_str().into(),
                operation: "read result".into(),
            });
        }

        let results = self.results.read().map_err(|_| lock_poisoned())?;
        results
            .get(query_id)
            .cloned()
            .ok_or_else(|| CollabError::InternalError(format!("result for {} missing", query_id)))
    }

    /// Session closed: reject open queries and drop stored results
    pub fn close_session(&self, session_id: &SessionId) -> CollabResult<usize> {
        let handles: Vec<_> = {
            let queries = self.queries.read().map_err(|_| lock_poisoned())?;
            queries.values().cloned().collect()
        };

        let mut closed = 0;
        let mut session_queries = Vec::new();
        for handle in handles {
            let mut entry = handle.lock().map_err(|_| lock_poisoned())?;
            if &entry.query.session_id != session_id {
                continue;
            }
            session_queries.push(entry.query.id.clone());

            if entry.query.status.accepts_decisions() {
                entry.query.status = entry.query.status.transition(QueryStatus::Rejected)?;
                entry.query.rejection_reason = Some("session closed".into());
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.sink.publish(
                    StatusEvent::query(entry.query.id.as_str(), QueryStatus::Rejected.as_str())
                        .with("reason", "session closed"),
                );
                closed += 1;
            }
        }

        let mut results = self.results.write().map_err(|_| lock_poisoned())?;
        for id in &session_queries {
            results.remove(id);
        }

        Ok(closed)
    }

    /// Export queries and decisions for durable storage
    pub fn snapshot(&self) -> CollabResult<LedgerSnapshot> {
        let handles: Vec<_> = {
            let queries = self.queries.read().map_err(|_| lock_poisoned())?;
            queries.values().cloned().collect()
        };

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            let entry = handle.lock().map_err(|_| lock_poisoned())?;
            records.push(QueryRecord {
                query: entry.query.clone(),
                required_approvers: entry.required.clone(),
            });
        }

        Ok(LedgerSnapshot {
            queries: records,
            approvals: self.ledger.export(),
        })
    }

    /// Replace controller state with a snapshot
    ///
    /// Queries caught mid-execution cannot resume: results never survive a
    /// restart, so they are moved to `error`.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> CollabResult<()> {
        let mut rebuilt = BTreeMap::new();
        for record in snapshot.queries {
            let mut query = record.query;
            if matches!(query.status, QueryStatus::Approved | QueryStatus::Executing) {
                if query.status == QueryStatus::Approved {
                    query.status = query.status.transition(QueryStatus::Executing)?;
                }
                query.status = query.status.transition(QueryStatus::Error)?;
                query.error_message = Some("interrupted by enclave restart".into());
            }
            rebuilt.insert(
                query.id.clone(),
                Arc::new(Mutex::new(QueryEntry {
                    query,
                    required: record.required_approvers,
                })),
            );
        }

        self.ledger.import(snapshot.approvals)?;
        *self.queries.write().map_err(|_| lock_poisoned())? = rebuilt;
        self.results.write().map_err(|_| lock_poisoned())?.clear();
        Ok(())
    }

    /// (submitted, completed, rejected, errored)
    pub(crate) fn counts(&self) -> (u64, u64, u64, u64) {
        (
            self.counters.submitted.load(Ordering::Relaxed),
            self.counters.completed.load(Ordering::Relaxed),
            self.counters.rejected.load(Ordering::Relaxed),
            self.counters.errored.load(Ordering::Relaxed),
        )
    }
}

fn lock_poisoned() -> CollabError {
    CollabError::InternalError("query controller lock poisoned".into())
}
