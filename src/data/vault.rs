//! Dataset registry and at-rest store
//!
//! Tracks each dataset's lifecycle and holds its ciphertext sealed under the
//! owning session's key. Plaintext only exists transiently, inside
//! [`DecryptedDataset`] values handed to the executor.

use super::session_keys::{SealedBlob, SessionKeyStore};
use crate::error::{CollabError, CollabResult};
use crate::types::{
    current_timestamp, DatasetDescriptor, DatasetId, DatasetStatus, ParticipantId, SessionId,
};

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use zeroize::Zeroizing;

struct DatasetEntry {
    descriptor: DatasetDescriptor,
    status: DatasetStatus,
    sealed: Option<SealedBlob>,
    checksum: Option<String>,
    size_bytes: Option<usize>,
    registered_at: u64,
    updated_at: u64,
}

impl DatasetEntry {
    fn record(&self) -> DatasetRecord {
        DatasetRecord {
            descriptor: self.descriptor.clone(),
            status: self.status,
            checksum: self.checksum.clone(),
            size_bytes: self.size_bytes,
            registered_at: self.registered_at,
            updated_at: self.updated_at,
        }
    }
}

/// Metadata view of a dataset; never carries data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Registration
    pub descriptor: DatasetDescriptor,
    /// Lifecycle state
    pub status: DatasetStatus,
    /// Hex SHA-256 of the plaintext, once available
    pub checksum: Option<String>,
    /// Plaintext size, once available
    pub size_bytes: Option<usize>,
    /// Registration time
    pub registered_at: u64,
    /// Last state change
    pub updated_at: u64,
}

/// Plaintext of one dataset, zeroed on drop
pub struct DecryptedDataset {
    id: DatasetId,
    owner: ParticipantId,
    bytes: Zeroizing<Vec<u8>>,
}

impl DecryptedDataset {
    /// Build a dataset from owned plaintext
    pub fn new(id: DatasetId, owner: ParticipantId, bytes: Vec<u8>) -> Self {
        Self {
            id,
            owner,
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Dataset identifier
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    /// Owning participant
    pub fn owner(&self) -> &ParticipantId {
        &self.owner
    }

    /// Plaintext bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Plaintext as UTF-8
    pub fn as_text(&self) -> CollabResult<&str> {
        core::str::from_utf8(&self.bytes)
            .map_err(|_| CollabError::ExecutionFailed(format!("dataset {} is not UTF-8", self.id)))
    }
}

impl fmt::Debug for DecryptedDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedDataset")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Associated data binding a stored dataset to its session
pub fn session_aad(session_id: &SessionId, dataset_id: &DatasetId) -> Vec<u8> {
    format!("collab-shield/v1/session/{}/dataset/{}", session_id, dataset_id).into_bytes()
}

/// Dataset registry plus sealed storage
#[derive(Default)]
pub struct DatasetVault {
    entries: RwLock<BTreeMap<DatasetId, DatasetEntry>>,
}

impl DatasetVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset in `pending`
    pub fn register(&self, descriptor: DatasetDescriptor) -> CollabResult<DatasetRecord> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;

        if let Some(existing) = entries.get(&descriptor.id) {
            return Err(CollabError::InvalidState {
                current: existing.status.as_str().into(),
                operation: "register dataset".into(),
            });
        }

        let now = current_timestamp();
        let entry = DatasetEntry {
            descriptor: descriptor.clone(),
            status: DatasetStatus::Pending,
            sealed: None,
            checksum: None,
            size_bytes: None,
            registered_at: now,
            updated_at: now,
        };
        let record = entry.record();
        entries.insert(descriptor.id, entry);

        Ok(record)
    }

    /// Look up a dataset's metadata
    pub fn get(&self, dataset_id: &DatasetId) -> Option<DatasetRecord> {
        self.entries.read().ok()?.get(dataset_id).map(DatasetEntry::record)
    }

    /// Claim a pending dataset for upload
    ///
    /// Only one caller can win; every later claim sees `DuplicateUpload`.
    pub fn claim(&self, dataset_id: &DatasetId) -> CollabResult<DatasetDescriptor> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        let entry = entries
            .get_mut(dataset_id)
            .ok_or_else(|| CollabError::DatasetNotFound(dataset_id.to_string()))?;

        if entry.status != DatasetStatus::Pending {
            return Err(CollabError::DuplicateUpload {
                dataset_id: dataset_id.to_string(),
            });
        }

        entry.status = entry.status.transition(DatasetStatus::Uploading)?;
        entry.updated_at = current_timestamp();
        Ok(entry.descriptor.clone())
    }

    /// Store the sealed dataset and mark it `available`
    pub fn complete(
        &self,
        dataset_id: &DatasetId,
        sealed: SealedBlob,
        checksum: String,
        size_bytes: usize,
    ) -> CollabResult<DatasetRecord> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        let entry = entries
            .get_mut(dataset_id)
            .ok_or_else(|| CollabError::DatasetNotFound(dataset_id.to_string()))?;

        entry.status = entry.status.transition(DatasetStatus::Available)?;
        entry.sealed = Some(sealed);
        entry.checksum = Some(checksum);
        entry.size_bytes = Some(size_bytes);
        entry.updated_at = current_timestamp();
        Ok(entry.record())
    }

    /// Mark an uploading dataset `failed`
    pub fn fail(&self, dataset_id: &DatasetId) -> CollabResult<()> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        let entry = entries
            .get_mut(dataset_id)
            .ok_or_else(|| CollabError::DatasetNotFound(dataset_id.to_string()))?;

        entry.status = entry.status.transition(DatasetStatus::Failed)?;
        entry.updated_at = current_timestamp();
        Ok(())
    }

    /// Resolve datasets for a query: each must exist, belong to the session,
    /// and be `available`
    pub fn require_available(
        &self,
        session_id: &SessionId,
        dataset_ids: &[DatasetId],
    ) -> CollabResult<Vec<DatasetDescriptor>> {
        let entries = self.entries.read().map_err(|_| lock_poisoned())?;

        dataset_ids
            .iter()
            .map(|id| {
                let entry = entries
                    .get(id)
                    .filter(|e| &e.descriptor.session_id == session_id)
                    .ok_or_else(|| CollabError::DatasetNotFound(id.to_string()))?;
                if entry.status != DatasetStatus::Available {
                    return Err(CollabError::DatasetUnavailable(id.to_string()));
                }
                Ok(entry.descriptor.clone())
            })
            .collect()
    }

    /// Decrypt datasets for execution
    pub fn open_for_execution(
        &self,
        session_id: &SessionId,
        dataset_ids: &[DatasetId],
        keys: &SessionKeyStore,
    ) -> CollabResult<Vec<DecryptedDataset>> {
        let entries = self.entries.read().map_err(|_| lock_poisoned())?;
        let mut opened = Vec::with_capacity(dataset_ids.len());

        for id in dataset_ids {
            let entry = entries
                .get(id)
                .filter(|e| &e.descriptor.session_id == session_id)
                .ok_or_else(|| CollabError::DatasetNotFound(id.to_string()))?;
            let sealed = entry
                .sealed
                .as_ref()
                .ok_or_else(|| CollabError::DatasetUnavailable(id.to_string()))?;

            let plaintext = keys.open(session_id, sealed, &session_aad(session_id, id))?;
            opened.push(DecryptedDataset {
                id: id.clone(),
                owner: entry.descriptor.owner_id.clone(),
                bytes: plaintext,
            });
        }

        Ok(opened)
    }

    /// Remove every dataset of a session; returns how many were removed
    pub fn purge_session(&self, session_id: &SessionId) -> CollabResult<usize> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        let before = entries.len();
        entries.retain(|_, e| &e.descriptor.session_id != session_id);
        Ok(before - entries.len())
    }
}

fn lock_poisoned() -> CollabError {
    CollabError::InternalError("dataset vault lock poisoned".into())
}
