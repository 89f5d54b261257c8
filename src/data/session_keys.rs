//! Session Key Store
//!
//! One symmetric key per collaboration session, generated lazily on the first
//! upload and held only in memory. Destroying a key zeroes it; anything
//! sealed under it becomes unreadable. A retired session never gets a key
//! again.

use crate::crypto::{aes256_gcm_decrypt, aes256_gcm_encrypt, random_key, random_nonce, KEY_LEN, NONCE_LEN};
use crate::error::{CollabError, CollabResult};
use crate::types::{current_timestamp, SessionId};

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey {
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    created_at: u64,
}

/// Data sealed under a session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    /// Fresh nonce per seal
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with tag appended
    pub ciphertext: Vec<u8>,
    /// Seal time (Unix seconds)
    pub sealed_at: u64,
}

#[derive(Default)]
struct KeyTable {
    keys: HashMap<SessionId, SessionKey>,
    retired: HashSet<SessionId>,
}

/// In-memory store of per-session keys
#[derive(Default)]
pub struct SessionKeyStore {
    table: RwLock<KeyTable>,
}

impl SessionKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session's key, creating it if absent
    ///
    /// Creation happens under the write lock, so concurrent callers for the
    /// same session observe exactly one key. Fails with `SessionClosed` once
    /// the session is retired.
    pub(crate) fn get_or_create(&self, session_id: &SessionId) -> CollabResult<Zeroizing<[u8; KEY_LEN]>> {
        {
            let table = self.table.read().map_err(|_| lock_poisoned())?;
            if let Some(existing) = table.keys.get(session_id) {
                return Ok(Zeroizing::new(existing.key));
            }
        }

        let mut table = self.table.write().map_err(|_| lock_poisoned())?;
        if table.retired.contains(session_id) {
            return Err(CollabError::SessionClosed(session_id.to_string()));
        }
        if let Some(existing) = table.keys.get(session_id) {
            return Ok(Zeroizing::new(existing.key));
        }

        let key = SessionKey {
            key: random_key()?,
            created_at: current_timestamp(),
        };
        let copy = Zeroizing::new(key.key);
        table.keys.insert(session_id.clone(), key);

        tracing::info!(session_id = %session_id, "session key created");
        Ok(copy)
    }

    fn get(&self, session_id: &SessionId) -> CollabResult<Zeroizing<[u8; KEY_LEN]>> {
        let table = self.table.read().map_err(|_| lock_poisoned())?;
        table
            .keys
            .get(session_id)
            .map(|k| Zeroizing::new(k.key))
            .ok_or_else(|| CollabError::SessionNotFound(session_id.to_string()))
    }

    /// Seal `plaintext` under the session's key, creating the key if needed
    pub fn seal(&self, session_id: &SessionId, plaintext: &[u8], aad: &[u8]) -> CollabResult<SealedBlob> {
        let key = self.get_or_create(session_id)?;
        let nonce = random_nonce()?;
        let ciphertext = aes256_gcm_encrypt(&key, &nonce, plaintext, aad)?;

        Ok(SealedBlob {
            nonce,
            ciphertext,
            sealed_at: current_timestamp(),
        })
    }

    /// Open a blob sealed under the session's key
    ///
    /// Fails if the key was destroyed or belongs to another session.
    pub fn open(
        &self,
        session_id: &SessionId,
        blob: &SealedBlob,
        aad: &[u8],
    ) -> CollabResult<Zeroizing<Vec<u8>>> {
        let key = self.get(session_id)?;
        aes256_gcm_decrypt(&key, &blob.nonce, &blob.ciphertext, aad).map(Zeroizing::new)
    }

    /// Overwrite and remove the session's key
    ///
    /// Returns whether a key was present. A later upload creates a fresh key;
    /// use [`retire`](Self::retire) when the session is over.
    pub fn destroy(&self, session_id: &SessionId) -> CollabResult<bool> {
        let mut table = self.table.write().map_err(|_| lock_poisoned())?;
        Ok(remove_key(&mut table, session_id))
    }

    /// Destroy the session's key and refuse to create another one
    ///
    /// Returns whether a key was present.
    pub fn retire(&self, session_id: &SessionId) -> CollabResult<bool> {
        let mut table = self.table.write().map_err(|_| lock_poisoned())?;
        table.retired.insert(session_id.clone());
        Ok(remove_key(&mut table, session_id))
    }

    /// Whether the session was retired
    pub fn is_retired(&self, session_id: &SessionId) -> bool {
        self.table
            .read()
            .map(|table| table.retired.contains(session_id))
            .unwrap_or(true)
    }

    /// Destroy every key (enclave shutdown)
    pub fn destroy_all(&self) -> CollabResult<usize> {
        let mut table = self.table.write().map_err(|_| lock_poisoned())?;
        let count = table.keys.len();
        table.keys.clear();
        tracing::info!(count, "all session keys destroyed");
        Ok(count)
    }

    /// Whether the session currently has a key
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.table
            .read()
            .map(|table| table.keys.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Number of keys held
    pub fn active_sessions(&self) -> usize {
        self.table.read().map(|table| table.keys.len()).unwrap_or(0)
    }
}

// SessionKey zeroizes on drop
fn remove_key(table: &mut KeyTable, session_id: &SessionId) -> bool {
    match table.keys.remove(session_id) {
        Some(key) => {
            tracing::info!(
                session_id = %session_id,
                age_secs = current_timestamp().saturating_sub(key.created_at),
                "session key destroyed"
            );
            true
        }
        None => false,
    }
}

fn lock_poisoned() -> CollabError {
    CollabError::InternalError("session key store lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_same_session_shares_key() {
        let store = SessionKeyStore::new();
        let session = SessionId::new("s1");

        let first = store.seal(&session, b"dataset one", b"aad-1").unwrap();
        let second = store.seal(&session, b"dataset two", b"aad-2").unwrap();
        assert_eq!(store.active_sessions(), 1);

        assert_eq!(store.open(&session, &first, b"aad-1").unwrap().as_slice(), b"dataset one");
        assert_eq!(store.open(&session, &second, b"aad-2").unwrap().as_slice(), b"dataset two");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let store = SessionKeyStore::new();
        let s1 = SessionId::new("s1");
        let s2 = SessionId::new("s2");

        let blob = store.seal(&s1, b"secret rows", b"aad").unwrap();
        store.get_or_create(&s2).unwrap();

        assert_ne!(*store.get_or_create(&s1).unwrap(), *store.get_or_create(&s2).unwrap());
        assert_eq!(store.open(&s2, &blob, b"aad").unwrap_err(), CollabError::DecryptionFailed);
    }

    #[test]
    fn test_destroy_makes_data_unreadable() {
        let store = SessionKeyStore::new();
        let session = SessionId::new("s1");
        let blob = store.seal(&session, b"rows", b"aad").unwrap();

        assert!(store.destroy(&session).unwrap());
        assert!(!store.contains(&session));
        assert!(!store.destroy(&session).unwrap());
        assert!(store.open(&session, &blob, b"aad").is_err());

        // A new key is not the old one
        store.get_or_create(&session).unwrap();
        assert!(store.open(&session, &blob, b"aad").is_err());
    }

    #[test]
    fn test_concurrent_get_or_create_yields_one_key() {
        let store = Arc::new(SessionKeyStore::new());
        let session = SessionId::new("contended");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let session = session.clone();
                thread::spawn(move || *store.get_or_create(&session).unwrap())
            })
            .collect();

        let keys: Vec<[u8; KEY_LEN]> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.active_sessions(), 1);
    }

    #[test]
    fn test_retired_session_gets_no_new_key() {
        let store = SessionKeyStore::new();
        let session = SessionId::new("s1");
        let blob = store.seal(&session, b"rows", b"aad").unwrap();

        assert!(store.retire(&session).unwrap());
        assert!(store.is_retired(&session));
        assert!(!store.contains(&session));
        assert!(store.open(&session, &blob, b"aad").is_err());

        assert_eq!(
            store.seal(&session, b"late upload", b"aad").unwrap_err(),
            CollabError::SessionClosed("s1".into())
        );
        assert!(!store.contains(&session));
        assert_eq!(store.active_sessions(), 0);

        // other sessions are unaffected
        assert!(store.seal(&SessionId::new("s2"), b"rows", b"aad").is_ok());
    }

    #[test]
    fn test_retire_races_key_creation() {
        let store = Arc::new(SessionKeyStore::new());
        let session = SessionId::new("contended");

        let creators: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let session = session.clone();
                thread::spawn(move || {
                    let _ = store.seal(&session, b"rows", b"aad");
                })
            })
            .collect();
        store.retire(&session).unwrap();
        for handle in creators {
            handle.join().unwrap();
        }

        // whatever ran before retirement was destroyed, nothing ran after
        assert!(!store.contains(&session));
    }

    #[test]
    fn test_destroy_all() {
        let store = SessionKeyStore::new();
        store.get_or_create(&SessionId::new("a")).unwrap();
        store.get_or_create(&SessionId::new("b")).unwrap();
        assert_eq!(store.destroy_all().unwrap(), 2);
        assert_eq!(store.active_sessions(), 0);
    }
}
