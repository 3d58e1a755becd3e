//! File-backed state store with lock-guarded read-modify-write.
//!
//! One JSON snapshot file per installation. Reads never fail on a missing
//! file (empty default instead); writes go through a temp file and an atomic
//! rename so readers never observe partial content. Every mutation entry
//! point follows the same shape: acquire lock → read → mutate in memory →
//! write → release lock.

use crate::errors::StoreError;
use crate::state::lock::{LockSettings, StateLock};
use crate::state::types::{CompletedDispatch, Dispatch, DispatchStatus, SessionMapping, Snapshot};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct StateStore {
    path: PathBuf,
    lock_settings: LockSettings,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock_settings: LockSettings::default(),
        }
    }

    pub fn with_lock_settings(path: PathBuf, lock_settings: LockSettings) -> Self {
        Self {
            path,
            lock_settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current snapshot. A missing file is an empty installation,
    /// never an error; unreadable JSON is.
    pub fn read(&self) -> Result<Snapshot, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Snapshot::default());
            }
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Serialize the snapshot to `<path>.tmp` and rename over the state file.
    fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let io = |source| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::Other(anyhow::Error::new(e).context("serialize snapshot")))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }

    /// Lock-guarded read-modify-write. The closure's return value is passed
    /// through after the snapshot is persisted.
    pub async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> T,
    ) -> Result<T, StoreError> {
        let _lock = StateLock::acquire(&self.path, &self.lock_settings).await?;
        let mut snapshot = self.read()?;
        let out = f(&mut snapshot);
        self.write(&snapshot)?;
        Ok(out)
    }

    /// Like [`mutate`](Self::mutate), but the closure can refuse the change:
    /// on `Err` nothing is written and the snapshot on disk stays as it was.
    pub async fn try_mutate<T, E>(
        &self,
        f: impl FnOnce(&mut Snapshot) -> Result<T, E>,
    ) -> Result<Result<T, E>, StoreError> {
        let _lock = StateLock::acquire(&self.path, &self.lock_settings).await?;
        let mut snapshot = self.read()?;
        match f(&mut snapshot) {
            Ok(out) => {
                self.write(&snapshot)?;
                Ok(Ok(out))
            }
            Err(e) => Ok(Err(e)),
        }
    }

    /// Add a dispatch to the active set, replacing any existing entry with
    /// the same id.
    pub async fn register_dispatch(&self, dispatch: Dispatch) -> Result<(), StoreError> {
        self.mutate(|snap| {
            debug!(id = %dispatch.id, identifier = %dispatch.identifier, "Registering dispatch");
            snap.dispatches.active.insert(dispatch.id.clone(), dispatch);
        })
        .await
    }

    /// Move a dispatch from the active set to the completed set, dropping its
    /// session mappings. Returns the completion record, or `None` if the
    /// dispatch was not active.
    pub async fn complete_dispatch(
        &self,
        id: &str,
        status: DispatchStatus,
    ) -> Result<Option<CompletedDispatch>, StoreError> {
        self.mutate(|snap| {
            let dispatch = snap.dispatches.active.remove(id)?;
            snap.session_map.retain(|_, m| m.dispatch_id != id);
            let record = CompletedDispatch::from_dispatch(&dispatch, status);
            snap.dispatches
                .completed
                .insert(record.id.clone(), record.clone());
            Some(record)
        })
        .await
    }

    /// Drop a dispatch from the active set without recording completion
    /// (operator action). Session mappings go with it.
    pub async fn remove_dispatch(&self, id: &str) -> Result<Option<Dispatch>, StoreError> {
        self.mutate(|snap| {
            snap.session_map.retain(|_, m| m.dispatch_id != id);
            snap.dispatches.active.remove(id)
        })
        .await
    }

    /// Fetch a dispatch from the active set without holding the lock.
    pub fn get_dispatch(&self, id: &str) -> Result<Option<Dispatch>, StoreError> {
        Ok(self.read()?.dispatches.active.get(id).cloned())
    }

    pub async fn register_session(
        &self,
        run_key: &str,
        mapping: SessionMapping,
    ) -> Result<(), StoreError> {
        self.mutate(|snap| {
            snap.session_map.insert(run_key.to_string(), mapping);
        })
        .await
    }

    pub async fn remove_session(&self, run_key: &str) -> Result<(), StoreError> {
        self.mutate(|snap| {
            snap.session_map.remove(run_key);
        })
        .await
    }

    /// Record an event key in the idempotency ledger. Returns true on first
    /// sighting; a duplicate delivery gets false and must short-circuit.
    pub async fn mark_event_processed(&self, key: &str) -> Result<bool, StoreError> {
        self.mutate(|snap| snap.mark_event(key)).await
    }

    /// Delete the state file entirely.
    pub fn reset(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::WriteFailed {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::RunPhase;
    use tempfile::tempdir;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        (StateStore::new(path), dir)
    }

    fn dispatch(id: &str, identifier: &str) -> Dispatch {
        Dispatch::new(id, identifier, "Test issue", "/ws", "main")
    }

    #[test]
    fn test_read_missing_file_returns_default() {
        let (store, _dir) = make_store();
        let snap = store.read().unwrap();
        assert!(snap.dispatches.active.is_empty());
        assert!(snap.dispatches.completed.is_empty());
        assert!(snap.session_map.is_empty());
    }

    #[test]
    fn test_read_corrupt_file_errors() {
        let (store, _dir) = make_store();
        fs::write(store.path(), "{not json").unwrap();
        let err = store.read().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_register_and_get_dispatch() {
        let (store, _dir) = make_store();
        store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();

        let d = store.get_dispatch("1").unwrap().unwrap();
        assert_eq!(d.identifier, "ENG-1");
        assert_eq!(d.status, DispatchStatus::Dispatched);
        assert!(store.get_dispatch("2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_is_atomic_no_tmp_left_behind() {
        let (store, dir) = make_store();
        store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();
        assert!(store.path().exists());
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[tokio::test]
    async fn test_complete_dispatch_moves_and_clears_sessions() {
        let (store, _dir) = make_store();
        let mut d = dispatch("1", "ENG-1");
        d.attempt = 1;
        store.register_dispatch(d).await.unwrap();
        store
            .register_session(
                "worker-ENG-1-1",
                SessionMapping {
                    dispatch_id: "1".into(),
                    phase: RunPhase::Worker,
                    attempt: 1,
                },
            )
            .await
            .unwrap();

        let record = store
            .complete_dispatch("1", DispatchStatus::Done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.total_attempts, 2);

        let snap = store.read().unwrap();
        assert!(snap.dispatches.active.is_empty());
        assert!(snap.dispatches.completed.contains_key("1"));
        assert!(snap.session_map.is_empty());
    }

    #[tokio::test]
    async fn test_complete_unknown_dispatch_is_none() {
        let (store, _dir) = make_store();
        let record = store
            .complete_dispatch("nope", DispatchStatus::Done)
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_remove_dispatch_drops_its_sessions_only() {
        let (store, _dir) = make_store();
        store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();
        store.register_dispatch(dispatch("2", "ENG-2")).await.unwrap();
        for (key, id) in [("worker-ENG-1-0", "1"), ("worker-ENG-2-0", "2")] {
            store
                .register_session(
                    key,
                    SessionMapping {
                        dispatch_id: id.into(),
                        phase: RunPhase::Worker,
                        attempt: 0,
                    },
                )
                .await
                .unwrap();
        }

        store.remove_dispatch("1").await.unwrap();
        let snap = store.read().unwrap();
        assert!(!snap.session_map.contains_key("worker-ENG-1-0"));
        assert!(snap.session_map.contains_key("worker-ENG-2-0"));
    }

    #[tokio::test]
    async fn test_mark_event_processed_is_idempotent() {
        let (store, _dir) = make_store();
        assert!(store.mark_event_processed("worker-end:k1").await.unwrap());
        assert!(!store.mark_event_processed("worker-end:k1").await.unwrap());
        assert!(store.mark_event_processed("worker-end:k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_try_mutate_err_does_not_write() {
        let (store, _dir) = make_store();
        store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();

        let out: Result<(), &str> = store
            .try_mutate(|snap| {
                snap.dispatches.active.clear();
                Err("refused")
            })
            .await
            .unwrap();
        assert_eq!(out, Err("refused"));

        // The clear above must not have been persisted.
        assert!(store.get_dispatch("1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = StateStore::new(path.clone());
            store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();
        }

        {
            let store = StateStore::new(path);
            let d = store.get_dispatch("1").unwrap().unwrap();
            assert_eq!(d.identifier, "ENG-1");
        }
    }

    #[tokio::test]
    async fn test_reset_removes_file() {
        let (store, _dir) = make_store();
        store.register_dispatch(dispatch("1", "ENG-1")).await.unwrap();
        store.reset().unwrap();
        assert!(store.read().unwrap().dispatches.active.is_empty());
        store.reset().unwrap(); // second reset is a no-op
    }
}
