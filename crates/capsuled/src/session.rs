//! Persisted staged-session records.
//!
//! One JSON file per session under the sessions directory. Every write
//! goes through a temp file, fsync and rename so a crash at any point
//! leaves either the previous record or the new one, never a torn file.
//! State transitions are persisted before the in-memory session
//! advances: a crash between "decided" and "persisted" is
//! indistinguishable from "never happened".

use std::path::{Path, PathBuf};

use capsule_common::{CapsuleError, CapsuleImage, Result, SessionState, SessionSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub state: SessionState,
    /// Child session ids; non-empty only for a parent grouping session.
    #[serde(default)]
    pub child_ids: Vec<u64>,
    /// Whether this session rolls back an earlier failed one.
    #[serde(default)]
    pub is_rollback: bool,
    #[serde(default)]
    pub rollback_of: Option<u64>,
    /// Images this session stages; empty for a parent session.
    #[serde(default)]
    pub images: Vec<CapsuleImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Verified,
            child_ids: Vec::new(),
            is_rollback: false,
            rollback_of: None,
            images: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A parent session is a pure grouping: it stages no images itself.
    pub fn is_parent(&self) -> bool {
        !self.child_ids.is_empty()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            state: self.state,
            child_ids: self.child_ids.clone(),
            is_rollback: self.is_rollback,
            rollback_of: self.rollback_of,
            images: self.images.clone(),
        }
    }
}

/// The state a session must be in before it can move to `next`.
fn required_state(next: SessionState) -> &'static str {
    match next {
        SessionState::Verified => "none",
        SessionState::Staged => "verified",
        SessionState::Ready => "staged",
        SessionState::Activated => "ready",
        SessionState::Success => "activated",
        SessionState::Reverted => "activated",
        SessionState::Aborted => "any non-terminal state",
    }
}

/// Durable session storage, one atomic JSON file per session.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("session_{id}.json"))
    }

    /// Load every persisted session. Unreadable records are logged and
    /// skipped so one corrupt file cannot take the daemon down with it.
    pub fn load_all(&self) -> Vec<Session> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut sessions = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("session_") || !name.ends_with(".json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session record {}: {}", path.display(), e),
            }
        }
        sessions.sort_by_key(|s: &Session| s.id);
        sessions
    }

    pub fn load(&self, id: u64) -> Result<Option<Session>> {
        let path = self.path_for(id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CapsuleError::PersistenceFailed(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let session = serde_json::from_str(&raw).map_err(|e| {
            CapsuleError::PersistenceFailed(format!("cannot parse {}: {e}", path.display()))
        })?;
        Ok(Some(session))
    }

    /// Durably write a session record: temp file, fsync, rename.
    pub fn save(&self, session: &Session) -> Result<()> {
        let fail = |what: &str, e: std::io::Error| {
            CapsuleError::PersistenceFailed(format!("{what}: {e}"))
        };

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| fail("creating sessions directory", e))?;

        let json = serde_json::to_string_pretty(session)
            .map_err(|e| CapsuleError::PersistenceFailed(format!("encoding session: {e}")))?;

        let path = self.path_for(session.id);
        let tmp = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file =
                std::fs::File::create(&tmp).map_err(|e| fail("creating temp record", e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| fail("writing session record", e))?;
            file.sync_all().map_err(|e| fail("syncing session record", e))?;
        }
        std::fs::rename(&tmp, &path).map_err(|e| fail("committing session record", e))?;
        Ok(())
    }

    pub fn delete(&self, id: u64) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::PersistenceFailed(format!(
                "cannot delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Validate, persist and then apply a state transition. On a
    /// persistence failure the in-memory session is left untouched.
    pub fn transition(&self, session: &mut Session, next: SessionState) -> Result<()> {
        if !session.state.can_transition_to(next) {
            return Err(CapsuleError::InvalidState(format!(
                "session {} is {}, expected {}",
                session.id,
                session.state,
                required_state(next)
            )));
        }
        let mut updated = session.clone();
        updated.state = next;
        updated.updated_at = Utc::now();
        self.save(&updated)?;
        *session = updated;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions"))
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut session = Session::new(7);
        session.child_ids = vec![8, 9];
        store.save(&session).unwrap();

        let loaded = store.load(7).unwrap().unwrap();
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.state, SessionState::Verified);
        assert_eq!(loaded.child_ids, vec![8, 9]);
        assert!(store.load(99).unwrap().is_none());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&Session::new(1)).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn transition_persists_before_applying() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut session = Session::new(3);
        store.save(&session).unwrap();

        store.transition(&mut session, SessionState::Staged).unwrap();
        assert_eq!(session.state, SessionState::Staged);
        assert_eq!(
            store.load(3).unwrap().unwrap().state,
            SessionState::Staged
        );
    }

    #[test]
    fn invalid_transition_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut session = Session::new(3);
        store.save(&session).unwrap();

        let err = store
            .transition(&mut session, SessionState::Ready)
            .unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidState(_)));
        assert_eq!(session.state, SessionState::Verified);
        assert_eq!(
            store.load(3).unwrap().unwrap().state,
            SessionState::Verified
        );
    }

    #[test]
    fn load_all_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&Session::new(1)).unwrap();
        store.save(&Session::new(2)).unwrap();
        std::fs::write(store.dir().join("session_3.json"), "{ not json").unwrap();

        let sessions = store.load_all();
        assert_eq!(
            sessions.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn load_all_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("never-created"));
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&Session::new(5)).unwrap();
        store.delete(5).unwrap();
        store.delete(5).unwrap();
        assert!(store.load(5).unwrap().is_none());
    }
}
