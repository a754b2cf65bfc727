//! Staged session manager.
//!
//! Drives install transactions from submission through activation to
//! success or rollback. Multi-package installs arrive as a parent
//! session grouping child sessions, one candidate image per child; the
//! group advances through the state machine as a unit and is activated
//! all-or-nothing. All transitions are durably persisted through
//! [`SessionStore`] before they take effect.

use std::collections::BTreeSet;
use std::path::PathBuf;

use capsule_common::image::parse_image_id;
use capsule_common::{CapsuleError, CapsuleImage, Result, SessionState};
use tracing::{error, info, warn};

use crate::activation::ActivationEngine;
use crate::checkpoint::CheckpointService;
use crate::config::Config;
use crate::mount_db::MountedCapsuleDb;
use crate::session::{Session, SessionStore};
use crate::verify::ImageVerifier;

pub struct SessionManager {
    store: SessionStore,
    config: Config,
}

impl SessionManager {
    pub fn new(store: SessionStore, config: Config) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn load_required(&self, id: u64) -> Result<Session> {
        self.store
            .load(id)?
            .ok_or_else(|| CapsuleError::InvalidState(format!("session {id} does not exist")))
    }

    fn load_children(&self, session: &Session) -> Result<Vec<Session>> {
        session
            .child_ids
            .iter()
            .map(|&id| self.load_required(id))
            .collect()
    }

    /// The sessions that actually stage images: the children of a
    /// parent, or the session itself.
    fn leaves<'a>(session: &'a Session, children: &'a [Session]) -> Vec<&'a Session> {
        if session.is_parent() {
            children.iter().collect()
        } else {
            vec![session]
        }
    }

    /// The single candidate image in one session's staging directory.
    /// Sidecar metadata files are not candidates.
    fn candidate_image(&self, session_id: u64) -> Result<PathBuf> {
        let dir = self.config.session_staging_dir(session_id);
        let fail = |reason: String| CapsuleError::VerificationFailed {
            path: dir.clone(),
            reason,
        };

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| fail(format!("cannot scan staging directory: {e}")))?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                !name.ends_with(".manifest.json") && !name.ends_with(".verity.json")
            })
            .collect();

        match candidates.len() {
            0 => Err(fail("no capsule image staged".to_string())),
            1 => Ok(candidates.remove(0)),
            n => Err(fail(format!("{n} capsule images staged, expected one"))),
        }
    }

    /// Verify and persist a staged session.
    ///
    /// Every candidate is verified before anything is persisted; a
    /// single bad image rejects the whole submission. The group is
    /// recorded in `Verified` and then advanced to `Staged`, children
    /// before parent.
    pub fn submit(
        &self,
        verifier: &dyn ImageVerifier,
        checkpoint: &dyn CheckpointService,
        session_id: u64,
        child_ids: &[u64],
        is_rollback: bool,
        rollback_of: Option<u64>,
    ) -> Result<Vec<CapsuleImage>> {
        let mut all_ids = vec![session_id];
        all_ids.extend_from_slice(child_ids);
        for &id in &all_ids {
            if let Some(existing) = self.store.load(id)? {
                if existing.state.is_terminal() {
                    self.store.delete(id)?;
                } else {
                    return Err(CapsuleError::InvalidState(format!(
                        "session {id} already exists and is {}",
                        existing.state
                    )));
                }
            }
        }

        let leaf_ids: Vec<u64> = if child_ids.is_empty() {
            vec![session_id]
        } else {
            child_ids.to_vec()
        };

        let mut staged = Vec::new();
        for &id in &leaf_ids {
            let path = self.candidate_image(id)?;
            let image = verifier.verify(&path)?;
            info!("Session {id}: verified {image}");
            staged.push((id, image));
        }

        // Revert on the next boot unless it gets confirmed. Losing the
        // window is survivable: the database still knows the prior
        // instances.
        if let Err(e) = checkpoint.start_checkpoint() {
            warn!("Could not open a checkpoint window: {e}");
        }

        if let Err(e) =
            self.persist_submission(session_id, child_ids, &staged, is_rollback, rollback_of)
        {
            for &id in &all_ids {
                let _ = self.store.delete(id);
            }
            return Err(e);
        }

        Ok(staged.into_iter().map(|(_, image)| image).collect())
    }

    fn persist_submission(
        &self,
        session_id: u64,
        child_ids: &[u64],
        staged: &[(u64, CapsuleImage)],
        is_rollback: bool,
        rollback_of: Option<u64>,
    ) -> Result<()> {
        let images_for = |id: u64| {
            staged
                .iter()
                .filter(|(leaf, _)| *leaf == id)
                .map(|(_, image)| image.clone())
                .collect::<Vec<_>>()
        };

        let mut group = Vec::new();
        for &child_id in child_ids {
            let mut child = Session::new(child_id);
            child.images = images_for(child_id);
            group.push(child);
        }
        let mut session = Session::new(session_id);
        session.is_rollback = is_rollback;
        session.rollback_of = rollback_of;
        if child_ids.is_empty() {
            session.images = images_for(session_id);
        } else {
            session.child_ids = child_ids.to_vec();
        }
        group.push(session);

        for session in &group {
            self.store.save(session)?;
        }
        for session in &mut group {
            self.store.transition(session, SessionState::Staged)?;
        }
        Ok(())
    }

    /// Hand a staged session over to boot-time activation.
    ///
    /// Idempotent: a group already in `Ready` stays there. Anything
    /// else but `Staged` is refused.
    pub fn mark_ready(&self, session_id: u64) -> Result<()> {
        let session = self.load_required(session_id)?;
        let mut children = self.load_children(&session)?;
        let mut session = session;

        for member in children.iter().chain(std::iter::once(&session)) {
            if !matches!(member.state, SessionState::Staged | SessionState::Ready) {
                return Err(CapsuleError::InvalidState(format!(
                    "session {} is {}, expected staged",
                    member.id, member.state
                )));
            }
        }

        for child in &mut children {
            if child.state == SessionState::Staged {
                self.store.transition(child, SessionState::Ready)?;
            }
        }
        if session.state == SessionState::Staged {
            self.store.transition(&mut session, SessionState::Ready)?;
        }
        info!("Session {session_id} is ready for the next boot");
        Ok(())
    }

    /// Accept an activated session: the boot was confirmed and the
    /// owning component takes the update. Superseded instances of the
    /// affected packages are torn down.
    pub fn mark_successful(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        session_id: u64,
    ) -> Result<()> {
        let session = self.load_required(session_id)?;
        let mut children = self.load_children(&session)?;
        let mut session = session;

        let done = std::iter::once(&session)
            .chain(children.iter())
            .all(|s| s.state == SessionState::Success);
        if done {
            return Ok(());
        }

        for member in children.iter().chain(std::iter::once(&session)) {
            if !matches!(member.state, SessionState::Activated | SessionState::Success) {
                return Err(CapsuleError::InvalidState(format!(
                    "session {} is {}, expected activated",
                    member.id, member.state
                )));
            }
        }

        for child in &mut children {
            if child.state == SessionState::Activated {
                self.store.transition(child, SessionState::Success)?;
            }
        }
        if session.state == SessionState::Activated {
            self.store.transition(&mut session, SessionState::Success)?;
        }

        for leaf in Self::leaves(&session, &children) {
            for image in &leaf.images {
                self.prune_superseded(db, engine, &image.name, image.version);
            }
        }
        info!("Session {session_id} accepted");
        Ok(())
    }

    /// Tear down mounted instances of `name` other than `keep_version`.
    /// Best effort: a busy mount stays until the next opportunity.
    fn prune_superseded(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        name: &str,
        keep_version: u64,
    ) {
        let stale: Vec<PathBuf> = db
            .records_for(name)
            .iter()
            .filter_map(|record| {
                let file_name = record.mount_point.file_name()?.to_str()?;
                let (_, version) = parse_image_id(file_name)?;
                (version != keep_version).then(|| record.mount_point.clone())
            })
            .collect();
        for mount_point in stale {
            if let Some((_, _, true)) = db.record_at(&mount_point) {
                continue;
            }
            if let Err(e) = engine.deactivate(db, &mount_point) {
                warn!(
                    "Could not prune superseded instance {}: {e}",
                    mount_point.display()
                );
            }
        }
    }

    /// Abort a non-terminal session, reversing any activation already
    /// performed.
    pub fn abort(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        checkpoint: &dyn CheckpointService,
        session_id: u64,
    ) -> Result<()> {
        let session = self.load_required(session_id)?;
        if session.state.is_terminal() {
            return Err(CapsuleError::InvalidState(format!(
                "session {session_id} is {}, already terminal",
                session.state
            )));
        }
        let mut children = self.load_children(&session)?;
        let mut session = session;

        let possibly_activated = std::iter::once(&session)
            .chain(children.iter())
            .any(|s| matches!(s.state, SessionState::Ready | SessionState::Activated));
        if possibly_activated {
            self.revert_group(db, engine, &Self::leaves(&session, &children))?;
            if let Err(e) = checkpoint.abort_checkpoint() {
                warn!("Could not abort the checkpoint window: {e}");
            }
        }

        for child in &mut children {
            if !child.state.is_terminal() {
                self.store.transition(child, SessionState::Aborted)?;
            }
        }
        self.store.transition(&mut session, SessionState::Aborted)?;
        info!("Session {session_id} aborted");
        Ok(())
    }

    /// Activate every session group in `Ready` state. Run once per
    /// boot. A group either becomes `Activated` in full or is rolled
    /// back and `Aborted`; the failure of a rollback-flagged group is
    /// fatal and propagated to the caller.
    pub fn activate_staged_sessions(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
    ) -> Result<()> {
        for root in self.root_sessions() {
            if root.state != SessionState::Ready {
                continue;
            }
            let mut children = self.load_children(&root)?;
            let mut root = root;
            if !children.iter().all(|c| c.state == SessionState::Ready) {
                warn!(
                    "Session {}: skipping activation, children not all ready",
                    root.id
                );
                continue;
            }

            let activated = self.activate_group(db, engine, &Self::leaves(&root, &children));
            match activated {
                Ok(()) => {
                    for child in &mut children {
                        self.store.transition(child, SessionState::Activated)?;
                    }
                    self.store.transition(&mut root, SessionState::Activated)?;
                    info!("Session {} activated", root.id);
                }
                Err(e) => {
                    error!("Activation of session {} failed: {e}", root.id);
                    self.revert_group(db, engine, &Self::leaves(&root, &children))?;
                    for child in &mut children {
                        self.store.transition(child, SessionState::Aborted)?;
                    }
                    self.store.transition(&mut root, SessionState::Aborted)?;
                    if root.is_rollback {
                        // A failed rollback is not retried here; surface it.
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn activate_group(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        leaves: &[&Session],
    ) -> Result<()> {
        for leaf in leaves {
            for image in &leaf.images {
                engine.activate(db, image)?;
                engine.publish_active(db, &image.name, image.version)?;
            }
        }
        Ok(())
    }

    /// Deactivate a group's staged instances and restore the previously
    /// active instance of each affected package. Images that never got
    /// activated deactivate as no-ops, so this also unwinds partial
    /// groups.
    pub fn revert_group(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        leaves: &[&Session],
    ) -> Result<()> {
        for leaf in leaves {
            for image in &leaf.images {
                let mount_point = self
                    .config
                    .version_mount_point(&image.name, image.version);
                let was_active = matches!(db.record_at(&mount_point), Some((_, _, true)));
                engine.deactivate(db, &mount_point)?;
                if was_active {
                    match highest_mounted_version(db, &image.name) {
                        Some(prior) => {
                            engine.publish_active(db, &image.name, prior)?;
                            info!("Restored {}@{prior}", image.name);
                        }
                        None => warn!("No prior instance of {} to restore", image.name),
                    }
                }
            }
        }
        Ok(())
    }

    /// Revert one activated session group: deactivate its instances,
    /// restore the prior active set and mark the group `Reverted`.
    pub fn revert_session(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        session_id: u64,
    ) -> Result<()> {
        let root = self.load_required(session_id)?;
        let mut children = self.load_children(&root)?;
        let mut root = root;

        self.revert_group(db, engine, &Self::leaves(&root, &children))?;
        for child in &mut children {
            if child.state == SessionState::Activated {
                self.store.transition(child, SessionState::Reverted)?;
            }
        }
        self.store.transition(&mut root, SessionState::Reverted)?;
        info!("Session {} reverted", root.id);
        Ok(())
    }

    /// Revert the activated session group, if any.
    pub fn rollback_active(
        &self,
        db: &mut MountedCapsuleDb,
        engine: &ActivationEngine,
        checkpoint: &dyn CheckpointService,
    ) -> Result<()> {
        let Some(root) = self
            .root_sessions()
            .into_iter()
            .rev()
            .find(|s| s.state == SessionState::Activated)
        else {
            return Err(CapsuleError::InvalidState(
                "no activated session to roll back".to_string(),
            ));
        };

        if let Err(e) = checkpoint.abort_checkpoint() {
            warn!("Could not abort the checkpoint window: {e}");
        }
        self.revert_session(db, engine, root.id)
    }

    /// Sessions that are not a child of another session: parents and
    /// standalones.
    pub fn root_sessions(&self) -> Vec<Session> {
        let sessions = self.store.load_all();
        let child_ids: BTreeSet<u64> = sessions
            .iter()
            .flat_map(|s| s.child_ids.iter().copied())
            .collect();
        sessions
            .into_iter()
            .filter(|s| !child_ids.contains(&s.id))
            .collect()
    }
}

/// Highest mounted version of `name`, read off the version-qualified
/// mount-point names.
fn highest_mounted_version(db: &MountedCapsuleDb, name: &str) -> Option<u64> {
    db.records_for(name)
        .iter()
        .filter_map(|record| {
            let file_name = record.mount_point.file_name()?.to_str()?;
            let (_, version) = parse_image_id(file_name)?;
            Some(version)
        })
        .max()
}
