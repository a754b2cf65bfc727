//! Boot-time rollback and recovery.
//!
//! Runs once at early boot, before the RPC socket accepts work. The
//! persisted sessions plus the checkpoint collaborator decide whether
//! the previous boot's staged activation is kept or reverted:
//!
//! - `Activated` + boot not committed: failed staged install, revert.
//! - `Activated` + boot committed: keep, wait for an explicit
//!   mark-successful.
//! - `Verified`: a submission the daemon died in the middle of, abort.
//!
//! Recovery failures are fatal and surfaced; in particular there is no
//! rollback-of-a-rollback. Boot-loop protection belongs to the
//! checkpoint service, not to this pass.

use std::collections::BTreeMap;

use capsule_common::image::parse_image_id;
use capsule_common::{Result, SessionState};
use tracing::{info, warn};

use crate::activation::ActivationEngine;
use crate::checkpoint::CheckpointService;
use crate::mount_db::MountedCapsuleDb;
use crate::staging::SessionManager;

pub fn run_boot_recovery(
    manager: &SessionManager,
    db: &mut MountedCapsuleDb,
    engine: &ActivationEngine,
    checkpoint: &dyn CheckpointService,
) -> Result<()> {
    let committed = checkpoint.is_boot_committed();

    for root in manager.root_sessions() {
        match root.state {
            SessionState::Verified => {
                warn!(
                    "Session {}: submission never completed, aborting",
                    root.id
                );
                if let Err(e) = manager.abort(db, engine, checkpoint, root.id) {
                    warn!("Could not abort incomplete session {}: {e}", root.id);
                }
            }
            SessionState::Activated if !committed => {
                warn!(
                    "Session {}: boot was not committed, reverting staged install",
                    root.id
                );
                manager.revert_session(db, engine, root.id)?;
                if let Err(e) = checkpoint.abort_checkpoint() {
                    warn!("Could not abort the checkpoint window: {e}");
                }
            }
            SessionState::Activated => {
                info!(
                    "Session {}: boot committed, awaiting acceptance",
                    root.id
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// Cross-check the active set inferred from the mount table against the
/// authoritative session records.
///
/// The startup scan flags the highest mounted version of each package
/// active. That inference can disagree with what a session actually
/// installed, e.g. after an out-of-band remount. Disagreements are
/// logged, and when the recorded instance is still mounted the active
/// flag follows the session record; nothing is remounted.
pub fn reconcile_active_with_sessions(manager: &SessionManager, db: &mut MountedCapsuleDb) {
    let mut authoritative: BTreeMap<String, u64> = BTreeMap::new();
    let mut sessions = manager.store().load_all();
    sessions.sort_by_key(|s| s.updated_at);
    for session in &sessions {
        if !matches!(
            session.state,
            SessionState::Activated | SessionState::Success
        ) {
            continue;
        }
        for image in &session.images {
            authoritative.insert(image.name.clone(), image.version);
        }
    }

    for (name, recorded_version) in authoritative {
        let Some(active) = db.active_record(&name) else {
            continue;
        };
        let active_version = active
            .mount_point
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_image_id)
            .map(|(_, version)| version);
        if active_version == Some(recorded_version) {
            continue;
        }

        warn!(
            "Active instance of {name} disagrees with session records \
             (mounted highest: {:?}, recorded: {recorded_version})",
            active_version
        );
        let recorded_mount = db
            .records_for(&name)
            .iter()
            .map(|r| r.mount_point.clone())
            .find(|mount_point| {
                mount_point
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_image_id)
                    .is_some_and(|(_, version)| version == recorded_version)
            });
        match recorded_mount {
            Some(mount_point) => {
                db.set_active(&name, &mount_point);
            }
            None => warn!(
                "Recorded instance {name}@{recorded_version} is not mounted, \
                 keeping the inferred active instance"
            ),
        }
    }
}
