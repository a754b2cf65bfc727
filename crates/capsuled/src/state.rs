//! Daemon context: every component the daemon owns.
//!
//! One `Core` instance is built at startup and handed to the RPC layer
//! behind a single lock. That lock is the serialization point the mount
//! state contract asks for: no two operations touch the database, the
//! engine or the session store concurrently.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use capsule_common::image::parse_image_id;
use capsule_common::ipc::ActiveCapsule;
use capsule_common::{CapsuleImage, Result, SessionSummary};
use tracing::info;

use crate::activation::ActivationEngine;
use crate::block::BlockMeta;
use crate::checkpoint::{CheckpointService, FileCheckpoint};
use crate::config::Config;
use crate::device::{DeviceBackend, LinuxBackend};
use crate::mount_db::MountedCapsuleDb;
use crate::recovery;
use crate::session::SessionStore;
use crate::staging::SessionManager;
use crate::verify::{ImageVerifier, ManifestVerifier};

pub struct Core {
    pub config: Config,
    pub db: MountedCapsuleDb,
    pub manager: SessionManager,
    pub engine: ActivationEngine,
    pub verifier: Box<dyn ImageVerifier>,
    pub checkpoint: Box<dyn CheckpointService>,
}

impl Core {
    pub fn new(config: Config) -> Self {
        let backend: Arc<dyn DeviceBackend> = Arc::new(LinuxBackend);
        let verifier = Box::new(ManifestVerifier::new(config.keys_dir.clone()));
        let checkpoint = Box::new(FileCheckpoint::new(config.checkpoint_dir.clone()));
        Self::with_parts(config, backend, verifier, checkpoint)
    }

    pub fn with_parts(
        config: Config,
        backend: Arc<dyn DeviceBackend>,
        verifier: Box<dyn ImageVerifier>,
        checkpoint: Box<dyn CheckpointService>,
    ) -> Self {
        let engine = ActivationEngine::new(backend, config.clone());
        let manager = SessionManager::new(
            SessionStore::new(config.sessions_dir.clone()),
            config.clone(),
        );
        Self {
            config,
            db: MountedCapsuleDb::new(),
            manager,
            engine,
            verifier,
            checkpoint,
        }
    }

    /// Boot sequence: reconcile the database with the live mount table,
    /// run recovery, activate sessions marked ready, and cross-check
    /// the result against the session records.
    pub fn startup(&mut self) -> anyhow::Result<()> {
        let mounts = std::fs::read_to_string(&self.config.mounts_path)
            .with_context(|| format!("cannot read {}", self.config.mounts_path.display()))?;
        let meta = BlockMeta::new(&self.config.sys_block_dir, &self.config.dev_dir);
        self.db
            .populate_from_mounts(&mounts, &meta, &self.config.capsule_root);

        recovery::run_boot_recovery(
            &self.manager,
            &mut self.db,
            &self.engine,
            self.checkpoint.as_ref(),
        )
        .context("boot recovery failed")?;

        self.manager
            .activate_staged_sessions(&mut self.db, &self.engine)
            .context("staged session activation failed")?;

        recovery::reconcile_active_with_sessions(&self.manager, &mut self.db);
        info!("[BOOT] {} instances mounted, {} active", self.db.len(), self.db.active_instances().len());
        Ok(())
    }

    pub fn submit(
        &mut self,
        session_id: u64,
        child_ids: &[u64],
        is_rollback: bool,
        rollback_of: Option<u64>,
    ) -> Result<Vec<CapsuleImage>> {
        self.manager.submit(
            self.verifier.as_ref(),
            self.checkpoint.as_ref(),
            session_id,
            child_ids,
            is_rollback,
            rollback_of,
        )
    }

    pub fn mark_ready(&mut self, session_id: u64) -> Result<()> {
        self.manager.mark_ready(session_id)
    }

    pub fn mark_successful(&mut self, session_id: u64) -> Result<()> {
        self.manager
            .mark_successful(&mut self.db, &self.engine, session_id)
    }

    pub fn abort(&mut self, session_id: u64) -> Result<()> {
        self.manager.abort(
            &mut self.db,
            &self.engine,
            self.checkpoint.as_ref(),
            session_id,
        )
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.manager
            .rollback_active(&mut self.db, &self.engine, self.checkpoint.as_ref())
    }

    /// Verify and activate one image immediately, publishing it when it
    /// is the highest mounted version of its package.
    pub fn activate_image(&mut self, path: &Path) -> Result<CapsuleImage> {
        let image = self.verifier.verify(path)?;
        self.engine.activate(&mut self.db, &image)?;

        let highest = self
            .db
            .records_for(&image.name)
            .iter()
            .filter_map(|record| {
                let file_name = record.mount_point.file_name()?.to_str()?;
                parse_image_id(file_name).map(|(_, version)| version)
            })
            .max();
        if highest == Some(image.version) {
            self.engine
                .publish_active(&mut self.db, &image.name, image.version)?;
        }
        Ok(image)
    }

    pub fn deactivate(&mut self, mount_point: &Path) -> Result<()> {
        self.engine.deactivate(&mut self.db, mount_point)
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.manager
            .store()
            .load_all()
            .iter()
            .map(|session| session.summary())
            .collect()
    }

    pub fn active_capsules(&self) -> Vec<ActiveCapsule> {
        self.db
            .active_instances()
            .into_iter()
            .filter_map(|(name, record)| {
                let file_name = record.mount_point.file_name()?.to_str()?;
                let (_, version) = parse_image_id(file_name)?;
                Some(ActiveCapsule {
                    name: name.to_string(),
                    version,
                    backing_file: record.backing_file.clone(),
                    mount_point: self.config.canonical_mount_point(name),
                })
            })
            .collect()
    }

    pub fn open_session_count(&self) -> usize {
        self.manager
            .store()
            .load_all()
            .iter()
            .filter(|session| !session.state.is_terminal())
            .count()
    }
}

/// Create the directories the daemon writes to.
pub fn prepare_directories(config: &Config) -> std::io::Result<()> {
    for dir in [
        &config.state_dir,
        &config.sessions_dir,
        &config.staging_dir,
        &config.checkpoint_dir,
        &config.capsule_root,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
