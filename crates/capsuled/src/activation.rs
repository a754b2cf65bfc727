//! Activation engine: turns a verified capsule image into a live mount
//! and back.
//!
//! Activation creates the block devices (loop, plus a verity layer for
//! integrity-protected images) and mounts the instance read-only at its
//! version-qualified path. Publication bind-mounts that path onto the
//! canonical one; only publication changes what the rest of the system
//! sees. Deactivation reverses strictly: unmount first, then the verity
//! device, then the loop device - the reverse order leaves orphaned
//! kernel resources.

use std::path::Path;
use std::sync::Arc;

use capsule_common::{CapsuleError, CapsuleImage, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::device::DeviceBackend;
use crate::mount_db::{MountRecord, MountedCapsuleDb};

pub struct ActivationEngine {
    backend: Arc<dyn DeviceBackend>,
    config: Config,
}

impl ActivationEngine {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: Config) -> Self {
        Self { backend, config }
    }

    /// Mapper device name for an integrity-protected instance.
    fn mapper_name(image: &CapsuleImage) -> String {
        format!("capsule-{}", image.id())
    }

    /// Mount `image` at its version-qualified path and record it.
    ///
    /// Idempotent: an already-mounted `(name, version)` instance is
    /// returned as-is with no side effects. The new instance is not
    /// published; see [`Self::publish_active`].
    pub fn activate(
        &self,
        db: &mut MountedCapsuleDb,
        image: &CapsuleImage,
    ) -> Result<MountRecord> {
        let mount_point = self
            .config
            .version_mount_point(&image.name, image.version);

        if let Some((_, record, _)) = db.record_at(&mount_point) {
            info!("{} already mounted at {}", image, mount_point.display());
            return Ok(record.clone());
        }

        std::fs::create_dir_all(&mount_point).map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "cannot create mount point {}: {e}",
                mount_point.display()
            ))
        })?;

        let loop_device = match self.backend.attach_loop(&image.path) {
            Ok(device) => device,
            Err(e) => {
                let _ = std::fs::remove_dir(&mount_point);
                return Err(e);
            }
        };

        let mut mapper_name = String::new();
        let data_device = if image.integrity_protected {
            let name = Self::mapper_name(image);
            match self.backend.create_verity(&name, &loop_device, &image.path) {
                Ok(device) => {
                    mapper_name = name;
                    device
                }
                Err(e) => {
                    self.unwind(&mount_point, None, Some(&loop_device));
                    return Err(e);
                }
            }
        } else {
            loop_device.clone()
        };

        if let Err(e) = self.backend.mount_ro(&data_device, &mount_point) {
            let mapper = (!mapper_name.is_empty()).then_some(mapper_name.as_str());
            self.unwind(&mount_point, mapper, Some(&loop_device));
            return Err(e);
        }

        let record = MountRecord {
            device: loop_device,
            backing_file: image.path.clone(),
            mount_point: mount_point.clone(),
            mapper_name,
        };
        db.add(&image.name, false, record.clone());

        info!("Activated {} at {}", image, mount_point.display());
        Ok(record)
    }

    /// Make the `(name, version)` instance the one visible at the
    /// canonical mount point, demoting any previously published
    /// instance.
    ///
    /// The old bind is lazily detached before the new bind lands, so a
    /// reader observes either the previous tree (through its open
    /// files) or the new one - never a half-switched path.
    pub fn publish_active(
        &self,
        db: &mut MountedCapsuleDb,
        name: &str,
        version: u64,
    ) -> Result<()> {
        let mount_point = self.config.version_mount_point(name, version);
        if db.record_at(&mount_point).is_none() {
            return Err(CapsuleError::DeviceOperationFailed(format!(
                "no mounted instance {name}@{version} to publish"
            )));
        }

        let canonical = self.config.canonical_mount_point(name);
        if db
            .active_record(name)
            .is_some_and(|record| record.mount_point == mount_point)
        {
            return Ok(());
        }

        std::fs::create_dir_all(&canonical).map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "cannot create mount point {}: {e}",
                canonical.display()
            ))
        })?;

        if db.active_record(name).is_some() {
            self.backend.detach_mount(&canonical)?;
        }
        self.backend.bind_mount(&mount_point, &canonical)?;
        db.set_active(name, &mount_point);

        info!("Published {name}@{version} at {}", canonical.display());
        Ok(())
    }

    /// Unmount the instance at `mount_point`, tear down its devices and
    /// drop its record. Reverses an active instance's publication first.
    ///
    /// A mount point with no record is a no-op so a failed deactivation
    /// can be retried from scratch. A still-referenced mount surfaces
    /// `BusyResource` and leaves the record in place.
    pub fn deactivate(&self, db: &mut MountedCapsuleDb, mount_point: &Path) -> Result<()> {
        let Some((name, record, active)) = db.record_at(mount_point) else {
            info!("Nothing mounted at {}, nothing to do", mount_point.display());
            return Ok(());
        };
        let name = name.to_string();
        let record = record.clone();

        if active {
            let canonical = self.config.canonical_mount_point(&name);
            self.backend.detach_mount(&canonical)?;
            let _ = std::fs::remove_dir(&canonical);
        }

        self.backend.unmount(mount_point)?;

        if !record.mapper_name.is_empty() {
            if let Err(e) = self.backend.remove_verity(&record.mapper_name) {
                warn!("Failed to remove verity device {}: {e}", record.mapper_name);
            }
        }
        if let Err(e) = self.backend.detach_loop(&record.device) {
            warn!("Failed to detach {}: {e}", record.device.display());
        }

        db.remove(mount_point);
        let _ = std::fs::remove_dir(mount_point);

        info!("Deactivated {}", mount_point.display());
        Ok(())
    }

    /// Best-effort teardown of half-built activation state.
    fn unwind(&self, mount_point: &Path, mapper_name: Option<&str>, loop_device: Option<&Path>) {
        if let Some(name) = mapper_name {
            if let Err(e) = self.backend.remove_verity(name) {
                warn!("Unwind: failed to remove verity device {name}: {e}");
            }
        }
        if let Some(device) = loop_device {
            if let Err(e) = self.backend.detach_loop(device) {
                warn!("Unwind: failed to detach {}: {e}", device.display());
            }
        }
        let _ = std::fs::remove_dir(mount_point);
    }
}
