//! Device and mount side effects behind one trait.
//!
//! The activation engine talks to the kernel exclusively through
//! [`DeviceBackend`] so its sequencing logic can be exercised against an
//! in-memory fake. The production backend drives losetup/veritysetup and
//! the mount syscalls.

use std::path::{Path, PathBuf};
use std::process::Command;

use capsule_common::{CapsuleError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::Deserialize;
use tracing::debug;

pub trait DeviceBackend: Send + Sync {
    /// Bind a read-only loop device to the image file, returning the
    /// device node path.
    fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf>;

    fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Layer a verity device named `name` over `data_device`. Verity
    /// parameters come from the image's sidecar metadata.
    fn create_verity(&self, name: &str, data_device: &Path, image: &Path) -> Result<PathBuf>;

    fn remove_verity(&self, name: &str) -> Result<()>;

    fn mount_ro(&self, device: &Path, mount_point: &Path) -> Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    /// Strict unmount. `BusyResource` when the mount point is still
    /// referenced; a path with nothing mounted is a no-op.
    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Lazy unmount: detach now, let existing users drain. Used when
    /// retracting a canonical bind mount, never for device teardown.
    fn detach_mount(&self, mount_point: &Path) -> Result<()>;
}

/// Verity parameters shipped next to an integrity-protected image as
/// `<image>.verity.json`, produced by the capsule builder.
#[derive(Debug, Deserialize)]
struct VerityParams {
    root_hash: String,
    hash_offset: u64,
}

/// Production backend: losetup/veritysetup plus mount(2)/umount2(2).
pub struct LinuxBackend;

impl LinuxBackend {
    fn run(mut command: Command) -> Result<String> {
        let rendered = format!("{command:?}");
        debug!("Running {rendered}");
        let output = command
            .output()
            .map_err(|e| CapsuleError::DeviceOperationFailed(format!("{rendered}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapsuleError::DeviceOperationFailed(format!(
                "{rendered}: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn verity_params(image: &Path) -> Result<VerityParams> {
        let sidecar = PathBuf::from(format!("{}.verity.json", image.display()));
        let contents = std::fs::read_to_string(&sidecar).map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "cannot read verity metadata {}: {e}",
                sidecar.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "malformed verity metadata {}: {e}",
                sidecar.display()
            ))
        })
    }
}

impl DeviceBackend for LinuxBackend {
    fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf> {
        let mut cmd = Command::new("losetup");
        cmd.arg("--find").arg("--show").arg("--read-only").arg(backing_file);
        let device = Self::run(cmd)?;
        if device.is_empty() {
            return Err(CapsuleError::DeviceOperationFailed(format!(
                "losetup returned no device for {}",
                backing_file.display()
            )));
        }
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        let mut cmd = Command::new("losetup");
        cmd.arg("--detach").arg(device);
        Self::run(cmd).map(|_| ())
    }

    fn create_verity(&self, name: &str, data_device: &Path, image: &Path) -> Result<PathBuf> {
        let params = Self::verity_params(image)?;
        let mut cmd = Command::new("veritysetup");
        cmd.arg("open")
            .arg(data_device)
            .arg(name)
            .arg(data_device)
            .arg(&params.root_hash)
            .arg(format!("--hash-offset={}", params.hash_offset));
        Self::run(cmd)?;
        Ok(PathBuf::from("/dev/mapper").join(name))
    }

    fn remove_verity(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("veritysetup");
        cmd.arg("close").arg(name);
        Self::run(cmd).map(|_| ())
    }

    fn mount_ro(&self, device: &Path, mount_point: &Path) -> Result<()> {
        let flags = MsFlags::MS_RDONLY | MsFlags::MS_NOATIME | MsFlags::MS_NODEV;
        mount(
            Some(device),
            mount_point,
            Some("ext4"),
            flags,
            None::<&str>,
        )
        .map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "mounting {} on {}: {e}",
                device.display(),
                mount_point.display()
            ))
        })
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            CapsuleError::DeviceOperationFailed(format!(
                "bind-mounting {} on {}: {e}",
                source.display(),
                target.display()
            ))
        })
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        match umount2(mount_point, MntFlags::UMOUNT_NOFOLLOW) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EBUSY) => Err(CapsuleError::BusyResource {
                path: mount_point.to_path_buf(),
            }),
            // Nothing mounted (or already gone): safe to treat as done.
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(CapsuleError::DeviceOperationFailed(format!(
                "unmounting {}: {e}",
                mount_point.display()
            ))),
        }
    }

    fn detach_mount(&self, mount_point: &Path) -> Result<()> {
        match umount2(mount_point, MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(CapsuleError::DeviceOperationFailed(format!(
                "detaching {}: {e}",
                mount_point.display()
            ))),
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory device backend for tests.

    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        loops: BTreeMap<PathBuf, PathBuf>,
        verity: BTreeMap<String, PathBuf>,
        mounts: BTreeMap<PathBuf, PathBuf>,
        busy: BTreeSet<PathBuf>,
        fail_attach: BTreeSet<PathBuf>,
        fail_mount: BTreeSet<PathBuf>,
        next_loop: u32,
        attach_calls: usize,
    }

    /// Records every device and mount it is asked for; can be told to
    /// fail specific operations or report mount points busy.
    #[derive(Default)]
    pub struct FakeBackend {
        state: Mutex<FakeState>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn loop_count(&self) -> usize {
            self.state.lock().unwrap().loops.len()
        }

        pub fn verity_count(&self) -> usize {
            self.state.lock().unwrap().verity.len()
        }

        pub fn attach_calls(&self) -> usize {
            self.state.lock().unwrap().attach_calls
        }

        pub fn is_mounted(&self, mount_point: &Path) -> bool {
            self.state.lock().unwrap().mounts.contains_key(mount_point)
        }

        /// What is currently visible at `mount_point` (device or bind source).
        pub fn mounted_source(&self, mount_point: &Path) -> Option<PathBuf> {
            self.state.lock().unwrap().mounts.get(mount_point).cloned()
        }

        pub fn mark_busy(&self, mount_point: &Path) {
            self.state.lock().unwrap().busy.insert(mount_point.to_path_buf());
        }

        pub fn clear_busy(&self, mount_point: &Path) {
            self.state.lock().unwrap().busy.remove(mount_point);
        }

        pub fn fail_attach_for(&self, backing_file: &Path) {
            self.state
                .lock()
                .unwrap()
                .fail_attach
                .insert(backing_file.to_path_buf());
        }

        pub fn fail_mount_at(&self, mount_point: &Path) {
            self.state
                .lock()
                .unwrap()
                .fail_mount
                .insert(mount_point.to_path_buf());
        }
    }

    impl DeviceBackend for FakeBackend {
        fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf> {
            let mut state = self.state.lock().unwrap();
            state.attach_calls += 1;
            if state.fail_attach.contains(backing_file) {
                return Err(CapsuleError::DeviceOperationFailed(format!(
                    "injected losetup failure for {}",
                    backing_file.display()
                )));
            }
            let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
            state.next_loop += 1;
            state.loops.insert(device.clone(), backing_file.to_path_buf());
            Ok(device)
        }

        fn detach_loop(&self, device: &Path) -> Result<()> {
            self.state.lock().unwrap().loops.remove(device);
            Ok(())
        }

        fn create_verity(&self, name: &str, data_device: &Path, _image: &Path) -> Result<PathBuf> {
            let mut state = self.state.lock().unwrap();
            state
                .verity
                .insert(name.to_string(), data_device.to_path_buf());
            Ok(PathBuf::from("/dev/mapper").join(name))
        }

        fn remove_verity(&self, name: &str) -> Result<()> {
            self.state.lock().unwrap().verity.remove(name);
            Ok(())
        }

        fn mount_ro(&self, device: &Path, mount_point: &Path) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_mount.contains(mount_point) {
                return Err(CapsuleError::DeviceOperationFailed(format!(
                    "injected mount failure at {}",
                    mount_point.display()
                )));
            }
            state
                .mounts
                .insert(mount_point.to_path_buf(), device.to_path_buf());
            Ok(())
        }

        fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .mounts
                .insert(target.to_path_buf(), source.to_path_buf());
            Ok(())
        }

        fn unmount(&self, mount_point: &Path) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.busy.contains(mount_point) {
                return Err(CapsuleError::BusyResource {
                    path: mount_point.to_path_buf(),
                });
            }
            state.mounts.remove(mount_point);
            Ok(())
        }

        fn detach_mount(&self, mount_point: &Path) -> Result<()> {
            self.state.lock().unwrap().mounts.remove(mount_point);
            Ok(())
        }
    }
}
