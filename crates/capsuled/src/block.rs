//! Block device resolution.
//!
//! Maps a kernel block device back to the capsule image file behind it.
//! A capsule mount comes from either a plain loop device (`loopN`) or a
//! dm-verity device (`dm-N`) layered over one loop device. The loop
//! device's `loop/backing_file` attribute leads to the original image;
//! for a mapped device the `slaves/` directory leads to that loop device
//! and `dm/name` carries the mapping name.
//!
//! Everything here is a read-only metadata walk. Device creation and
//! teardown live in [`crate::device`].

use std::path::PathBuf;

use capsule_common::{CapsuleError, Result};
use tracing::warn;

/// Classification of a kernel block device by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Loop,
    Mapped,
    Unknown,
}

/// Roots under which device metadata and device nodes are looked up.
/// Defaults to the running kernel's `/sys/block` and `/dev`; tests point
/// these at synthetic directory trees.
#[derive(Debug, Clone)]
pub struct BlockMeta {
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl BlockMeta {
    pub fn new(sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// View of one device by kernel name (`loop3`, `dm-0`, ...).
    pub fn device(&self, name: &str) -> BlockDevice<'_> {
        BlockDevice {
            meta: self,
            name: name.to_string(),
        }
    }
}

/// Read-only view of one kernel block device.
pub struct BlockDevice<'a> {
    meta: &'a BlockMeta,
    name: String,
}

impl BlockDevice<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        if self.name.starts_with("loop") {
            DeviceKind::Loop
        } else if self.name.starts_with("dm-") {
            DeviceKind::Mapped
        } else {
            DeviceKind::Unknown
        }
    }

    pub fn dev_path(&self) -> PathBuf {
        self.meta.dev_root.join(&self.name)
    }

    fn sys_path(&self) -> PathBuf {
        self.meta.sys_root.join(&self.name)
    }

    /// Read and trim one sysfs attribute, e.g. `loop/backing_file`.
    pub fn property(&self, attribute: &str) -> Result<String> {
        let path = self.sys_path().join(attribute);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) => Err(CapsuleError::UnresolvableDevice {
                device: self.name.clone(),
                reason: format!("cannot read {}: {}", path.display(), e),
            }),
        }
    }

    /// Devices this device is stacked on, from `slaves/`.
    pub fn slaves(&self) -> Vec<BlockDevice<'_>> {
        let slaves_dir = self.sys_path().join("slaves");
        let entries = match std::fs::read_dir(&slaves_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", slaves_dir.display(), e);
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .map(|name| self.meta.device(&name))
            .collect()
    }
}

/// A mount's backing resolved back through its block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// Block device the image data is read from (always the loop device,
    /// also for verity mounts).
    pub device: PathBuf,
    /// Original capsule image file.
    pub backing_file: PathBuf,
    /// dm mapping name; empty for plain loop mounts.
    pub mapper_name: String,
}

/// Resolve a block device name to its backing image.
///
/// For a mapped device exactly one loop device is expected among its
/// slaves: a single verity layer over a single loop device.
pub fn resolve(meta: &BlockMeta, device_name: &str) -> Result<ResolvedMount> {
    let device = meta.device(device_name);
    match device.kind() {
        DeviceKind::Loop => {
            let backing_file = device.property("loop/backing_file")?;
            Ok(ResolvedMount {
                device: device.dev_path(),
                backing_file: PathBuf::from(backing_file),
                mapper_name: String::new(),
            })
        }
        DeviceKind::Mapped => {
            let mapper_name = device.property("dm/name")?;
            let slaves = device.slaves();
            let loop_slave = slaves
                .iter()
                .find(|slave| slave.kind() == DeviceKind::Loop)
                .ok_or_else(|| CapsuleError::UnresolvableDevice {
                    device: device_name.to_string(),
                    reason: "mapped device with no loop device underneath".to_string(),
                })?;
            let backing_file = loop_slave.property("loop/backing_file")?;
            Ok(ResolvedMount {
                device: loop_slave.dev_path(),
                backing_file: PathBuf::from(backing_file),
                mapper_name,
            })
        }
        DeviceKind::Unknown => Err(CapsuleError::UnresolvableDevice {
            device: device_name.to_string(),
            reason: "unknown device type".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Build a synthetic /sys/block tree and return it with its meta.
    fn synthetic_meta(dir: &TempDir) -> BlockMeta {
        BlockMeta::new(dir.path().join("sys"), dir.path().join("dev"))
    }

    fn add_loop(dir: &TempDir, name: &str, backing: &str) {
        let loop_dir = dir.path().join("sys").join(name).join("loop");
        fs::create_dir_all(&loop_dir).unwrap();
        fs::write(loop_dir.join("backing_file"), format!("{backing}\n")).unwrap();
    }

    fn add_mapped(dir: &TempDir, name: &str, mapper: &str, slaves: &[&str]) {
        let sys = dir.path().join("sys").join(name);
        fs::create_dir_all(sys.join("dm")).unwrap();
        fs::write(sys.join("dm/name"), format!("{mapper}\n")).unwrap();
        fs::create_dir_all(sys.join("slaves")).unwrap();
        for slave in slaves {
            fs::create_dir_all(sys.join("slaves").join(slave)).unwrap();
        }
    }

    #[test]
    fn classifies_by_name() {
        let dir = TempDir::new().unwrap();
        let meta = synthetic_meta(&dir);
        assert_eq!(meta.device("loop7").kind(), DeviceKind::Loop);
        assert_eq!(meta.device("dm-2").kind(), DeviceKind::Mapped);
        assert_eq!(meta.device("sda1").kind(), DeviceKind::Unknown);
    }

    #[test]
    fn resolves_loop_device() {
        let dir = TempDir::new().unwrap();
        add_loop(&dir, "loop0", "/data/d.img");
        let meta = synthetic_meta(&dir);

        let resolved = resolve(&meta, "loop0").unwrap();
        assert_eq!(resolved.backing_file, PathBuf::from("/data/d.img"));
        assert_eq!(resolved.device, dir.path().join("dev/loop0"));
        assert!(resolved.mapper_name.is_empty());
    }

    #[test]
    fn resolves_mapped_device_through_loop_slave() {
        let dir = TempDir::new().unwrap();
        add_loop(&dir, "loop4", "/data/net.img");
        add_mapped(&dir, "dm-0", "capsule-com.net@3", &["loop4"]);
        let meta = synthetic_meta(&dir);

        let resolved = resolve(&meta, "dm-0").unwrap();
        assert_eq!(resolved.backing_file, PathBuf::from("/data/net.img"));
        assert_eq!(resolved.device, dir.path().join("dev/loop4"));
        assert_eq!(resolved.mapper_name, "capsule-com.net@3");
    }

    #[test]
    fn mapped_device_without_slaves_is_unresolvable() {
        let dir = TempDir::new().unwrap();
        add_mapped(&dir, "dm-1", "capsule-com.a@1", &[]);
        let meta = synthetic_meta(&dir);

        let err = resolve(&meta, "dm-1").unwrap_err();
        assert!(matches!(err, CapsuleError::UnresolvableDevice { .. }));
    }

    #[test]
    fn mapped_device_with_only_non_loop_slaves_is_unresolvable() {
        let dir = TempDir::new().unwrap();
        add_mapped(&dir, "dm-1", "capsule-com.a@1", &["sda2"]);
        let meta = synthetic_meta(&dir);

        let err = resolve(&meta, "dm-1").unwrap_err();
        assert!(matches!(err, CapsuleError::UnresolvableDevice { .. }));
    }

    #[test]
    fn unknown_device_is_unresolvable() {
        let dir = TempDir::new().unwrap();
        let meta = synthetic_meta(&dir);
        let err = resolve(&meta, "nvme0n1").unwrap_err();
        assert!(matches!(err, CapsuleError::UnresolvableDevice { .. }));
    }

    #[test]
    fn missing_backing_file_is_unresolvable() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sys/loop9")).unwrap();
        let meta = synthetic_meta(&dir);
        let err = resolve(&meta, "loop9").unwrap_err();
        assert!(matches!(err, CapsuleError::UnresolvableDevice { .. }));
    }
}
