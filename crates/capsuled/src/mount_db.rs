//! Registry of mounted capsule instances.
//!
//! One record per mounted instance, grouped by package name. Per name at
//! most one record is active: the instance published at the canonical,
//! version-less mount point. All the others are reachable only through
//! their version-qualified paths (kept for rollback).
//!
//! The database is rebuilt from the live mount table at startup and is
//! owned by the daemon context; after startup only the activation engine
//! mutates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use capsule_common::image::parse_image_id;
use tracing::{info, warn};

use crate::block::{self, BlockMeta};

/// One mounted capsule instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Block device the mount reads from.
    pub device: PathBuf,
    /// Capsule image file behind the device.
    pub backing_file: PathBuf,
    /// Version-qualified mount point.
    pub mount_point: PathBuf,
    /// dm mapping name; empty for plain loop mounts.
    pub mapper_name: String,
}

#[derive(Debug, Clone)]
struct Entry {
    record: MountRecord,
    active: bool,
}

/// In-memory registry of every mounted capsule instance.
#[derive(Debug, Default)]
pub struct MountedCapsuleDb {
    entries: BTreeMap<String, Vec<Entry>>,
}

impl MountedCapsuleDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. When `active` is set, any previously active
    /// instance of the same name is demoted first.
    pub fn add(&mut self, name: &str, active: bool, record: MountRecord) {
        let entries = self.entries.entry(name.to_string()).or_default();
        if active {
            for entry in entries.iter_mut() {
                entry.active = false;
            }
        }
        entries.push(Entry { record, active });
    }

    /// Flag the instance at `mount_point` as the active one for `name`,
    /// demoting all others. Returns false when no such instance exists.
    pub fn set_active(&mut self, name: &str, mount_point: &Path) -> bool {
        let Some(entries) = self.entries.get_mut(name) else {
            return false;
        };
        if !entries.iter().any(|e| e.record.mount_point == mount_point) {
            return false;
        }
        for entry in entries.iter_mut() {
            entry.active = entry.record.mount_point == mount_point;
        }
        true
    }

    pub fn records_for(&self, name: &str) -> Vec<&MountRecord> {
        self.entries
            .get(name)
            .map(|entries| entries.iter().map(|e| &e.record).collect())
            .unwrap_or_default()
    }

    pub fn active_record(&self, name: &str) -> Option<&MountRecord> {
        self.entries
            .get(name)?
            .iter()
            .find(|e| e.active)
            .map(|e| &e.record)
    }

    /// Look up the record mounted at `mount_point`, with its owning
    /// package name and active flag.
    pub fn record_at(&self, mount_point: &Path) -> Option<(&str, &MountRecord, bool)> {
        for (name, entries) in &self.entries {
            if let Some(entry) = entries.iter().find(|e| e.record.mount_point == mount_point) {
                return Some((name.as_str(), &entry.record, entry.active));
            }
        }
        None
    }

    /// Remove the record mounted at `mount_point`.
    pub fn remove(&mut self, mount_point: &Path) -> Option<MountRecord> {
        let mut removed = None;
        for entries in self.entries.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.record.mount_point == mount_point) {
                removed = Some(entries.remove(pos).record);
                break;
            }
        }
        self.entries.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// All active instances, `(name, record)` per package.
    pub fn active_instances(&self) -> Vec<(&str, &MountRecord)> {
        self.entries
            .iter()
            .filter_map(|(name, entries)| {
                entries
                    .iter()
                    .find(|e| e.active)
                    .map(|e| (name.as_str(), &e.record))
            })
            .collect()
    }

    /// Total number of mounted instances.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the registry from the live mount table.
    ///
    /// Keeps only mounts directly under `capsule_root`; entries at the
    /// canonical path are bind mounts of an instance that is (or will
    /// be) recorded through its version-qualified path, so they are
    /// skipped. The highest version seen per package is flagged active -
    /// a fallback inference for when no session records exist, e.g.
    /// after an out-of-band remount. Unresolvable mounts are logged and
    /// skipped; one bad mount must not hide the rest.
    ///
    /// Returns the number of records restored.
    pub fn populate_from_mounts(
        &mut self,
        mounts: &str,
        meta: &BlockMeta,
        capsule_root: &Path,
    ) -> usize {
        info!("Populating capsule database from mounts");

        let mut highest: BTreeMap<String, (u64, PathBuf)> = BTreeMap::new();
        let mut restored = 0;

        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };
            let mount_point = PathBuf::from(mount_point);
            if mount_point.parent() != Some(capsule_root) {
                continue;
            }

            let Some(mount_name) = mount_point.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !mount_name.contains('@') {
                // Canonical path: a bind mount of a versioned instance.
                continue;
            }
            let Some((name, version)) = parse_image_id(mount_name) else {
                warn!("Skipping {}: malformed instance name", mount_point.display());
                continue;
            };

            let device_name = Path::new(source)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(source);
            let resolved = match block::resolve(meta, device_name) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("Cannot resolve mount {}: {}", mount_point.display(), e);
                    continue;
                }
            };

            info!("Found {}", mount_point.display());
            self.add(
                &name,
                false,
                MountRecord {
                    device: resolved.device,
                    backing_file: resolved.backing_file,
                    mount_point: mount_point.clone(),
                    mapper_name: resolved.mapper_name,
                },
            );
            restored += 1;

            match highest.get(&name) {
                Some((v, _)) if *v >= version => {}
                _ => {
                    highest.insert(name, (version, mount_point));
                }
            }
        }

        for (name, (_, mount_point)) in &highest {
            self.set_active(name, mount_point);
        }

        info!("{} capsule instances restored", restored);
        restored
    }
}
