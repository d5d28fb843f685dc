//! Persisted profile configuration.
//!
//! A single pretty-printed JSON file is the source of truth for the network
//! folder, the optional concurrency cap and every profile:
//!
//! ```json
//! {
//!   "network_folder": "/srv/scans",
//!   "core_cap": 8,
//!   "profiles": {
//!     "acme": {
//!       "JPEG": "/srv/scans/acme/JPEG",
//!       "TIFF": "/srv/scans/acme/TIFF",
//!       "COMPLETE": "/srv/scans/acme/COMPLETE",
//!       "status": "Active"
//!     }
//!   }
//! }
//! ```
//!
//! A missing file is replaced by an empty template. Every mutation is
//! written to a temporary sibling and renamed over the file before the
//! in-memory copy changes, so a failed write leaves both unchanged.

use crate::config::OutputKind;
use crate::error::HotfolderError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory receiving finished work.
pub const COMPLETE_DIR: &str = "COMPLETE";

/// Whether a profile's workers should run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    #[default]
    Active,
    Paused,
}

impl ProfileStatus {
    pub fn toggled(self) -> Self {
        match self {
            ProfileStatus::Active => ProfileStatus::Paused,
            ProfileStatus::Paused => ProfileStatus::Active,
        }
    }
}

/// One profile's directories and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    #[serde(rename = "JPEG")]
    pub jpeg_dir: PathBuf,
    #[serde(rename = "TIFF")]
    pub tiff_dir: PathBuf,
    #[serde(rename = "COMPLETE")]
    pub complete_dir: PathBuf,
    #[serde(default)]
    pub status: ProfileStatus,
}

impl ProfileRecord {
    fn under(root: &Path) -> Self {
        Self {
            jpeg_dir: root.join(OutputKind::Jpeg.dir_name()),
            tiff_dir: root.join(OutputKind::Tiff.dir_name()),
            complete_dir: root.join(COMPLETE_DIR),
            status: ProfileStatus::Active,
        }
    }

    /// Watch root for `kind`.
    pub fn watch_dir(&self, kind: OutputKind) -> &Path {
        match kind {
            OutputKind::Jpeg => &self.jpeg_dir,
            OutputKind::Tiff => &self.tiff_dir,
        }
    }

    fn dirs(&self) -> [&Path; 3] {
        [&self.jpeg_dir, &self.tiff_dir, &self.complete_dir]
    }
}

/// On-disk layout of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(default)]
    pub network_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_cap: Option<usize>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileRecord>,
}

/// Read/write access to the persisted configuration.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    data: PersistedConfig,
}

impl ProfileStore {
    /// Open `path`, writing an empty template first if it does not exist.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, HotfolderError> {
        let path = path.into();
        let read_err = |source| HotfolderError::ConfigRead {
            path: path.clone(),
            source,
        };

        let data = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(serde_json::from_str(&text).map_err(|source| {
                HotfolderError::ConfigParse {
                    path: path.clone(),
                    source,
                }
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(read_err(e)),
        };

        match data {
            Some(data) => {
                debug!("Loaded configuration from {}", path.display());
                Ok(Self { path, data })
            }
            None => {
                info!("Creating configuration template at {}", path.display());
                let data = PersistedConfig::default();
                write_atomic(&path, &data)?;
                Ok(Self { path, data })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &PersistedConfig {
        &self.data
    }

    pub fn network_folder(&self) -> Option<&Path> {
        self.data.network_folder.as_deref()
    }

    pub fn core_cap(&self) -> Option<usize> {
        self.data.core_cap
    }

    pub fn profiles(&self) -> &BTreeMap<String, ProfileRecord> {
        &self.data.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileRecord> {
        self.data.profiles.get(name)
    }

    /// Choose the folder new profiles are created in. Existing profiles keep
    /// their directories.
    pub fn set_network_folder(&mut self, folder: impl Into<PathBuf>) -> Result<(), HotfolderError> {
        let folder = folder.into();
        fs::create_dir_all(&folder).map_err(|source| HotfolderError::ProfileDirectory {
            path: folder.clone(),
            source,
        })?;
        let mut next = self.data.clone();
        next.network_folder = Some(folder);
        self.commit(next)
    }

    /// Persist the concurrency cap; `None` falls back to host parallelism.
    pub fn set_core_cap(&mut self, cap: Option<usize>) -> Result<(), HotfolderError> {
        let mut next = self.data.clone();
        next.core_cap = cap;
        self.commit(next)
    }

    /// Create `<network>/<name>/{JPEG,TIFF,COMPLETE}` and record the profile
    /// as active.
    pub fn add_profile(&mut self, name: &str) -> Result<ProfileRecord, HotfolderError> {
        validate_name(name)?;
        if self.data.profiles.contains_key(name) {
            return Err(HotfolderError::DuplicateProfile { name: name.into() });
        }
        let network = self
            .data
            .network_folder
            .clone()
            .ok_or(HotfolderError::NetworkFolderUnset)?;

        let root = network.join(name);
        let record = ProfileRecord::under(&root);
        // Roll back only what this call creates.
        let mut created: Vec<PathBuf> = Vec::new();
        for dir in std::iter::once(root.as_path()).chain(record.dirs()) {
            if dir.is_dir() {
                continue;
            }
            if let Err(source) = fs::create_dir_all(dir) {
                remove_created(&created);
                return Err(HotfolderError::ProfileDirectory {
                    path: dir.to_path_buf(),
                    source,
                });
            }
            created.push(dir.to_path_buf());
        }

        let mut next = self.data.clone();
        next.profiles.insert(name.to_string(), record.clone());
        if let Err(e) = self.commit(next) {
            remove_created(&created);
            return Err(e);
        }
        info!("Added profile '{}'", name);
        Ok(record)
    }

    /// Forget `name` and delete its directories. Absent names are a no-op.
    ///
    /// Directory removal is best effort; the entry is removed regardless.
    pub fn remove_profile(&mut self, name: &str) -> Result<Option<ProfileRecord>, HotfolderError> {
        let Some(record) = self.data.profiles.get(name).cloned() else {
            debug!("Profile '{}' not present, nothing to remove", name);
            return Ok(None);
        };
        let mut next = self.data.clone();
        next.profiles.remove(name);
        self.commit(next)?;
        remove_dirs(&record);
        info!("Removed profile '{}'", name);
        Ok(Some(record))
    }

    /// Set a profile's status. Returns whether anything changed.
    pub fn set_status(&mut self, name: &str, status: ProfileStatus) -> Result<bool, HotfolderError> {
        let current = self
            .data
            .profiles
            .get(name)
            .ok_or_else(|| HotfolderError::UnknownProfile { name: name.into() })?;
        if current.status == status {
            return Ok(false);
        }
        let mut next = self.data.clone();
        if let Some(record) = next.profiles.get_mut(name) {
            record.status = status;
        }
        self.commit(next)?;
        Ok(true)
    }

    fn commit(&mut self, next: PersistedConfig) -> Result<(), HotfolderError> {
        write_atomic(&self.path, &next)?;
        self.data = next;
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &PersistedConfig) -> Result<(), HotfolderError> {
    let write_err = |source| HotfolderError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    serde_json::to_writer_pretty(&mut tmp, data)
        .map_err(|e| write_err(std::io::Error::other(e)))?;
    tmp.write_all(b"\n").map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Undo directory creation, newest first. Non-recursive, so anything
/// written into them meanwhile survives.
fn remove_created(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not roll back {}: {}", dir.display(), e),
        }
    }
}

fn remove_dirs(record: &ProfileRecord) {
    for dir in record.dirs() {
        match fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete {}: {}", dir.display(), e),
        }
    }
    if let Some(root) = record.complete_dir.parent() {
        // Only succeeds once the profile folder is empty.
        let _ = fs::remove_dir(root);
    }
}

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

fn validate_name(name: &str) -> Result<(), HotfolderError> {
    let invalid = |reason: &str| {
        Err(HotfolderError::InvalidProfileName {
            name: name.into(),
            reason: reason.into(),
        })
    };
    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if name.trim() != name {
        return invalid("leading or trailing whitespace");
    }
    if name == "." || name == ".." {
        return invalid("reserved name");
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN.contains(c) || c.is_control()) {
        return invalid(&format!("character {:?} is not allowed", c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_network(dir: &Path) -> ProfileStore {
        let mut store = ProfileStore::load_or_create(dir.join("config.json")).unwrap();
        store.set_network_folder(dir.join("network")).unwrap();
        store
    }

    #[test]
    fn missing_file_becomes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = ProfileStore::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(store.profiles().is_empty());
        assert_eq!(store.network_folder(), None);

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("core_cap"));
    }

    #[test]
    fn add_profile_creates_layout_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        let record = store.add_profile("acme").unwrap();

        let root = dir.path().join("network").join("acme");
        assert_eq!(record.jpeg_dir, root.join("JPEG"));
        assert!(root.join("JPEG").is_dir());
        assert!(root.join("TIFF").is_dir());
        assert!(root.join("COMPLETE").is_dir());
        assert_eq!(record.status, ProfileStatus::Active);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["profiles"]["acme"]["status"], "Active");
        assert!(raw["profiles"]["acme"]["COMPLETE"].is_string());

        let reloaded = ProfileStore::load_or_create(store.path()).unwrap();
        assert_eq!(reloaded.data(), store.data());
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        store.add_profile("acme").unwrap();
        assert!(matches!(
            store.add_profile("acme"),
            Err(HotfolderError::DuplicateProfile { .. })
        ));
        for bad in ["", " acme", "..", "a/b", "x:y"] {
            assert!(
                matches!(
                    store.add_profile(bad),
                    Err(HotfolderError::InvalidProfileName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn add_requires_network_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load_or_create(dir.path().join("c.json")).unwrap();
        assert!(matches!(
            store.add_profile("acme"),
            Err(HotfolderError::NetworkFolderUnset)
        ));
    }

    #[test]
    fn remove_deletes_directories_and_is_noop_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        store.add_profile("acme").unwrap();
        fs::write(dir.path().join("network/acme/COMPLETE/x.jpg"), b"x").unwrap();

        assert!(store.remove_profile("acme").unwrap().is_some());
        assert!(!dir.path().join("network").join("acme").exists());
        assert!(store.profile("acme").is_none());
        assert!(store.remove_profile("acme").unwrap().is_none());
    }

    #[test]
    fn failed_persist_keeps_existing_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        let leftover = dir.path().join("network/acme/COMPLETE");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("delivered.jpg"), b"x").unwrap();

        // A directory where the file should be makes the rename fail.
        fs::remove_file(store.path()).unwrap();
        fs::create_dir(store.path()).unwrap();

        assert!(matches!(
            store.add_profile("acme"),
            Err(HotfolderError::ConfigWrite { .. })
        ));
        assert!(leftover.join("delivered.jpg").is_file());
        assert!(!dir.path().join("network/acme/JPEG").exists());
        assert!(!dir.path().join("network/acme/TIFF").exists());
        assert!(store.profile("acme").is_none());
    }

    #[test]
    fn failed_directory_creation_removes_only_new_folders() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        let root = dir.path().join("network/beta");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("TIFF"), b"in the way").unwrap();

        assert!(matches!(
            store.add_profile("beta"),
            Err(HotfolderError::ProfileDirectory { .. })
        ));
        assert!(root.is_dir());
        assert!(root.join("TIFF").is_file());
        assert!(!root.join("JPEG").exists());
        assert!(!root.join("COMPLETE").exists());

        // A fresh name leaves nothing behind when persisting fails.
        fs::remove_file(store.path()).unwrap();
        fs::create_dir(store.path()).unwrap();
        assert!(store.add_profile("gamma").is_err());
        assert!(!dir.path().join("network/gamma").exists());
    }

    #[test]
    fn status_changes_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        store.add_profile("acme").unwrap();

        assert!(store.set_status("acme", ProfileStatus::Paused).unwrap());
        assert!(!store.set_status("acme", ProfileStatus::Paused).unwrap());
        assert!(matches!(
            store.set_status("ghost", ProfileStatus::Paused),
            Err(HotfolderError::UnknownProfile { .. })
        ));

        let reloaded = ProfileStore::load_or_create(store.path()).unwrap();
        assert_eq!(reloaded.profile("acme").unwrap().status, ProfileStatus::Paused);
        assert_eq!(ProfileStatus::Paused.toggled(), ProfileStatus::Active);
    }

    #[test]
    fn core_cap_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_network(dir.path());
        store.set_core_cap(Some(3)).unwrap();
        let reloaded = ProfileStore::load_or_create(store.path()).unwrap();
        assert_eq!(reloaded.core_cap(), Some(3));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ProfileStore::load_or_create(&path),
            Err(HotfolderError::ConfigParse { .. })
        ));
    }
}
