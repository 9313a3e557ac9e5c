//! Archive side metadata
//!
//! Every mod archive id has an `archive-<id>.json` file next to its index
//! part. Archives without one are base game archives.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Enable flag and priority fields of one archive id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetaData {
    /// Location of the side file
    #[serde(skip)]
    path: PathBuf,

    /// Disabled archives stay loaded but are excluded from the overlay
    pub enabled: bool,

    /// Primary priority key, higher versions override lower ones
    #[serde(default)]
    pub version: u32,

    /// Required archives sort after non-required ones of equal version
    #[serde(default)]
    pub required: bool,

    /// Package the archive was installed from
    #[serde(default)]
    pub package_id: u32,

    /// Chunk of that package
    #[serde(default)]
    pub chunk_id: u32,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ArchiveMetaData {
    /// Enabled metadata for archive `id` in `folder`, not yet saved
    pub fn new(folder: &Path, id: u32) -> Self {
        Self {
            path: Self::path_for(folder, id),
            enabled: true,
            version: 0,
            required: false,
            package_id: 0,
            chunk_id: 0,
            name: None,
        }
    }

    /// Side file path of archive `id`
    pub fn path_for(folder: &Path, id: u32) -> PathBuf {
        folder.join(format!("archive-{id}.json"))
    }

    /// Load the side file, `None` if it does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        let mut metadata: Self = serde_json::from_slice(&data)?;
        metadata.path = path.to_path_buf();
        debug!(
            "loaded archive metadata from {} (enabled={}, version={})",
            path.display(),
            metadata.enabled,
            metadata.version
        );
        Ok(Some(metadata))
    }

    /// Write the side file
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    /// Remove the side file if present
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Side file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point this metadata at archive `id` in `folder`
    #[must_use]
    pub fn for_archive(mut self, folder: &Path, id: u32) -> Self {
        self.path = Self::path_for(folder, id);
        self
    }

    /// Set the version
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the required flag
    #[must_use]
    pub const fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Set package and chunk ids
    #[must_use]
    pub const fn with_package(mut self, package_id: u32, chunk_id: u32) -> Self {
        self.package_id = package_id;
        self.chunk_id = chunk_id;
        self
    }

    /// Set the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let metadata = ArchiveMetaData::new(dir.path(), 12)
            .with_version(3)
            .with_required(true)
            .with_package(7, 1)
            .with_name("Outfit pack");
        metadata.save().unwrap();

        let path = ArchiveMetaData::path_for(dir.path(), 12);
        assert!(path.ends_with("archive-12.json"));
        let loaded = ArchiveMetaData::load(&path).unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.path(), path);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(ArchiveMetaData::load(&dir.path().join("archive-1.json")).unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let metadata = ArchiveMetaData::new(dir.path(), 4);
        metadata.save().unwrap();
        metadata.delete().unwrap();
        metadata.delete().unwrap();
        assert!(!metadata.path().exists());
    }

    #[test]
    fn defaults_for_sparse_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive-9.json");
        std::fs::write(&path, br#"{"enabled": false}"#).unwrap();
        let loaded = ArchiveMetaData::load(&path).unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.name, None);
    }
}
