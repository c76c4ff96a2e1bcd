//! The manifest is the only plaintext file in the sync repository. It records
//! modification times, nothing else.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::tmp_sibling;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileEntry {
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    pub last_sync: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_sync: Utc::now(),
            files: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Path of the manifest inside `sync_dir`.
    pub fn path(sync_dir: &Path) -> PathBuf {
        sync_dir.join(MANIFEST_FILE)
    }

    /// Read the manifest; `None` before the first write.
    pub fn load(sync_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(sync_dir);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, sync_dir: &Path) -> Result<()> {
        let path = Self::path(sync_dir);
        fs::create_dir_all(sync_dir)?;
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');

        let tmp_path = tmp_sibling(&path);
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Record a write of `filename` and bump `lastSync`.
    pub fn touch(&mut self, filename: &str) {
        let now = Utc::now();
        self.files
            .insert(filename.to_string(), FileEntry { last_modified: now });
        self.last_sync = now;
    }

    pub fn forget(&mut self, filename: &str) -> bool {
        let removed = self.files.remove(filename).is_some();
        if removed {
            self.last_sync = Utc::now();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_manifest_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(Manifest::load(temp.path()).unwrap().is_none());

        fs::write(Manifest::path(temp.path()), "  \n").unwrap();
        assert!(Manifest::load(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_touch_updates_entry_and_last_sync() {
        let mut manifest = Manifest::default();
        let before = manifest.last_sync;

        manifest.touch("projects.age");

        let entry = &manifest.files["projects.age"];
        assert!(entry.last_modified >= before);
        assert_eq!(manifest.last_sync, entry.last_modified);
    }

    #[test]
    fn test_saved_keys_are_exactly_the_documented_ones() {
        let temp = TempDir::new().unwrap();
        let mut manifest = Manifest::default();
        manifest.touch("env.age");
        manifest.save(temp.path()).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(Manifest::path(temp.path())).unwrap()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["files", "lastSync", "version"]);
        assert!(value["files"]["env.age"]["lastModified"].is_string());

        let loaded = Manifest::load(temp.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_forget() {
        let mut manifest = Manifest::default();
        manifest.touch("docker.age");

        assert!(manifest.forget("docker.age"));
        assert!(!manifest.forget("docker.age"));
        assert!(manifest.files.is_empty());
    }
}
