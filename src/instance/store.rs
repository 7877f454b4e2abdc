//! Persisted instance records
//!
//! One YAML file per instance, `<id>.<autostart|manual>.yaml`, holding the
//! canonical flat string mapping of its configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SkymountError};

const AUTOSTART: &str = "autostart";
const MANUAL: &str = "manual";
const EXTENSION: &str = "yaml";

/// A record read back from disk
#[derive(Debug, Clone)]
pub struct PersistedInstance {
    pub id: String,
    pub values: BTreeMap<String, String>,
    pub autostart: bool,
}

pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, id: &str, autostart: bool) -> PathBuf {
        let flag = if autostart { AUTOSTART } else { MANUAL };
        self.dir.join(format!("{}.{}.{}", id, flag, EXTENSION))
    }

    /// Split `<id>.<flag>.yaml` into (id, autostart)
    fn parse_file_name(name: &str) -> Option<(String, bool)> {
        let stem = name.strip_suffix(".yaml")?;
        let (id, flag) = stem.rsplit_once('.')?;
        if id.is_empty() {
            return None;
        }
        match flag {
            AUTOSTART => Some((id.to_string(), true)),
            MANUAL => Some((id.to_string(), false)),
            _ => None,
        }
    }

    /// Write the record, replacing any copy saved under the other flag
    pub fn save(&self, id: &str, values: &BTreeMap<String, String>, autostart: bool) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SkymountError::io(&self.dir, e))?;

        let content = serde_yaml::to_string(values)
            .map_err(|e| SkymountError::Other(format!("Failed to serialize instance: {}", e)))?;
        let path = self.file_for(id, autostart);
        std::fs::write(&path, content).map_err(|e| SkymountError::io(&path, e))?;

        let stale = self.file_for(id, !autostart);
        if stale.exists() {
            std::fs::remove_file(&stale).map_err(|e| SkymountError::io(&stale, e))?;
        }

        debug!("Saved instance {} to {:?}", id, path);
        Ok(())
    }

    /// All readable records; unreadable files are skipped with a warning
    pub fn load_all(&self) -> Result<Vec<PersistedInstance>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SkymountError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, autostart)) = Self::parse_file_name(&name) else {
                continue;
            };
            match Self::read_values(&entry.path()) {
                Ok(values) => records.push(PersistedInstance {
                    id,
                    values,
                    autostart,
                }),
                Err(e) => warn!("Skipping unreadable instance record {:?}: {}", name, e),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub fn load(&self, id: &str) -> Result<Option<PersistedInstance>> {
        for autostart in [true, false] {
            let path = self.file_for(id, autostart);
            if path.exists() {
                return Ok(Some(PersistedInstance {
                    id: id.to_string(),
                    values: Self::read_values(&path)?,
                    autostart,
                }));
            }
        }
        Ok(None)
    }

    /// Remove every copy of the record; returns whether one existed
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut removed = false;
        for autostart in [true, false] {
            let path = self.file_for(id, autostart);
            match std::fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SkymountError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    pub fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.load_all()?.into_iter().map(|r| r.id).collect())
    }

    fn read_values(path: &Path) -> Result<BTreeMap<String, String>> {
        let content = std::fs::read_to_string(path).map_err(|e| SkymountError::io(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| {
            SkymountError::CorruptedConfig(format!("{}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn values() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("backend_kind".to_string(), "local".to_string()),
            ("root".to_string(), "/srv".to_string()),
        ])
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            InstanceStore::parse_file_name("abc.autostart.yaml"),
            Some(("abc".to_string(), true))
        );
        assert_eq!(
            InstanceStore::parse_file_name("abc.manual.yaml"),
            Some(("abc".to_string(), false))
        );
        assert_eq!(InstanceStore::parse_file_name("abc.yaml"), None);
        assert_eq!(InstanceStore::parse_file_name("abc.other.yaml"), None);
        assert_eq!(InstanceStore::parse_file_name(".manual.yaml"), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path().join("state"));

        store.save("abc", &values(), false).unwrap();
        assert!(dir.path().join("state/abc.manual.yaml").exists());

        let record = store.load("abc").unwrap().unwrap();
        assert!(!record.autostart);
        assert_eq!(record.values, values());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_switches_flag() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save("abc", &values(), false).unwrap();
        store.save("abc", &values(), true).unwrap();

        assert!(!dir.path().join("abc.manual.yaml").exists());
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].autostart);
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save("b", &values(), true).unwrap();
        store.save("a", &values(), false).unwrap();
        std::fs::write(dir.path().join("c.manual.yaml"), "- not\n- a map\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        assert_eq!(store.list_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());

        store.save("abc", &values(), true).unwrap();
        assert!(store.remove("abc").unwrap());
        assert!(!store.remove("abc").unwrap());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }
}
