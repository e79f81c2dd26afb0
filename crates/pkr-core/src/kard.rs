//! Kard records and their on-disk store
//!
//! Layout of `kard/<name>/`:
//! - `meta.yml`: resolved meta snapshot
//! - `features`: one feature name per line
//! - `driver`: canonical driver name
//! - `kard.yml`: the kard record (inputs, status, timestamps)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::meta::Meta;

pub const META_FILE: &str = "meta.yml";
pub const FEATURES_FILE: &str = "features";
pub const DRIVER_FILE: &str = "driver";
pub const RECORD_FILE: &str = "kard.yml";

/// Symlink pointing to the current kard
pub const CURRENT_LINK: &str = "current";

/// Lifecycle position of a kard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KardStatus {
    #[default]
    Created,
    Rendered,
    Built,
    Deployed,
}

impl std::fmt::Display for KardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Rendered => "rendered",
            Self::Built => "built",
            Self::Deployed => "deployed",
        };
        write!(f, "{}", s)
    }
}

/// Inputs a kard was created from, and where it stands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KardRecord {
    pub name: String,

    /// Environment the kard was created from
    pub env: String,

    /// Driver requested on the command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    /// `--extra` overrides
    #[serde(default = "empty_mapping")]
    pub extra: JsonValue,

    /// Content of `--meta` files
    #[serde(default = "empty_mapping")]
    pub meta_file: JsonValue,

    /// `--features` given on the command line
    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub status: KardStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_mapping() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

impl KardRecord {
    pub fn new(name: impl Into<String>, env: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            env: env.into(),
            driver: None,
            extra: empty_mapping(),
            meta_file: empty_mapping(),
            features: Vec::new(),
            status: KardStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Everything persisted for one kard
#[derive(Debug, Clone, PartialEq)]
pub struct StoredKard {
    pub record: KardRecord,
    pub meta: Meta,
    pub features: Vec<String>,
    pub driver: String,
}

/// File store rooted at `<pkr_root>/kard`
#[derive(Debug, Clone)]
pub struct KardStore {
    base_dir: PathBuf,
}

impl KardStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of a kard
    pub fn path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).join(RECORD_FILE).is_file()
    }

    pub fn validate_name(name: &str) -> Result<()> {
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name == CURRENT_LINK {
            Some("'current' is reserved")
        } else if name.contains('/') || name.contains('\\') {
            Some("name must not contain path separators")
        } else if name.starts_with('.') {
            Some("name must not start with '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(CoreError::InvalidKardName {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Create the directory of a new kard
    pub fn create_dir(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        let path = self.path(name);
        if path.exists() {
            return Err(CoreError::KardExists {
                name: name.to_string(),
            });
        }
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove a kard directory and everything in it
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Names of all kards, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(RECORD_FILE).is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n != CURRENT_LINK)
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<StoredKard> {
        let dir = self.path(name);
        if !dir.join(RECORD_FILE).is_file() {
            return Err(CoreError::KardNotFound {
                name: name.to_string(),
            });
        }

        let record: KardRecord = serde_yaml::from_str(&read(&dir.join(RECORD_FILE))?)?;
        let meta = Meta::from_yaml(&read(&dir.join(META_FILE))?)?;
        let features = read(&dir.join(FEATURES_FILE))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let driver = read(&dir.join(DRIVER_FILE))?.trim().to_string();

        Ok(StoredKard {
            record,
            meta,
            features,
            driver,
        })
    }

    /// Persist every file of a kard
    ///
    /// All files are serialized before anything touches the disk, and each
    /// one is written to a temporary sibling then renamed into place.
    pub fn save(&self, kard: &StoredKard) -> Result<()> {
        let dir = self.path(&kard.record.name);
        std::fs::create_dir_all(&dir)?;

        let mut features = kard.features.join("\n");
        if !features.is_empty() {
            features.push('\n');
        }
        let files = [
            (META_FILE, kard.meta.to_yaml()?),
            (FEATURES_FILE, features),
            (DRIVER_FILE, format!("{}\n", kard.driver)),
            (RECORD_FILE, serde_yaml::to_string(&kard.record)?),
        ];

        for (name, content) in &files {
            write_atomic(&dir.join(name), content.as_bytes())?;
        }

        tracing::debug!(kard = %kard.record.name, "saved kard");
        Ok(())
    }

    /// Update only the status of a stored kard
    pub fn set_status(&self, name: &str, status: KardStatus) -> Result<()> {
        let path = self.path(name).join(RECORD_FILE);
        let mut record: KardRecord = serde_yaml::from_str(&read(&path)?)?;
        record.status = status;
        record.updated_at = Utc::now();
        write_atomic(&path, serde_yaml::to_string(&record)?.as_bytes())
    }

    /// Name of the kard `current` points to
    pub fn current(&self) -> Result<String> {
        let link = self.base_dir.join(CURRENT_LINK);
        let target = std::fs::read_link(&link).map_err(|_| CoreError::NoCurrentKard)?;
        target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or(CoreError::NoCurrentKard)
    }

    /// Point `current` at a kard
    pub fn set_current(&self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Err(CoreError::KardNotFound {
                name: name.to_string(),
            });
        }
        let link = self.base_dir.join(CURRENT_LINK);
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        symlink(Path::new(name), &link)?;
        Ok(())
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| CoreError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Write through a temporary sibling and rename
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn stored(name: &str) -> StoredKard {
        let mut record = KardRecord::new(name, "dev");
        record.extra = json!({"tag": "1.0"});
        record.features = vec!["git".to_string()];
        StoredKard {
            record,
            meta: Meta::from(json!({"tag": "1.0", "driver": {"name": "compose"}})),
            features: vec!["auto_volume".to_string(), "git".to_string()],
            driver: "compose".to_string(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        let kard = stored("test");

        store.save(&kard).unwrap();

        let path = store.path("test");
        assert!(path.join(META_FILE).is_file());
        assert_eq!(
            std::fs::read_to_string(path.join(FEATURES_FILE)).unwrap(),
            "auto_volume\ngit\n"
        );
        assert_eq!(
            std::fs::read_to_string(path.join(DRIVER_FILE)).unwrap(),
            "compose\n"
        );

        let loaded = store.load("test").unwrap();
        assert_eq!(loaded, kard);
    }

    #[test]
    fn test_no_temporary_files_left() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        store.save(&stored("test")).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(store.path("test"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_list_and_current() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        store.save(&stored("beta")).unwrap();
        store.save(&stored("alpha")).unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-kard")).unwrap();

        store.set_current("beta").unwrap();
        assert_eq!(store.current().unwrap(), "beta");
        store.set_current("alpha").unwrap();
        assert_eq!(store.current().unwrap(), "alpha");

        assert_eq!(store.list().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_missing_kard() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        assert!(matches!(
            store.load("ghost"),
            Err(CoreError::KardNotFound { .. })
        ));
        assert!(matches!(
            store.set_current("ghost"),
            Err(CoreError::KardNotFound { .. })
        ));
        assert!(matches!(store.current(), Err(CoreError::NoCurrentKard)));
        assert_eq!(store.list().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_create_dir_rejects_existing_and_reserved() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        store.create_dir("one").unwrap();

        assert!(matches!(
            store.create_dir("one"),
            Err(CoreError::KardExists { .. })
        ));
        assert!(matches!(
            store.create_dir("current"),
            Err(CoreError::InvalidKardName { .. })
        ));
        assert!(matches!(
            store.create_dir("a/b"),
            Err(CoreError::InvalidKardName { .. })
        ));
    }

    #[test]
    fn test_set_status() {
        let dir = TempDir::new().unwrap();
        let store = KardStore::new(dir.path());
        store.save(&stored("test")).unwrap();

        store.set_status("test", KardStatus::Built).unwrap();
        let loaded = store.load("test").unwrap();
        assert_eq!(loaded.record.status, KardStatus::Built);
        assert_eq!(loaded.record.status.to_string(), "built");
    }
}
