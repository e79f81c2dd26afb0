//! pkr root discovery and on-disk folder names

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Folder holding environment definitions
pub const ENV_FOLDER: &str = "env";

/// Folder holding kards
pub const KARD_FOLDER: &str = "kard";

/// Environment definition file inside `env/<name>/`
pub const ENV_FILE: &str = "env.yml";

/// A directory containing `env/<name>/env.yml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkrRoot {
    path: PathBuf,
}

impl PkrRoot {
    /// Walk up from `start` until a usable pkr root is found
    pub fn discover<P: AsRef<Path>>(start: P) -> Result<Self> {
        let start = absolute(start.as_ref())?;

        for candidate in start.ancestors() {
            if Self::is_pkr_root(candidate) {
                tracing::debug!(root = %candidate.display(), "found pkr root");
                return Ok(Self {
                    path: candidate.to_path_buf(),
                });
            }
        }

        Err(CoreError::RootNotFound { path: start })
    }

    /// Use `path` as the root without checking it
    pub fn at<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Whether `path` has at least one `env/*/env.yml`
    pub fn is_pkr_root(path: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(path.join(ENV_FOLDER)) else {
            return false;
        };
        entries
            .filter_map(|e| e.ok())
            .any(|e| e.path().join(ENV_FILE).is_file())
    }

    /// Create the base tree: `env/dev/env.yml` and `kard/`
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = absolute(path.as_ref())?;
        let dev = path.join(ENV_FOLDER).join("dev");
        std::fs::create_dir_all(&dev)?;

        let env_file = dev.join(ENV_FILE);
        if !env_file.exists() {
            std::fs::write(&env_file, "")?;
        }
        std::fs::create_dir_all(path.join(KARD_FOLDER))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env_dir(&self) -> PathBuf {
        self.path.join(ENV_FOLDER)
    }

    pub fn kard_dir(&self) -> PathBuf {
        self.path.join(KARD_FOLDER)
    }

    /// Resolve a root-relative path; absolute paths are returned unchanged
    pub fn resolve<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.path.join(rel)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
