//! CLI commands

pub mod deploy;
pub mod image;
pub mod init;
pub mod kard;
pub mod listext;

use pkr_core::PkrRoot;
use pkr_driver::{Lifecycle, Registry};
use std::path::PathBuf;

use crate::error::Result;

/// Options shared by every command
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub pkr_path: Option<PathBuf>,
    pub kard: Option<String>,
    pub quiet: bool,
}

/// The pkr tree a command runs in, with the plugins it can use
pub struct Session {
    root: PkrRoot,
    registry: Registry,
    kard: Option<String>,
    quiet: bool,
}

impl Session {
    /// Find the pkr root from `--pkr-path`, or from the working directory
    pub fn open(globals: &Globals) -> Result<Self> {
        let start = match &globals.pkr_path {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        let root = PkrRoot::discover(&start)?;
        tracing::debug!(root = %root.path().display(), "using pkr root");
        Ok(Self {
            root,
            registry: Registry::builtin(),
            kard: globals.kard.clone().filter(|name| !name.is_empty()),
            quiet: globals.quiet,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(self.root.clone(), &self.registry)
    }

    /// `--kard`, else the current kard
    pub fn kard(&self, lifecycle: &Lifecycle<'_>) -> Result<String> {
        match &self.kard {
            Some(name) => Ok(name.clone()),
            None => Ok(lifecycle.current()?),
        }
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }
}
