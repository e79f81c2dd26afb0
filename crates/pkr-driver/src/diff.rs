//! Comparison of deployed files with the ones about to be applied

use similar::TextDiff;

use crate::cluster::DeployedFiles;

/// How one file changes between two deployments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added { name: String },
    Modified { name: String, diff: String },
    Unchanged { name: String },
    Removed { name: String },
}

impl FileChange {
    pub fn name(&self) -> &str {
        match self {
            FileChange::Added { name }
            | FileChange::Modified { name, .. }
            | FileChange::Unchanged { name }
            | FileChange::Removed { name } => name,
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, FileChange::Unchanged { .. })
    }
}

/// Unified diff with three lines of context
pub fn unified_diff(name: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{name}"), &format!("b/{name}"))
        .to_string()
}

/// Per-file changes, in file name order, removals last
pub fn compare(previous: &DeployedFiles, next: &DeployedFiles) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = next
        .iter()
        .map(|(name, content)| match previous.get(name) {
            None => FileChange::Added { name: name.clone() },
            Some(old) if old == content => FileChange::Unchanged { name: name.clone() },
            Some(old) => FileChange::Modified {
                name: name.clone(),
                diff: unified_diff(name, old, content),
            },
        })
        .collect();

    changes.extend(
        previous
            .keys()
            .filter(|name| !next.contains_key(*name))
            .map(|name| FileChange::Removed { name: name.clone() }),
    );
    changes
}
