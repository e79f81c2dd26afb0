//! Output tree planning
//!
//! Copy rules are expanded into an in-memory plan (destination to bytes and
//! mode) before anything is written. Applying a plan only touches files
//! whose content or mode changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::engine::FileRenderer;
use crate::error::{EngineError, Result};

/// Suffix of files rendered by `render` rules
pub const TEMPLATE_SUFFIX: &str = ".template";

const KARD_PATH_VAR: &str = "$KARD_PATH";
const SRC_PATH_VAR: &str = "$SRC_PATH";

/// Directories rule sources are resolved against
#[derive(Debug, Clone)]
pub struct SourceBase {
    pub pkr_root: PathBuf,
    pub kard_path: PathBuf,
    pub src_path: PathBuf,
}

impl SourceBase {
    pub fn resolve(&self, source: &str, origin: Option<&Path>) -> PathBuf {
        if let Some(rest) = source.strip_prefix(KARD_PATH_VAR) {
            return join_rest(&self.kard_path, rest);
        }
        if let Some(rest) = source.strip_prefix(SRC_PATH_VAR) {
            return join_rest(&self.src_path, rest);
        }
        let path = Path::new(source);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            origin.unwrap_or(&self.pkr_root).join(path)
        }
    }
}

fn join_rest(base: &Path, rest: &str) -> PathBuf {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

/// One source to copy (or render) into the output tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRule {
    /// File, directory or glob
    pub source: String,
    /// Base for a relative source; the pkr root when absent
    pub origin: Option<PathBuf>,
    /// Destination, relative to the output subfolder
    pub dst: String,
    pub exclude: Vec<String>,
    pub render: bool,
}

impl CopyRule {
    /// Verbatim copy
    pub fn copy(source: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            origin: None,
            dst: dst.into(),
            exclude: Vec::new(),
            render: false,
        }
    }

    /// Copy, rendering `.template` files
    pub fn render(source: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            render: true,
            ..Self::copy(source, dst)
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub content: Vec<u8>,
    pub mode: Option<u32>,
}

/// What `RenderPlan::apply` did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub unchanged: usize,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

/// Planned content of a kard directory
#[derive(Debug, Clone)]
pub struct RenderPlan {
    root: PathBuf,
    managed: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, PlannedFile>,
}

impl RenderPlan {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            managed: BTreeSet::new(),
            files: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mark a subfolder whose stale files are removed on reset
    pub fn manage(&mut self, subfolder: impl Into<PathBuf>) {
        self.managed.insert(subfolder.into());
    }

    pub fn files(&self) -> &BTreeMap<PathBuf, PlannedFile> {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Add one file; the same destination with other bytes is a conflict
    pub fn add(&mut self, rel: impl Into<PathBuf>, content: Vec<u8>, mode: Option<u32>) -> Result<()> {
        let rel = rel.into();
        match self.files.get(&rel) {
            Some(existing) if existing.content != content => Err(EngineError::OutputConflict {
                path: self.root.join(rel),
            }),
            Some(_) => Ok(()),
            None => {
                self.files.insert(rel, PlannedFile { content, mode });
                Ok(())
            }
        }
    }

    /// Merge another plan into this one
    pub fn extend(&mut self, other: RenderPlan) -> Result<()> {
        self.managed.extend(other.managed);
        for (rel, file) in other.files {
            self.add(rel, file.content, file.mode)?;
        }
        Ok(())
    }

    /// Expand a rule into planned files under `subfolder`
    pub fn add_rule(
        &mut self,
        subfolder: &Path,
        rule: &CopyRule,
        base: &SourceBase,
        renderer: Option<&FileRenderer>,
    ) -> Result<()> {
        let excludes = Excludes::new(&rule.exclude, base)?;
        let dst = subfolder.join(&rule.dst);
        let renderer = if rule.render { renderer } else { None };

        if rule.source.contains('*') {
            let pattern = base.resolve(&rule.source, rule.origin.as_deref());
            let pattern = pattern.to_string_lossy();
            let mut matches: Vec<PathBuf> = glob::glob(&pattern)
                .map_err(|e| EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: e.to_string(),
                })?
                .filter_map(|entry| entry.ok())
                .collect();
            matches.sort();

            for path in matches {
                let Some(name) = path.file_name() else {
                    continue;
                };
                if excludes.matches(&path, Path::new(name)) {
                    continue;
                }
                self.add_path(&path, &dst.join(name), &excludes, renderer)?;
            }
            return Ok(());
        }

        let path = base.resolve(&rule.source, rule.origin.as_deref());
        if !path.exists() {
            return Err(EngineError::MissingSource { path });
        }
        self.add_path(&path, &dst, &excludes, renderer)
    }

    fn add_path(
        &mut self,
        source: &Path,
        dst: &Path,
        excludes: &Excludes,
        renderer: Option<&FileRenderer>,
    ) -> Result<()> {
        if !source.is_dir() {
            return self.add_source_file(source, dst, renderer);
        }

        let walker = WalkDir::new(source)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || entry
                        .path()
                        .strip_prefix(source)
                        .map(|rel| !excludes.matches(entry.path(), rel))
                        .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
            self.add_source_file(entry.path(), &dst.join(rel), renderer)?;
        }
        Ok(())
    }

    fn add_source_file(
        &mut self,
        source: &Path,
        dst: &Path,
        renderer: Option<&FileRenderer>,
    ) -> Result<()> {
        let mode = file_mode(source);
        let is_template = source
            .to_str()
            .is_some_and(|s| s.ends_with(TEMPLATE_SUFFIX));

        match renderer {
            Some(renderer) if is_template => {
                let content = renderer.render_file(source)?;
                self.add(strip_template_suffix(dst), content.into_bytes(), mode)
            }
            _ => {
                let content = std::fs::read(source).map_err(|e| EngineError::ReadFile {
                    path: source.to_path_buf(),
                    source: e,
                })?;
                self.add(dst, content, mode)
            }
        }
    }

    /// Write the plan to disk
    ///
    /// Only files whose content or mode differs are written. With `reset`,
    /// files of managed subfolders that are not part of the plan are removed.
    pub fn apply(&self, reset: bool) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();

        for (rel, planned) in &self.files {
            let dest = self.root.join(rel);
            let same_content = std::fs::read(&dest).is_ok_and(|c| c == planned.content);
            let same_mode = planned.mode.is_none_or(|m| file_mode(&dest) == Some(m));
            if same_content && same_mode {
                report.unchanged += 1;
                continue;
            }

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !same_content {
                std::fs::write(&dest, &planned.content)?;
            }
            if let Some(mode) = planned.mode {
                set_file_mode(&dest, mode)?;
            }
            report.written.push(rel.clone());
        }

        if reset {
            for subfolder in &self.managed {
                self.remove_stale(subfolder, &mut report)?;
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            written = report.written.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged,
            "applied render plan"
        );
        Ok(report)
    }

    fn remove_stale(&self, subfolder: &Path, report: &mut ApplyReport) -> Result<()> {
        let dir = self.root.join(subfolder);
        if !dir.is_dir() {
            return Ok(());
        }

        for entry in WalkDir::new(&dir).contents_first(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };

            if entry.file_type().is_dir() {
                let empty = std::fs::read_dir(entry.path())?.next().is_none();
                if entry.depth() > 0 && empty {
                    std::fs::remove_dir(entry.path())?;
                }
            } else if !self.files.contains_key(rel) {
                std::fs::remove_file(entry.path())?;
                report.removed.push(rel.to_path_buf());
            }
        }
        Ok(())
    }
}

fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| EngineError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Exclude patterns of a rule
///
/// Each pattern is tried as written against the path relative to the
/// copied source and against the file name, then resolved like a rule
/// source (`$KARD_PATH`, `$SRC_PATH`, else the pkr root) against the
/// absolute path.
struct Excludes {
    relative: Vec<glob::Pattern>,
    absolute: Vec<glob::Pattern>,
}

impl Excludes {
    fn new(patterns: &[String], base: &SourceBase) -> Result<Self> {
        let relative = patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<_>>()?;
        let absolute = patterns
            .iter()
            .map(|p| compile_pattern(&base.resolve(p, None).to_string_lossy()))
            .collect::<Result<_>>()?;
        Ok(Self { relative, absolute })
    }

    fn matches(&self, path: &Path, rel: &Path) -> bool {
        let name = rel.file_name().and_then(|n| n.to_str());
        self.relative
            .iter()
            .any(|p| p.matches_path(rel) || name.is_some_and(|n| p.matches(n)))
            || self.absolute.iter().any(|p| p.matches_path(path))
    }
}

fn strip_template_suffix(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(TEMPLATE_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
