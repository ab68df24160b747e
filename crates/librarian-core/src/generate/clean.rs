//! Removing previously generated files before a regeneration.

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{GenerateError, GenerateResult};
use crate::state::LibraryState;

/// What a clean removed and kept, as repository-relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Files deleted.
    pub removed: Vec<String>,
    /// Files and directories kept because they match a preserve pattern.
    pub preserved: Vec<String>,
}

/// Delete the generated files under `library`'s source roots.
///
/// Paths are matched relative to `repo_root`. Anything matching a
/// `preserve_regex` stays, and a preserved directory is never descended
/// into. Other files are removed when they match a `remove_regex`, or
/// unconditionally when the library has none. Directories emptied by the
/// clean are removed as well.
#[instrument(skip(library), fields(library = %library.id))]
pub fn clean_library(repo_root: &Utf8Path, library: &LibraryState) -> GenerateResult<CleanReport> {
    let patterns = Patterns {
        preserve: compile(&library.preserve_regex)?,
        remove: compile(&library.remove_regex)?,
    };
    let mut report = CleanReport::default();
    for root in &library.source_roots {
        let dir = repo_root.join(root);
        if !dir.is_dir() {
            debug!(%dir, "source root missing, nothing to clean");
            continue;
        }
        clean_dir(repo_root, &dir, &patterns, &mut report)?;
    }
    debug!(
        removed = report.removed.len(),
        preserved = report.preserved.len(),
        "clean finished"
    );
    Ok(report)
}

struct Patterns {
    preserve: Vec<Regex>,
    remove: Vec<Regex>,
}

impl Patterns {
    fn preserves(&self, path: &str) -> bool {
        self.preserve.iter().any(|r| r.is_match(path))
    }

    fn removes(&self, path: &str) -> bool {
        !self.preserves(path)
            && (self.remove.is_empty() || self.remove.iter().any(|r| r.is_match(path)))
    }
}

pub(crate) fn compile(patterns: &[String]) -> GenerateResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| GenerateError::Regex {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Clean `dir` depth-first. Returns whether it is empty afterwards.
fn clean_dir(
    repo_root: &Utf8Path,
    dir: &Utf8Path,
    patterns: &Patterns,
    report: &mut CleanReport,
) -> GenerateResult<bool> {
    let mut remaining = 0usize;
    for path in sorted_entries(dir)? {
        let rel = relative(repo_root, &path);
        let file_type = std::fs::symlink_metadata(&path)
            .map_err(io_err(&path))?
            .file_type();

        if file_type.is_dir() {
            if patterns.preserves(&rel) {
                report.preserved.push(rel);
                remaining += 1;
                continue;
            }
            let removed_before = report.removed.len();
            let empty = clean_dir(repo_root, &path, patterns, report)?;
            if empty && report.removed.len() > removed_before {
                std::fs::remove_dir(&path).map_err(io_err(&path))?;
            } else {
                remaining += 1;
            }
        } else if patterns.removes(&rel) {
            std::fs::remove_file(&path).map_err(io_err(&path))?;
            report.removed.push(rel);
        } else {
            if patterns.preserves(&rel) {
                report.preserved.push(rel);
            }
            remaining += 1;
        }
    }
    Ok(remaining == 0)
}

pub(crate) fn sorted_entries(dir: &Utf8Path) -> GenerateResult<Vec<Utf8PathBuf>> {
    let mut entries = Vec::new();
    for entry in dir.read_dir_utf8().map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        entries.push(entry.into_path());
    }
    entries.sort();
    Ok(entries)
}

/// `path` relative to `base`, always with `/` separators.
pub(crate) fn relative(base: &Utf8Path, path: &Utf8Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> GenerateError + '_ {
    move |source| GenerateError::Io {
        path: path.to_path_buf(),
        source,
    }
}
