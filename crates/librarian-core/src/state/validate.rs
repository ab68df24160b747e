//! Validation rules for the state document.
//!
//! Validation is fail-fast: the first violated rule is returned, wrapped
//! with the field path (`libraries[1].source_roots[0]`) that caused it.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{LibrarianState, LibraryState, StateError, StateResult};

static LIBRARY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9/._-]+$").expect("id pattern compiles"));

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .expect("version pattern compiles")
});

static COMMIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").expect("sha pattern compiles"));

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("placeholder pattern compiles"));

const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\', '\0'];

fn invalid(field: impl Into<String>, message: impl Into<String>) -> StateError {
    StateError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

impl LibrarianState {
    /// Check every invariant of the document, stopping at the first failure.
    pub fn validate(&self) -> StateResult<()> {
        if self.image.trim().is_empty() {
            return Err(invalid("image", "must not be empty"));
        }
        let (reference, tag) = super::image_ref_and_tag(&self.image);
        if reference.is_empty() || tag.is_empty() {
            return Err(invalid(
                "image",
                format!("{:?} must have the form REF:TAG", self.image),
            ));
        }

        if self.libraries.is_empty() {
            return Err(invalid("libraries", "must contain at least one library"));
        }

        let mut seen = HashSet::new();
        for (idx, library) in self.libraries.iter().enumerate() {
            library.validate().map_err(|err| err.within(format!("libraries[{idx}]")))?;
            if !seen.insert(library.id.as_str()) {
                return Err(invalid(
                    format!("libraries[{idx}].id"),
                    format!("duplicate library id {:?}", library.id),
                ));
            }
        }
        Ok(())
    }
}

impl LibraryState {
    /// Check the invariants of a single library entry.
    pub fn validate(&self) -> StateResult<()> {
        if self.id.is_empty() {
            return Err(invalid("id", "must not be empty"));
        }
        if self.id == "." || self.id == ".." || !LIBRARY_ID.is_match(&self.id) {
            return Err(invalid("id", format!("{:?} is not a valid library id", self.id)));
        }

        if let Some(ref version) = self.version
            && !is_valid_version(version)
        {
            return Err(invalid(
                "version",
                format!("{version:?} is not a valid semantic version"),
            ));
        }

        if let Some(ref sha) = self.last_generated_commit
            && !COMMIT_SHA.is_match(sha)
        {
            return Err(invalid(
                "last_generated_commit",
                format!("{sha:?} is not a 40 character hex SHA"),
            ));
        }

        if self.apis.is_empty() {
            return Err(invalid("apis", "must contain at least one API"));
        }
        for (idx, api) in self.apis.iter().enumerate() {
            if !is_valid_dir_path(&api.path) {
                return Err(invalid(
                    format!("apis[{idx}].path"),
                    format!("{:?} is not a valid relative path", api.path),
                ));
            }
        }

        if self.source_roots.is_empty() {
            return Err(invalid("source_roots", "must contain at least one path"));
        }
        check_paths("source_roots", &self.source_roots)?;
        check_paths("release_exclude_paths", &self.release_exclude_paths)?;
        check_regexes("preserve_regex", &self.preserve_regex)?;
        check_regexes("remove_regex", &self.remove_regex)?;

        if let Some(ref format) = self.tag_format {
            validate_tag_format(format).map_err(|message| invalid("tag_format", message))?;
        }
        Ok(())
    }
}

fn check_paths(field: &str, paths: &[String]) -> StateResult<()> {
    for (idx, path) in paths.iter().enumerate() {
        if !is_valid_dir_path(path) {
            return Err(invalid(
                format!("{field}[{idx}]"),
                format!("{path:?} is not a valid relative path"),
            ));
        }
    }
    Ok(())
}

fn check_regexes(field: &str, patterns: &[String]) -> StateResult<()> {
    for (idx, pattern) in patterns.iter().enumerate() {
        if let Err(err) = Regex::new(pattern) {
            return Err(invalid(format!("{field}[{idx}]"), err.to_string()));
        }
    }
    Ok(())
}

/// Accept `v?MAJOR.MINOR.PATCH` with optional pre-release and build metadata.
pub fn is_valid_version(version: &str) -> bool {
    SEMVER.is_match(version)
}

/// Reject any placeholder other than `{id}` and `{version}`.
pub fn validate_tag_format(format: &str) -> Result<(), String> {
    if format.trim().is_empty() {
        return Err("must not be empty".to_string());
    }
    for token in PLACEHOLDER.find_iter(format) {
        match token.as_str() {
            "{id}" | "{version}" => {}
            other => return Err(format!("unsupported placeholder {other} in {format:?}")),
        }
    }
    Ok(())
}

/// Resolve `.` and `..` segments of a `/`-separated relative path.
///
/// Returns `None` when the path is empty, absolute, escapes its root, or
/// resolves to the root itself.
pub fn clean_relative_path(path: &str) -> Option<String> {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return None;
    }
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        return None;
    }
    Some(stack.join("/"))
}

/// Whether `path` is a safe directory path relative to a repository root.
pub fn is_valid_dir_path(path: &str) -> bool {
    clean_relative_path(path).is_some_and(|cleaned| {
        cleaned
            .split('/')
            .all(|segment| !segment.contains(INVALID_PATH_CHARS))
    })
}
