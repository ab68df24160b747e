//! Persisted repository state.
//!
//! A language repository records what librarian knows about it in
//! `.librarian/state.yaml`: the generator image and, per library, the
//! released version, the upstream commit it was last generated from, the
//! APIs it bundles and the directories it owns.
//!
//! ```yaml
//! image: gcr.io/p/python-librarian-generator:1.4.0
//! libraries:
//!   - id: google-cloud-foo
//!     version: 1.2.3
//!     last_generated_commit: 0123456789abcdef0123456789abcdef01234567
//!     apis:
//!       - path: google/cloud/foo/v1
//!         service_config: foo_v1.yaml
//!     source_roots:
//!       - packages/google-cloud-foo
//!     preserve_regex:
//!       - packages/google-cloud-foo/CHANGELOG.md
//!     tag_format: "{id}-v{version}"
//! ```
//!
//! Loading and saving always validate the whole document. A state with an
//! invalid library is rejected as a unit.

mod repo_config;
mod validate;

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub use repo_config::{FilePermission, GlobalFile, RepoConfig, RepoLibraryConfig};
pub use validate::{
    clean_relative_path, is_valid_dir_path, is_valid_version, validate_tag_format,
};

/// Directory holding librarian's files inside a language repository.
pub const LIBRARIAN_DIR: &str = ".librarian";

/// State document file name inside [`LIBRARIAN_DIR`].
pub const STATE_FILE: &str = "state.yaml";

/// Tag format used when a library does not configure one.
pub const DEFAULT_TAG_FORMAT: &str = "{id}-{version}";

/// Errors from reading, writing or validating repository state.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state file does not exist.
    #[error("no librarian state found at {0}")]
    NotFound(Utf8PathBuf),

    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid YAML for the schema.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File being parsed.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },

    /// Serializing the document failed.
    #[error("failed to serialize state: {0}")]
    Serialize(String),

    /// An invariant does not hold.
    #[error("{field}: {message}")]
    Invalid {
        /// Path of the offending field, e.g. `libraries[2].version`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The requested library is not in the state.
    #[error("library {0:?} not found in state")]
    UnknownLibrary(String),
}

impl StateError {
    /// Prefix the field path of a validation error.
    fn within(self, prefix: String) -> Self {
        match self {
            Self::Invalid { field, message } => Self::Invalid {
                field: format!("{prefix}.{field}"),
                message,
            },
            other => other,
        }
    }
}

/// Result alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// One API surface bundled into a library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Api {
    /// Directory of the API definition inside the API source, e.g. `google/cloud/foo/v1`.
    pub path: String,
    /// Service config file name relative to `path`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_config: String,
}

/// Release and generation state of one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryState {
    /// Unique library identifier.
    pub id: String,
    /// Last released version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Upstream API commit the library was last generated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_generated_commit: Option<String>,
    /// APIs folded into this library.
    #[serde(default)]
    pub apis: Vec<Api>,
    /// Repository directories owned by this library.
    #[serde(default, alias = "source_paths")]
    pub source_roots: Vec<String>,
    /// Files matching any of these survive a clean.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserve_regex: Vec<String>,
    /// Files matching any of these are removed by a clean.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_regex: Vec<String>,
    /// Commits only touching these paths do not trigger a release.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub release_exclude_paths: Vec<String>,
    /// Template for release tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_format: Option<String>,
}

impl LibraryState {
    /// The release tag for the library's current version.
    pub fn format_tag(&self) -> String {
        format_tag(
            self.tag_format.as_deref(),
            &self.id,
            self.version.as_deref().unwrap_or_default(),
        )
    }

    /// The release tag this library would get at `version`.
    pub fn tag_for(&self, version: &str) -> String {
        format_tag(self.tag_format.as_deref(), &self.id, version)
    }

    /// Whether a repository-relative path lies under one of the source roots.
    pub fn owns_path(&self, path: &str) -> bool {
        self.source_roots.iter().any(|root| path_is_under(path, root))
    }
}

/// The whole state document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarianState {
    /// Generator container image.
    pub image: String,
    /// Libraries managed in this repository.
    pub libraries: Vec<LibraryState>,
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    image: String,
    #[serde(default)]
    libraries: Vec<Option<LibraryState>>,
}

impl LibrarianState {
    /// Path of the state file inside a repository.
    pub fn path(repo_root: &Utf8Path) -> Utf8PathBuf {
        repo_root.join(LIBRARIAN_DIR).join(STATE_FILE)
    }

    /// Load and validate the state of the repository at `repo_root`.
    #[instrument(fields(%repo_root))]
    pub fn load(repo_root: &Utf8Path) -> StateResult<Self> {
        let path = Self::path(repo_root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(path));
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };
        let state = Self::from_yaml(&text, &path)?;
        debug!(libraries = state.libraries.len(), "state loaded");
        Ok(state)
    }

    /// Parse and validate a YAML document. `origin` is used in errors.
    pub fn from_yaml(text: &str, origin: &Utf8Path) -> StateResult<Self> {
        let raw: RawState = serde_saphyr::from_str(text).map_err(|e| StateError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut libraries = Vec::with_capacity(raw.libraries.len());
        for (idx, library) in raw.libraries.into_iter().enumerate() {
            let library = library.ok_or_else(|| StateError::Invalid {
                field: format!("libraries[{idx}]"),
                message: "must not be null".to_string(),
            })?;
            libraries.push(library);
        }

        let state = Self {
            image: raw.image,
            libraries,
        };
        state.validate()?;
        Ok(state)
    }

    /// Serialize to YAML after validating.
    pub fn to_yaml(&self) -> StateResult<String> {
        self.validate()?;
        serde_saphyr::to_string(self).map_err(|e| StateError::Serialize(e.to_string()))
    }

    /// Validate and atomically write the state into `repo_root`.
    #[instrument(skip(self), fields(%repo_root))]
    pub fn save(&self, repo_root: &Utf8Path) -> StateResult<()> {
        let yaml = self.to_yaml()?;
        let path = Self::path(repo_root);
        write_atomic(&path, yaml.as_bytes())?;
        debug!(%path, "state saved");
        Ok(())
    }

    /// Look up a library by ID.
    pub fn library(&self, id: &str) -> Option<&LibraryState> {
        self.libraries.iter().find(|l| l.id == id)
    }

    /// Look up a library by ID for modification.
    pub fn library_mut(&mut self, id: &str) -> StateResult<&mut LibraryState> {
        self.libraries
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StateError::UnknownLibrary(id.to_string()))
    }

    /// Libraries sorted by ascending ID.
    pub fn sorted_libraries(&self) -> Vec<&LibraryState> {
        let mut libraries: Vec<&LibraryState> = self.libraries.iter().collect();
        libraries.sort_by(|a, b| a.id.cmp(&b.id));
        libraries
    }

    /// Find the library that bundles the API at `api_path`.
    pub fn library_for_api(&self, api_path: &str) -> Option<&LibraryState> {
        let wanted = clean_relative_path(api_path)?;
        self.libraries.iter().find(|l| {
            l.apis
                .iter()
                .any(|api| clean_relative_path(&api.path).as_deref() == Some(wanted.as_str()))
        })
    }
}

/// Split an image reference into `(ref, tag)`.
///
/// The split happens at the last colon unless what follows it contains a
/// `/`, in which case the colon belonged to a registry port.
pub fn image_ref_and_tag(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, ""),
    }
}

/// Expand `{id}` and `{version}` in a tag template.
pub fn format_tag(tag_format: Option<&str>, id: &str, version: &str) -> String {
    tag_format
        .unwrap_or(DEFAULT_TAG_FORMAT)
        .replace("{id}", id)
        .replace("{version}", version)
}

/// Whether `path` equals `root` or lies beneath it. Both are repo-relative
/// and compared after cleaning, so `./foo/` and `foo` are the same root.
pub fn path_is_under(path: &str, root: &str) -> bool {
    let (Some(path), Some(root)) = (clean_relative_path(path), clean_relative_path(root)) else {
        return false;
    };
    path == root
        || path
            .strip_prefix(&root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Write `contents` to a temporary sibling of `path` and rename it into place.
pub(crate) fn write_atomic(path: &Utf8Path, contents: &[u8]) -> StateResult<()> {
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
