//! Optional repository configuration (`.librarian/config.yaml`).
//!
//! Unlike the state document this file is written by humans. It carries
//! per-library generation parameters and release overrides, and lists the
//! repository files outside any library that generators may touch.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::validate::{clean_relative_path, is_valid_dir_path, is_valid_version};
use super::{LIBRARIAN_DIR, StateError, StateResult};

/// Repository configuration file name inside [`LIBRARIAN_DIR`].
pub const REPO_CONFIG_FILE: &str = "config.yaml";

/// Access a generator has to a global file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilePermission {
    /// Readable by the generator, never overwritten.
    ReadOnly,
    /// Written by the generator, not provided as input.
    WriteOnly,
    /// Provided as input and overwritten with the output.
    ReadWrite,
}

impl FilePermission {
    /// Whether generated output may replace the file.
    pub const fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// A repository file shared between libraries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalFile {
    /// Repository-relative path.
    pub path: String,
    /// What the generator may do with it.
    pub permissions: FilePermission,
}

/// Generation and release settings for one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoLibraryConfig {
    /// Library the settings apply to.
    pub id: String,
    /// Release this version next instead of the computed one, if larger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,
    /// Skip the library in generate runs.
    pub generate_blocked: bool,
    /// Skip the library in release runs.
    pub release_blocked: bool,
    /// Transport(s) to generate, e.g. `grpc+rest`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    /// Release level, e.g. `preview` or `stable`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_level: Option<String>,
    /// Language-specific generator options.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Contents of `.librarian/config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Files outside every source root that generators may touch.
    pub global_files_allowlist: Vec<GlobalFile>,
    /// Per-library settings.
    pub libraries: Vec<RepoLibraryConfig>,
}

impl RepoConfig {
    /// Path of the config file inside a repository.
    pub fn path(repo_root: &Utf8Path) -> Utf8PathBuf {
        repo_root.join(LIBRARIAN_DIR).join(REPO_CONFIG_FILE)
    }

    /// Load the repository config; a missing file is an empty config.
    pub fn load(repo_root: &Utf8Path) -> StateResult<Self> {
        let path = Self::path(repo_root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%path, "no repository config");
                return Ok(Self::default());
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };
        let config: Self = serde_saphyr::from_str(&text).map_err(|e| StateError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check paths and versions.
    pub fn validate(&self) -> StateResult<()> {
        for (idx, file) in self.global_files_allowlist.iter().enumerate() {
            if !is_valid_dir_path(&file.path) {
                return Err(StateError::Invalid {
                    field: format!("global_files_allowlist[{idx}].path"),
                    message: format!("{:?} is not a valid relative path", file.path),
                });
            }
        }
        for (idx, library) in self.libraries.iter().enumerate() {
            if library.id.is_empty() {
                return Err(StateError::Invalid {
                    field: format!("libraries[{idx}].id"),
                    message: "must not be empty".to_string(),
                });
            }
            if let Some(ref version) = library.next_version
                && !is_valid_version(version)
            {
                return Err(StateError::Invalid {
                    field: format!("libraries[{idx}].next_version"),
                    message: format!("{version:?} is not a valid semantic version"),
                });
            }
        }
        Ok(())
    }

    /// Settings for a library, if any.
    pub fn library(&self, id: &str) -> Option<&RepoLibraryConfig> {
        self.libraries.iter().find(|l| l.id == id)
    }

    /// Whether a generator may write `path`.
    pub fn allows_write(&self, path: &str) -> bool {
        let Some(path) = clean_relative_path(path) else {
            return false;
        };
        self.global_files_allowlist.iter().any(|f| {
            f.permissions.writable() && clean_relative_path(&f.path).is_some_and(|p| p == path)
        })
    }

    /// Whether generation of `id` is blocked.
    pub fn generate_blocked(&self, id: &str) -> bool {
        self.library(id).is_some_and(|l| l.generate_blocked)
    }

    /// Whether releasing `id` is blocked.
    pub fn release_blocked(&self, id: &str) -> bool {
        self.library(id).is_some_and(|l| l.release_blocked)
    }
}
