//! Release computation and release workflows.
//!
//! - [`history`] collects the conventional commits a library accumulated
//!   since its last release tag.
//! - [`notes`] renders those commits as changelog sections and release PR
//!   bodies.
//! - [`init`] computes next versions, updates state and changelogs, and
//!   optionally opens the release pull request.
//! - [`publish`] turns merged release pull requests into tags and GitHub
//!   releases, and can wait for a release PR to become mergeable.

pub mod history;
pub mod init;
pub mod notes;
pub mod publish;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

use crate::forge::ForgeError;
use crate::git::GitError;
use crate::state::StateError;
use crate::version::VersionError;

pub use history::get_conventional_commits_since_last_release;
pub use init::{
    LibraryRelease, ReleaseEvent, ReleaseInitOptions, ReleaseInitReport, ReleasePlan,
    plan_release_init,
};
pub use publish::{TagAndReleaseOptions, TagAndReleaseReport, tag_and_release, wait_and_merge};

/// Errors from release operations.
#[derive(Error, Debug)]
pub enum ReleaseError {
    /// State could not be read, validated or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// A git command failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// A version could not be parsed or did not move forward.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// A forge call failed.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// The library records a released version whose tag does not exist.
    #[error("library {library}: release tag {tag} not found")]
    TagNotFound {
        /// Library being released.
        library: String,
        /// Tag that was looked up.
        tag: String,
    },

    /// Reading or writing a changelog failed.
    #[error("{path}: {source}")]
    Io {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Conflicting or incomplete options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A pull request expected to be merged is still open or was closed.
    #[error("pull request #{0} has not been merged")]
    NotMerged(u64),

    /// Waiting for a pull request to become mergeable timed out.
    #[error("gave up on pull request #{number} after {attempts} attempts")]
    MergeTimeout {
        /// Pull request number.
        number: u64,
        /// Polls performed.
        attempts: u32,
    },

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Result alias for release operations.
pub type ReleaseResult<T> = Result<T, ReleaseError>;

/// What happened to one library in a release run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum LibraryOutcome {
    /// The library was released (or prepared for release).
    Released {
        /// New version.
        version: String,
        /// Release tag.
        tag: String,
    },
    /// Nothing was done for the library.
    Skipped {
        /// Why.
        reason: String,
    },
    /// The library failed; other libraries were still processed.
    Failed {
        /// Error message.
        error: String,
    },
}

impl LibraryOutcome {
    /// Whether this outcome should make the run exit non-zero.
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
