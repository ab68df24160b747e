//! Remote hosting (GitHub) operations.
//!
//! Release and generate workflows talk to the hosting service through the
//! [`Forge`] trait. [`github::GitHubForge`] is the REST implementation;
//! [`mock::MockForge`] keeps everything in memory for tests.
//!
//! List operations return complete results: implementations follow
//! pagination until the last page before returning.

pub mod github;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from forge operations.
#[derive(Debug, Clone, Error)]
pub enum ForgeError {
    /// No token was configured.
    #[error("authentication required: set LIBRARIAN_GITHUB_TOKEN")]
    AuthRequired,

    /// The token was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limit exceeded.
    #[error("rate limited")]
    RateLimited,

    /// The API answered with an error status.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message from the response body.
        message: String,
    },

    /// The request never got an answer.
    #[error("network error: {0}")]
    Network(String),

    /// The hosting repository could not be determined from the git remote.
    #[error("cannot determine GitHub repository: {0}")]
    UnknownRepository(String),
}

/// Result alias for forge operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Request to open a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePullRequest {
    /// Branch with the changes.
    pub head: String,
    /// Branch to merge into.
    pub base: String,
    /// Title.
    pub title: String,
    /// Markdown body.
    pub body: String,
}

/// Open or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    /// Still open.
    Open,
    /// Closed, merged or not.
    Closed,
}

/// A pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    /// Number within the repository.
    pub number: u64,
    /// Web URL.
    pub url: String,
    /// Title.
    pub title: String,
    /// Markdown body.
    pub body: String,
    /// Head branch.
    pub head: String,
    /// Base branch.
    pub base: String,
    /// Open or closed.
    pub state: PrState,
    /// Whether it has been merged.
    pub merged: bool,
    /// Commit created by the merge.
    pub merge_commit_sha: Option<String>,
    /// Whether GitHub considers it mergeable; `None` while still computing.
    pub mergeable: Option<bool>,
    /// Label names.
    pub labels: Vec<String>,
}

/// Which pull requests to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestQuery {
    /// Filter by state.
    pub state: PrState,
    /// Only pull requests carrying this label.
    pub label: Option<String>,
    /// Only merged pull requests.
    pub merged_only: bool,
}

/// State of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    /// Approved.
    Approved,
    /// Changes requested.
    ChangesRequested,
    /// Comment only.
    Commented,
    /// Dismissed by a maintainer.
    Dismissed,
    /// Not yet submitted.
    Pending,
}

/// A review on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Review {
    /// Reviewer login.
    pub user: String,
    /// Review verdict.
    pub state: ReviewState,
}

/// How to merge a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Merge commit.
    Merge,
    /// Squash into one commit.
    #[default]
    Squash,
    /// Rebase onto base.
    Rebase,
}

/// Request to publish a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRelease {
    /// Tag to create.
    pub tag: String,
    /// Commit the tag points at.
    pub target_commitish: String,
    /// Display name.
    pub name: String,
    /// Markdown notes.
    pub body: String,
    /// Mark as a pre-release.
    pub prerelease: bool,
}

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    /// Numeric ID.
    pub id: u64,
    /// Tag name.
    pub tag: String,
    /// Web URL.
    pub url: String,
}

/// A commit as seen by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitDetails {
    /// Full SHA.
    pub sha: String,
    /// Commit message.
    pub message: String,
    /// Web URL.
    pub url: String,
}

/// Operations the orchestrator needs from a hosting service.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Open a pull request.
    async fn create_pull_request(&self, request: CreatePullRequest) -> ForgeResult<PullRequest>;

    /// Fetch one pull request.
    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest>;

    /// List pull requests matching `query`, all pages.
    async fn list_pull_requests(&self, query: &PullRequestQuery) -> ForgeResult<Vec<PullRequest>>;

    /// Reviews on a pull request, all pages.
    async fn get_pull_request_reviews(&self, number: u64) -> ForgeResult<Vec<Review>>;

    /// Merge a pull request.
    async fn merge_pull_request(&self, number: u64, method: MergeMethod) -> ForgeResult<()>;

    /// Create a tag and release.
    async fn create_release(&self, request: CreateRelease) -> ForgeResult<Release>;

    /// Fetch a commit.
    async fn get_commit(&self, sha: &str) -> ForgeResult<CommitDetails>;

    /// SHAs reachable from `head` but not `base`, oldest first, all pages.
    async fn get_diff_commits(&self, base: &str, head: &str) -> ForgeResult<Vec<String>>;

    /// Add a label to a pull request.
    async fn add_label_to_pull_request(&self, number: u64, label: &str) -> ForgeResult<()>;

    /// Remove a label from a pull request. Removing an absent label succeeds.
    async fn remove_label_from_pull_request(&self, number: u64, label: &str) -> ForgeResult<()>;
}

/// Whether the latest review of every reviewer leaves at least one approval
/// and no outstanding change request.
pub fn is_approved(reviews: &[Review]) -> bool {
    let mut latest: std::collections::BTreeMap<&str, ReviewState> = Default::default();
    for review in reviews {
        match review.state {
            ReviewState::Commented | ReviewState::Pending => {}
            state => {
                latest.insert(review.user.as_str(), state);
            }
        }
    }
    latest.values().any(|s| *s == ReviewState::Approved)
        && !latest.values().any(|s| *s == ReviewState::ChangesRequested)
}
