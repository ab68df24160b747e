//! In-memory [`Forge`] for tests.
//!
//! Stores pull requests, releases and commits in memory, records every
//! call, and can be told to fail a specific operation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    CommitDetails, CreatePullRequest, CreateRelease, Forge, ForgeError, ForgeResult,
    MergeMethod, PrState, PullRequest, PullRequestQuery, Release, Review,
};

/// Mock forge. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockForge {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    pull_requests: BTreeMap<u64, PullRequest>,
    reviews: BTreeMap<u64, Vec<Review>>,
    releases: Vec<Release>,
    commits: BTreeMap<String, CommitDetails>,
    diffs: BTreeMap<(String, String), Vec<String>>,
    fail_on: Option<FailOn>,
    operations: Vec<MockOperation>,
}

/// Which operation should fail, and how.
#[derive(Debug, Clone)]
pub enum FailOn {
    /// Fail `create_pull_request`.
    CreatePullRequest(ForgeError),
    /// Fail `merge_pull_request`.
    Merge(ForgeError),
    /// Fail `create_release` for this tag only.
    CreateRelease {
        /// Tag that fails.
        tag: String,
        /// Error returned.
        error: ForgeError,
    },
    /// Fail `list_pull_requests`.
    List(ForgeError),
    /// Fail label changes.
    Labels(ForgeError),
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOperation {
    /// `create_pull_request` with the head branch.
    CreatePullRequest {
        /// Head branch.
        head: String,
    },
    /// `get_pull_request`.
    GetPullRequest(u64),
    /// `list_pull_requests`.
    ListPullRequests,
    /// `get_pull_request_reviews`.
    GetReviews(u64),
    /// `merge_pull_request`.
    Merge(u64),
    /// `create_release` with the tag.
    CreateRelease(String),
    /// `get_commit`.
    GetCommit(String),
    /// `get_diff_commits`.
    GetDiffCommits,
    /// `add_label_to_pull_request`.
    AddLabel(u64, String),
    /// `remove_label_from_pull_request`.
    RemoveLabel(u64, String),
}

impl MockForge {
    /// Empty forge.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a pull request.
    pub fn with_pull_request(self, pr: PullRequest) -> Self {
        self.lock().pull_requests.insert(pr.number, pr);
        self
    }

    /// Replace the reviews on a pull request.
    pub fn set_reviews(&self, number: u64, reviews: Vec<Review>) {
        self.lock().reviews.insert(number, reviews);
    }

    /// Change the mergeable flag of a pull request.
    pub fn set_mergeable(&self, number: u64, mergeable: Option<bool>) {
        if let Some(pr) = self.lock().pull_requests.get_mut(&number) {
            pr.mergeable = mergeable;
        }
    }

    /// Seed a commit.
    pub fn add_commit(&self, commit: CommitDetails) {
        self.lock().commits.insert(commit.sha.clone(), commit);
    }

    /// Seed the answer to `get_diff_commits(base, head)`.
    pub fn set_diff(&self, base: &str, head: &str, shas: Vec<String>) {
        self.lock()
            .diffs
            .insert((base.to_string(), head.to_string()), shas);
    }

    /// Make an operation fail.
    pub fn fail_on(&self, fail: FailOn) {
        self.lock().fail_on = Some(fail);
    }

    /// Every call so far.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.lock().operations.clone()
    }

    /// Releases created so far.
    pub fn releases(&self) -> Vec<Release> {
        self.lock().releases.clone()
    }

    /// Current view of a pull request.
    pub fn pull_request(&self, number: u64) -> Option<PullRequest> {
        self.lock().pull_requests.get(&number).cloned()
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn create_pull_request(&self, request: CreatePullRequest) -> ForgeResult<PullRequest> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::CreatePullRequest {
            head: request.head.clone(),
        });
        if let Some(FailOn::CreatePullRequest(err)) = &inner.fail_on {
            return Err(err.clone());
        }
        let number = inner.pull_requests.keys().next_back().map_or(1, |n| n + 1);
        let pr = PullRequest {
            number,
            url: format!("https://github.com/mock/repo/pull/{number}"),
            title: request.title,
            body: request.body,
            head: request.head,
            base: request.base,
            state: PrState::Open,
            merged: false,
            merge_commit_sha: None,
            mergeable: Some(true),
            labels: Vec::new(),
        };
        inner.pull_requests.insert(number, pr.clone());
        Ok(pr)
    }

    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::GetPullRequest(number));
        inner
            .pull_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("pull request #{number}")))
    }

    async fn list_pull_requests(&self, query: &PullRequestQuery) -> ForgeResult<Vec<PullRequest>> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::ListPullRequests);
        if let Some(FailOn::List(err)) = &inner.fail_on {
            return Err(err.clone());
        }
        Ok(inner
            .pull_requests
            .values()
            .filter(|pr| pr.state == query.state)
            .filter(|pr| !query.merged_only || pr.merged)
            .filter(|pr| {
                query
                    .label
                    .as_ref()
                    .is_none_or(|label| pr.labels.contains(label))
            })
            .cloned()
            .collect())
    }

    async fn get_pull_request_reviews(&self, number: u64) -> ForgeResult<Vec<Review>> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::GetReviews(number));
        Ok(inner.reviews.get(&number).cloned().unwrap_or_default())
    }

    async fn merge_pull_request(&self, number: u64, _method: MergeMethod) -> ForgeResult<()> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::Merge(number));
        if let Some(FailOn::Merge(err)) = &inner.fail_on {
            return Err(err.clone());
        }
        let pr = inner
            .pull_requests
            .get_mut(&number)
            .ok_or_else(|| ForgeError::NotFound(format!("pull request #{number}")))?;
        pr.state = PrState::Closed;
        pr.merged = true;
        pr.merge_commit_sha = Some(format!("{number:040x}"));
        Ok(())
    }

    async fn create_release(&self, request: CreateRelease) -> ForgeResult<Release> {
        let mut inner = self.lock();
        inner
            .operations
            .push(MockOperation::CreateRelease(request.tag.clone()));
        if let Some(FailOn::CreateRelease { tag, error }) = &inner.fail_on
            && *tag == request.tag
        {
            return Err(error.clone());
        }
        let release = Release {
            id: inner.releases.len() as u64 + 1,
            url: format!("https://github.com/mock/repo/releases/tag/{}", request.tag),
            tag: request.tag,
        };
        inner.releases.push(release.clone());
        Ok(release)
    }

    async fn get_commit(&self, sha: &str) -> ForgeResult<CommitDetails> {
        let mut inner = self.lock();
        inner
            .operations
            .push(MockOperation::GetCommit(sha.to_string()));
        inner
            .commits
            .get(sha)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("commit {sha}")))
    }

    async fn get_diff_commits(&self, base: &str, head: &str) -> ForgeResult<Vec<String>> {
        let mut inner = self.lock();
        inner.operations.push(MockOperation::GetDiffCommits);
        Ok(inner
            .diffs
            .get(&(base.to_string(), head.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn add_label_to_pull_request(&self, number: u64, label: &str) -> ForgeResult<()> {
        let mut inner = self.lock();
        inner
            .operations
            .push(MockOperation::AddLabel(number, label.to_string()));
        if let Some(FailOn::Labels(err)) = &inner.fail_on {
            return Err(err.clone());
        }
        let pr = inner
            .pull_requests
            .get_mut(&number)
            .ok_or_else(|| ForgeError::NotFound(format!("pull request #{number}")))?;
        if !pr.labels.iter().any(|l| l == label) {
            pr.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label_from_pull_request(&self, number: u64, label: &str) -> ForgeResult<()> {
        let mut inner = self.lock();
        inner
            .operations
            .push(MockOperation::RemoveLabel(number, label.to_string()));
        if let Some(FailOn::Labels(err)) = &inner.fail_on {
            return Err(err.clone());
        }
        if let Some(pr) = inner.pull_requests.get_mut(&number) {
            pr.labels.retain(|l| l != label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(head: &str) -> CreatePullRequest {
        CreatePullRequest {
            head: head.into(),
            base: "main".into(),
            title: "chore: release".into(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn numbers_pull_requests_sequentially() {
        let forge = MockForge::new();
        let first = forge.create_pull_request(request("a")).await.unwrap();
        let second = forge.create_pull_request(request("b")).await.unwrap();
        assert_eq!((first.number, second.number), (1, 2));
        assert_eq!(forge.get_pull_request(2).await.unwrap().head, "b");
    }

    #[tokio::test]
    async fn labels_and_merge() {
        let forge = MockForge::new();
        let pr = forge.create_pull_request(request("a")).await.unwrap();
        forge
            .add_label_to_pull_request(pr.number, "release:pending")
            .await
            .unwrap();
        forge.merge_pull_request(pr.number, MergeMethod::Squash).await.unwrap();

        let listed = forge
            .list_pull_requests(&PullRequestQuery {
                state: PrState::Closed,
                label: Some("release:pending".into()),
                merged_only: true,
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        forge
            .remove_label_from_pull_request(pr.number, "release:pending")
            .await
            .unwrap();
        assert!(forge.pull_request(pr.number).unwrap().labels.is_empty());
    }

    #[tokio::test]
    async fn fails_only_the_configured_release() {
        let forge = MockForge::new();
        forge.fail_on(FailOn::CreateRelease {
            tag: "bad-1.0.0".into(),
            error: ForgeError::Api {
                status: 422,
                message: "already exists".into(),
            },
        });
        let ok = CreateRelease {
            tag: "good-1.0.0".into(),
            target_commitish: "abc".into(),
            name: "good".into(),
            body: String::new(),
            prerelease: false,
        };
        let bad = CreateRelease {
            tag: "bad-1.0.0".into(),
            ..ok.clone()
        };
        assert!(forge.create_release(ok).await.is_ok());
        assert!(forge.create_release(bad).await.is_err());
        assert_eq!(forge.releases().len(), 1);
        assert_eq!(
            forge.operations(),
            [
                MockOperation::CreateRelease("good-1.0.0".into()),
                MockOperation::CreateRelease("bad-1.0.0".into()),
            ]
        );
    }
}
