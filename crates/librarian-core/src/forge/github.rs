//! GitHub REST implementation of [`Forge`].
//!
//! Requests carry the token as a bearer credential, GitHub's JSON media
//! type and a pinned API version. List endpoints are drained by following
//! the `Link: <...>; rel="next"` header.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, LINK, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    CommitDetails, CreatePullRequest, CreateRelease, Forge, ForgeError, ForgeResult,
    MergeMethod, PrState, PullRequest, PullRequestQuery, Release, Review, ReviewState,
};

/// Default GitHub API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const USER_AGENT_VALUE: &str = concat!("librarian/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;

/// GitHub forge for one repository.
pub struct GitHubForge {
    client: Client,
    token: String,
    owner: String,
    repo: String,
    api_base: String,
}

// Keep the token out of logs.
impl std::fmt::Debug for GitHubForge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubForge")
            .field("has_token", &!self.token.is_empty())
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl GitHubForge {
    /// Create a forge for `owner/repo` on github.com.
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point at a different API root (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// `owner/repo`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.owner, self.repo, path
        )
    }

    fn headers(&self) -> ForgeResult<HeaderMap> {
        if self.token.is_empty() {
            return Err(ForgeError::AuthRequired);
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ForgeError::AuthFailed("token contains invalid characters".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static(API_VERSION),
        );
        Ok(headers)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ForgeResult<Response> {
        request
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|e| ForgeError::Network(e.to_string()))
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> ForgeResult<T> {
        let status = response.status();
        if status.is_success() {
            response.json().await.map_err(|e| ForgeError::Api {
                status: status.as_u16(),
                message: format!("failed to parse response: {e}"),
            })
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn expect_success(response: Response) -> ForgeResult<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn error_from(response: Response) -> ForgeError {
        let status = response.status();
        let rate_limited = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");
        let message = response
            .json::<GitHubErrorResponse>()
            .await
            .map(|e| e.message)
            .unwrap_or_else(|_| "unknown error".to_string());

        match status {
            StatusCode::UNAUTHORIZED => ForgeError::AuthFailed(message),
            StatusCode::TOO_MANY_REQUESTS => ForgeError::RateLimited,
            StatusCode::FORBIDDEN if rate_limited => ForgeError::RateLimited,
            StatusCode::NOT_FOUND => ForgeError::NotFound(message),
            _ => ForgeError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// GET every page starting at `url`, flattening each page with `items`.
    async fn get_all_pages<P, T>(
        &self,
        url: String,
        items: impl Fn(P) -> Vec<T>,
    ) -> ForgeResult<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut results = Vec::new();
        let mut next = Some(url);
        let mut pages = 0u32;
        while let Some(url) = next.take() {
            let response = self.send(self.client.get(&url)).await?;
            next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_page_url);
            let page: P = Self::handle_response(response).await?;
            results.extend(items(page));
            pages += 1;
        }
        debug!(pages, items = results.len(), "drained paginated endpoint");
        Ok(results)
    }
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_page_url(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

// ──────────────────────────────────────────────
// Wire types
// ──────────────────────────────────────────────

#[derive(Deserialize)]
struct GitHubErrorResponse {
    message: String,
}

#[derive(Deserialize)]
struct GitHubRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Deserialize)]
struct GitHubPullRequest {
    number: u64,
    html_url: String,
    title: String,
    body: Option<String>,
    head: GitHubRef,
    base: GitHubRef,
    state: PrState,
    #[serde(default)]
    merged: Option<bool>,
    merged_at: Option<String>,
    merge_commit_sha: Option<String>,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
}

impl From<GitHubPullRequest> for PullRequest {
    fn from(pr: GitHubPullRequest) -> Self {
        Self {
            number: pr.number,
            url: pr.html_url,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            head: pr.head.name,
            base: pr.base.name,
            state: pr.state,
            merged: pr.merged.unwrap_or(pr.merged_at.is_some()),
            merge_commit_sha: pr.merge_commit_sha,
            mergeable: pr.mergeable,
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Deserialize)]
struct GitHubReview {
    user: Option<GitHubUser>,
    state: ReviewState,
}

#[derive(Serialize)]
struct NewPullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct MergeBody {
    merge_method: MergeMethod,
}

#[derive(Serialize)]
struct NewRelease<'a> {
    tag_name: &'a str,
    target_commitish: &'a str,
    name: &'a str,
    body: &'a str,
    prerelease: bool,
}

#[derive(Deserialize)]
struct GitHubRelease {
    id: u64,
    tag_name: String,
    html_url: String,
}

#[derive(Deserialize)]
struct GitHubCommitInner {
    message: String,
}

#[derive(Deserialize)]
struct GitHubCommit {
    sha: String,
    html_url: String,
    commit: GitHubCommitInner,
}

#[derive(Deserialize)]
struct GitHubCompare {
    commits: Vec<GitHubCommitSha>,
}

#[derive(Deserialize)]
struct GitHubCommitSha {
    sha: String,
}

#[derive(Serialize)]
struct LabelsBody<'a> {
    labels: [&'a str; 1],
}

// ──────────────────────────────────────────────
// Forge implementation
// ──────────────────────────────────────────────

#[async_trait]
impl Forge for GitHubForge {
    #[instrument(skip(self, request), fields(repo = %self.full_name(), head = %request.head))]
    async fn create_pull_request(&self, request: CreatePullRequest) -> ForgeResult<PullRequest> {
        let body = NewPullRequest {
            title: &request.title,
            head: &request.head,
            base: &request.base,
            body: &request.body,
        };
        let response = self
            .send(self.client.post(self.repo_url("pulls")).json(&body))
            .await?;
        let pr: GitHubPullRequest = Self::handle_response(response).await?;
        debug!(number = pr.number, "pull request created");
        Ok(pr.into())
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn get_pull_request(&self, number: u64) -> ForgeResult<PullRequest> {
        let response = self
            .send(self.client.get(self.repo_url(&format!("pulls/{number}"))))
            .await?;
        let pr: GitHubPullRequest = Self::handle_response(response).await?;
        Ok(pr.into())
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn list_pull_requests(&self, query: &PullRequestQuery) -> ForgeResult<Vec<PullRequest>> {
        let state = match query.state {
            PrState::Open => "open",
            PrState::Closed => "closed",
        };
        let url = format!(
            "{}?state={state}&per_page={PER_PAGE}",
            self.repo_url("pulls")
        );
        let prs: Vec<GitHubPullRequest> = self
            .get_all_pages(url, |page: Vec<GitHubPullRequest>| page)
            .await?;
        Ok(prs
            .into_iter()
            .map(PullRequest::from)
            .filter(|pr| !query.merged_only || pr.merged)
            .filter(|pr| {
                query
                    .label
                    .as_ref()
                    .is_none_or(|label| pr.labels.iter().any(|l| l == label))
            })
            .collect())
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn get_pull_request_reviews(&self, number: u64) -> ForgeResult<Vec<Review>> {
        let url = format!(
            "{}?per_page={PER_PAGE}",
            self.repo_url(&format!("pulls/{number}/reviews"))
        );
        let reviews: Vec<GitHubReview> = self
            .get_all_pages(url, |page: Vec<GitHubReview>| page)
            .await?;
        Ok(reviews
            .into_iter()
            .map(|r| Review {
                user: r.user.map(|u| u.login).unwrap_or_default(),
                state: r.state,
            })
            .collect())
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn merge_pull_request(&self, number: u64, method: MergeMethod) -> ForgeResult<()> {
        let response = self
            .send(
                self.client
                    .put(self.repo_url(&format!("pulls/{number}/merge")))
                    .json(&MergeBody {
                        merge_method: method,
                    }),
            )
            .await?;
        Self::expect_success(response).await
    }

    #[instrument(skip(self, request), fields(repo = %self.full_name(), tag = %request.tag))]
    async fn create_release(&self, request: CreateRelease) -> ForgeResult<Release> {
        let body = NewRelease {
            tag_name: &request.tag,
            target_commitish: &request.target_commitish,
            name: &request.name,
            body: &request.body,
            prerelease: request.prerelease,
        };
        let response = self
            .send(self.client.post(self.repo_url("releases")).json(&body))
            .await?;
        let release: GitHubRelease = Self::handle_response(response).await?;
        Ok(Release {
            id: release.id,
            tag: release.tag_name,
            url: release.html_url,
        })
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn get_commit(&self, sha: &str) -> ForgeResult<CommitDetails> {
        let response = self
            .send(self.client.get(self.repo_url(&format!("commits/{sha}"))))
            .await?;
        let commit: GitHubCommit = Self::handle_response(response).await?;
        Ok(CommitDetails {
            sha: commit.sha,
            message: commit.commit.message,
            url: commit.html_url,
        })
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn get_diff_commits(&self, base: &str, head: &str) -> ForgeResult<Vec<String>> {
        let url = format!(
            "{}?per_page={PER_PAGE}",
            self.repo_url(&format!("compare/{base}...{head}"))
        );
        self.get_all_pages(url, |page: GitHubCompare| {
            page.commits.into_iter().map(|c| c.sha).collect()
        })
        .await
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn add_label_to_pull_request(&self, number: u64, label: &str) -> ForgeResult<()> {
        let response = self
            .send(
                self.client
                    .post(self.repo_url(&format!("issues/{number}/labels")))
                    .json(&LabelsBody { labels: [label] }),
            )
            .await?;
        Self::expect_success(response).await
    }

    #[instrument(skip(self), fields(repo = %self.full_name()))]
    async fn remove_label_from_pull_request(&self, number: u64, label: &str) -> ForgeResult<()> {
        let url = self.repo_url(&format!("issues/{number}/labels/{}", encode_segment(label)));
        let response = self.send(self.client.delete(url)).await?;
        match Self::expect_success(response).await {
            Err(ForgeError::NotFound(_)) => {
                debug!(number, label, "label was not present");
                Ok(())
            }
            other => other,
        }
    }
}

/// Percent-encode a single URL path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
