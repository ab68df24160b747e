//! Publishing merged release pull requests.

use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::notes::parse_pull_request_body;
use super::{LibraryOutcome, ReleaseError, ReleaseResult};
use crate::context::RunContext;
use crate::forge::{
    CreateRelease, Forge, MergeMethod, PrState, PullRequest, PullRequestQuery, is_approved,
};
use crate::state::{LibrarianState, StateError, format_tag};

/// Options for `release tag-and-release`.
#[derive(Debug, Clone, Default)]
pub struct TagAndReleaseOptions {
    /// Handle only this pull request.
    pub pr: Option<u64>,
}

/// Releases created for one pull request.
#[derive(Debug, Clone, Serialize)]
pub struct PullRequestReleases {
    /// Pull request number.
    pub number: u64,
    /// Pull request URL.
    pub url: String,
    /// Outcome per library listed in the body, in body order.
    pub libraries: Vec<(String, LibraryOutcome)>,
    /// Whether the pending label was swapped for the done label.
    pub completed: bool,
}

/// Result of `release tag-and-release`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TagAndReleaseReport {
    /// One entry per pull request handled.
    pub pull_requests: Vec<PullRequestReleases>,
}

impl TagAndReleaseReport {
    /// Whether any library release failed.
    pub fn has_failures(&self) -> bool {
        self.pull_requests
            .iter()
            .flat_map(|pr| pr.libraries.iter())
            .any(|(_, outcome)| outcome.is_failure())
    }
}

/// Create tags and GitHub releases for merged release pull requests.
///
/// With `options.pr` only that pull request is handled; otherwise every
/// merged pull request carrying the pending label. Tag names follow each
/// library's `tag_format` from the state at `repo_root`, if present. The
/// label is swapped to the done label only when every library in the pull
/// request was released.
#[instrument(skip(ctx, forge, options), fields(%repo_root))]
pub async fn tag_and_release(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    forge: &dyn Forge,
    options: &TagAndReleaseOptions,
) -> ReleaseResult<TagAndReleaseReport> {
    let state = match LibrarianState::load(repo_root) {
        Ok(state) => Some(state),
        Err(StateError::NotFound(path)) => {
            debug!(%path, "no state, using default tag format");
            None
        }
        Err(err) => return Err(err.into()),
    };
    let labels = &ctx.config.release;

    let pull_requests = match options.pr {
        Some(number) => {
            let pr = forge.get_pull_request(number).await?;
            if !pr.merged {
                return Err(ReleaseError::NotMerged(number));
            }
            vec![pr]
        }
        None => {
            forge
                .list_pull_requests(&PullRequestQuery {
                    state: PrState::Closed,
                    label: Some(labels.pending_label.clone()),
                    merged_only: true,
                })
                .await?
        }
    };
    info!(count = pull_requests.len(), "release pull requests");

    let mut report = TagAndReleaseReport::default();
    for pr in pull_requests {
        if ctx.cancel.is_cancelled() {
            return Err(ReleaseError::Cancelled);
        }
        let Some(target) = pr.merge_commit_sha.clone() else {
            warn!(number = pr.number, "merged pull request has no merge commit");
            report.pull_requests.push(PullRequestReleases {
                number: pr.number,
                url: pr.url,
                libraries: Vec::new(),
                completed: false,
            });
            continue;
        };

        let entries = parse_pull_request_body(&pr.body);
        if entries.is_empty() {
            warn!(number = pr.number, "no release entries in pull request body");
        }

        let mut libraries = Vec::with_capacity(entries.len());
        for entry in entries {
            let tag_format = state
                .as_ref()
                .and_then(|s| s.library(&entry.id))
                .and_then(|l| l.tag_format.as_deref());
            let tag = format_tag(tag_format, &entry.id, &entry.version);
            let request = CreateRelease {
                tag: tag.clone(),
                target_commitish: target.clone(),
                name: format!("{} {}", entry.id, entry.version),
                body: entry.notes,
                prerelease: entry.version.contains('-'),
            };
            let outcome = match forge.create_release(request).await {
                Ok(release) => {
                    info!(library = %entry.id, %tag, url = %release.url, "release created");
                    LibraryOutcome::Released {
                        version: entry.version,
                        tag,
                    }
                }
                Err(err) => {
                    warn!(library = %entry.id, %tag, error = %err, "release failed");
                    LibraryOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            libraries.push((entry.id, outcome));
        }

        let completed = !libraries.is_empty() && libraries.iter().all(|(_, o)| !o.is_failure());
        if completed {
            forge
                .remove_label_from_pull_request(pr.number, &labels.pending_label)
                .await?;
            forge
                .add_label_to_pull_request(pr.number, &labels.done_label)
                .await?;
        }
        report.pull_requests.push(PullRequestReleases {
            number: pr.number,
            url: pr.url,
            libraries,
            completed,
        });
    }
    Ok(report)
}

/// Poll a release pull request until it is approved and mergeable, then
/// merge it.
///
/// Polls every `release.poll_interval_secs` up to
/// `release.max_poll_attempts` times. An already merged pull request is
/// returned as is.
#[instrument(skip(ctx, forge))]
pub async fn wait_and_merge(
    ctx: &RunContext,
    forge: &dyn Forge,
    number: u64,
) -> ReleaseResult<PullRequest> {
    let interval = Duration::from_secs(ctx.config.release.poll_interval_secs);
    let attempts = ctx.config.release.max_poll_attempts;

    for attempt in 1..=attempts {
        let pr = forge.get_pull_request(number).await?;
        if pr.merged {
            info!("already merged");
            return Ok(pr);
        }
        if pr.state == PrState::Closed {
            return Err(ReleaseError::NotMerged(number));
        }

        let reviews = forge.get_pull_request_reviews(number).await?;
        let approved = is_approved(&reviews);
        if approved && pr.mergeable == Some(true) {
            forge.merge_pull_request(number, MergeMethod::Squash).await?;
            info!(attempt, "merged");
            return Ok(forge.get_pull_request(number).await?);
        }

        debug!(attempt, approved, mergeable = ?pr.mergeable, "not ready to merge");
        if attempt == attempts {
            break;
        }
        tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ReleaseError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }

    Err(ReleaseError::MergeTimeout { number, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::forge::mock::{FailOn, MockForge, MockOperation};
    use crate::forge::{ForgeError, Review, ReviewState};
    use crate::release::notes::{ReleaseEntry, render_pull_request_body};
    use tempfile::TempDir;

    fn ctx() -> RunContext {
        RunContext::from_env(Config::default())
    }

    fn merged_pr(number: u64, body: String) -> PullRequest {
        PullRequest {
            number,
            url: format!("https://github.com/o/r/pull/{number}"),
            title: "chore: librarian release pull request".into(),
            body,
            head: "librarian-release".into(),
            base: "main".into(),
            state: PrState::Closed,
            merged: true,
            merge_commit_sha: Some("f".repeat(40)),
            mergeable: None,
            labels: vec!["release:pending".into()],
        }
    }

    fn open_pr(number: u64) -> PullRequest {
        PullRequest {
            state: PrState::Open,
            merged: false,
            merge_commit_sha: None,
            mergeable: Some(true),
            ..merged_pr(number, String::new())
        }
    }

    fn body(entries: &[(&str, &str)]) -> String {
        let entries: Vec<ReleaseEntry> = entries
            .iter()
            .map(|(id, version)| ReleaseEntry {
                id: id.to_string(),
                version: version.to_string(),
                notes: format!("notes for {id}"),
            })
            .collect();
        render_pull_request_body("gcr.io/p/gen:1", &entries)
    }

    fn root_with_state() -> (TempDir, camino::Utf8PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = camino::Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join(".librarian")).unwrap();
        std::fs::write(
            root.join(".librarian/state.yaml"),
            r#"image: gcr.io/p/gen:1
libraries:
  - id: foo
    version: 1.0.0
    apis:
      - path: google/foo/v1
    source_roots:
      - foo
    tag_format: "v{version}-{id}"
"#,
        )
        .unwrap();
        (tmp, root)
    }

    #[tokio::test]
    async fn releases_every_pending_pr_and_swaps_labels() {
        let (_tmp, root) = root_with_state();
        let forge = MockForge::new()
            .with_pull_request(merged_pr(7, body(&[("bar", "0.2.0"), ("foo", "1.1.0")])));

        let report = tag_and_release(&ctx(), &root, &forge, &TagAndReleaseOptions::default())
            .await
            .unwrap();

        assert!(!report.has_failures());
        let tags: Vec<String> = forge.releases().into_iter().map(|r| r.tag).collect();
        assert_eq!(tags, ["bar-0.2.0", "v1.1.0-foo"]);
        assert!(report.pull_requests[0].completed);
        assert_eq!(forge.pull_request(7).unwrap().labels, ["release:done"]);
    }

    #[tokio::test]
    async fn failed_release_keeps_pending_label() {
        let (_tmp, root) = root_with_state();
        let forge = MockForge::new()
            .with_pull_request(merged_pr(3, body(&[("bar", "0.2.0"), ("foo", "1.1.0")])));
        forge.fail_on(FailOn::CreateRelease {
            tag: "bar-0.2.0".into(),
            error: ForgeError::Api {
                status: 422,
                message: "tag exists".into(),
            },
        });

        let report = tag_and_release(
            &ctx(),
            &root,
            &forge,
            &TagAndReleaseOptions { pr: Some(3) },
        )
        .await
        .unwrap();

        assert!(report.has_failures());
        let pr = &report.pull_requests[0];
        assert!(!pr.completed);
        assert!(pr.libraries[0].1.is_failure());
        assert!(!pr.libraries[1].1.is_failure());
        assert_eq!(forge.pull_request(3).unwrap().labels, ["release:pending"]);
    }

    #[tokio::test]
    async fn unmerged_pr_is_rejected() {
        let (_tmp, root) = root_with_state();
        let forge = MockForge::new().with_pull_request(open_pr(4));
        let err = tag_and_release(&ctx(), &root, &forge, &TagAndReleaseOptions { pr: Some(4) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotMerged(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn merges_once_approved() {
        let forge = MockForge::new().with_pull_request(open_pr(9));
        forge.set_mergeable(9, None);

        let waiter = {
            let forge = forge.clone();
            tokio::spawn(async move { wait_and_merge(&ctx(), &forge, 9).await })
        };
        // Let the first poll observe an unapproved PR.
        tokio::time::sleep(Duration::from_secs(30)).await;
        forge.set_reviews(
            9,
            vec![Review {
                user: "maintainer".into(),
                state: ReviewState::Approved,
            }],
        );
        forge.set_mergeable(9, Some(true));

        let pr = waiter.await.unwrap().unwrap();
        assert!(pr.merged);
        assert!(forge.operations().contains(&MockOperation::Merge(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let mut config = Config::default();
        config.release.max_poll_attempts = 3;
        let ctx = RunContext::from_env(config);
        let forge = MockForge::new().with_pull_request(open_pr(2));

        let err = wait_and_merge(&ctx, &forge, 2).await.unwrap_err();
        assert!(matches!(err, ReleaseError::MergeTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let forge = MockForge::new().with_pull_request(open_pr(2));
        let err = wait_and_merge(&ctx, &forge, 2).await.unwrap_err();
        assert!(matches!(err, ReleaseError::Cancelled));
    }
}
