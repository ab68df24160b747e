//! `release init`: compute next versions and prepare a release.
//!
//! Planning reads the repository and decides, per library, whether and to
//! which version it is released. Execution writes the new versions and
//! changelog sections, and with `push` opens a labelled release pull
//! request on a fresh branch.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::history::get_conventional_commits_since_last_release;
use super::notes::{
    ReleaseEntry, changelog_section, prepend_changelog, pull_request_title, render_notes,
    render_pull_request_body,
};
use super::{LibraryOutcome, ReleaseError, ReleaseResult};
use crate::commit::ConventionalCommit;
use crate::context::RunContext;
use crate::forge::{CreatePullRequest, Forge, ForgeError, PullRequest};
use crate::git::Repo;
use crate::state::{LIBRARIAN_DIR, LibrarianState, LibraryState, RepoConfig, StateError};
use crate::version::{VersionOverride, resolve_next_version};

// ──────────────────────────────────────────────
// Options and events
// ──────────────────────────────────────────────

/// Options for `release init`.
#[derive(Debug, Clone, Default)]
pub struct ReleaseInitOptions {
    /// Only consider this library.
    pub library: Option<String>,
    /// Release the selected library at this version if it is larger than
    /// the computed one.
    pub library_version: Option<String>,
    /// Commit, push and open a pull request.
    pub push: bool,
    /// Base branch of the pull request (default: the current branch).
    pub branch: Option<String>,
}

/// Progress events from [`ReleasePlan::execute`].
#[derive(Debug, Clone)]
pub enum ReleaseEvent {
    /// A library's version and changelog were updated.
    LibraryUpdated {
        /// Library ID.
        id: String,
        /// New version.
        version: String,
    },
    /// The release commit was created on `branch`.
    Committed {
        /// Release branch.
        branch: String,
    },
    /// The release pull request was opened.
    PullRequestCreated {
        /// Pull request number.
        number: u64,
        /// Web URL.
        url: String,
    },
}

// ──────────────────────────────────────────────
// Plan
// ──────────────────────────────────────────────

/// A library that will be released.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryRelease {
    /// Library ID.
    pub id: String,
    /// Version currently recorded in state.
    pub previous_version: Option<String>,
    /// Version being released.
    pub version: String,
    /// Tag the release will get.
    pub tag: String,
    /// Commits included, newest first.
    pub commits: Vec<ConventionalCommit>,
    /// Rendered release notes.
    pub notes: String,
    /// Changelog file that receives the notes.
    pub changelog: Utf8PathBuf,
}

/// Decisions for every considered library, ready to apply.
#[derive(Debug)]
pub struct ReleasePlan {
    repo: Repo,
    state: LibrarianState,
    base_branch: String,
    push: bool,
    /// Libraries to release, ascending by ID.
    pub releases: Vec<LibraryRelease>,
    /// Libraries that will not be released, with the reason.
    pub outcomes: BTreeMap<String, LibraryOutcome>,
}

/// Result of an executed release plan.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseInitReport {
    /// Outcome per library, ascending by ID.
    pub libraries: BTreeMap<String, LibraryOutcome>,
    /// The release pull request, when one was opened.
    pub pull_request: Option<PullRequest>,
}

impl ReleaseInitReport {
    /// Whether any library failed.
    pub fn has_failures(&self) -> bool {
        self.libraries.values().any(LibraryOutcome::is_failure)
    }
}

/// Decide what `release init` would do in the repository at `repo_root`.
///
/// Fails fast on configuration problems (missing token when pushing,
/// invalid state, unknown library). Per-library problems such as a missing
/// release tag are recorded as failures and do not stop the others.
#[instrument(skip(ctx, options), fields(%repo_root))]
pub fn plan_release_init(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    options: &ReleaseInitOptions,
) -> ReleaseResult<ReleasePlan> {
    if options.library_version.is_some() && options.library.is_none() {
        return Err(ReleaseError::InvalidOptions(
            "--library-version requires --library".to_string(),
        ));
    }
    if options.push && ctx.github_token().is_none() {
        return Err(ForgeError::AuthRequired.into());
    }

    let repo = Repo::open(repo_root)?;
    if options.push && !repo.is_clean()? {
        return Err(ReleaseError::InvalidOptions(
            "the working tree has uncommitted changes".to_string(),
        ));
    }
    let state = LibrarianState::load(repo.root())?;
    let repo_config = RepoConfig::load(repo.root())?;
    let language = ctx.language(&state.image);
    let changelog_name = ctx
        .config
        .release
        .changelog_file
        .clone()
        .unwrap_or_else(|| language.changelog_file().to_string());
    let repo_url = repo
        .remote_url(&ctx.config.git.remote)?
        .as_deref()
        .and_then(crate::git::parse_owner_repo)
        .map(|(owner, name)| format!("https://github.com/{owner}/{name}"));

    if let Some(ref id) = options.library
        && state.library(id).is_none()
    {
        return Err(StateError::UnknownLibrary(id.clone()).into());
    }

    let base_branch = match options.branch {
        Some(ref b) => b.clone(),
        None => repo.current_branch()?.unwrap_or_else(|| "main".to_string()),
    };

    let mut releases = Vec::new();
    let mut outcomes = BTreeMap::new();
    for library in state.sorted_libraries() {
        if options.library.as_ref().is_some_and(|id| *id != library.id) {
            continue;
        }
        if repo_config.release_blocked(&library.id) {
            debug!(library = %library.id, "release blocked");
            outcomes.insert(
                library.id.clone(),
                LibraryOutcome::Skipped {
                    reason: "release blocked".to_string(),
                },
            );
            continue;
        }

        let requested = options
            .library_version
            .as_deref()
            .map(VersionOverride::Explicit)
            .or_else(|| {
                repo_config
                    .library(&library.id)
                    .and_then(|l| l.next_version.as_deref())
                    .map(VersionOverride::Configured)
            });

        match plan_library(&repo, library, requested, repo_url.as_deref(), &changelog_name) {
            Ok(Some(release)) => {
                info!(library = %release.id, version = %release.version, "release planned");
                releases.push(release);
            }
            Ok(None) => {
                outcomes.insert(
                    library.id.clone(),
                    LibraryOutcome::Skipped {
                        reason: "nothing to release".to_string(),
                    },
                );
            }
            Err(err) => {
                warn!(library = %library.id, error = %err, "release planning failed");
                outcomes.insert(
                    library.id.clone(),
                    LibraryOutcome::Failed {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    Ok(ReleasePlan {
        repo,
        state,
        base_branch,
        push: options.push,
        releases,
        outcomes,
    })
}

fn plan_library(
    repo: &Repo,
    library: &LibraryState,
    requested: Option<VersionOverride<'_>>,
    repo_url: Option<&str>,
    changelog_name: &str,
) -> ReleaseResult<Option<LibraryRelease>> {
    let commits = get_conventional_commits_since_last_release(repo, library)?;
    let Some(version) = resolve_next_version(library.version.as_deref(), &commits, requested)?
    else {
        return Ok(None);
    };
    let first_root = library.source_roots.first().map_or(".", String::as_str);
    Ok(Some(LibraryRelease {
        id: library.id.clone(),
        previous_version: library.version.clone(),
        tag: library.tag_for(&version),
        notes: render_notes(&commits, repo_url),
        changelog: repo.root().join(first_root).join(changelog_name),
        version,
        commits,
    }))
}

// ──────────────────────────────────────────────
// Execute
// ──────────────────────────────────────────────

impl ReleasePlan {
    /// Whether there is anything to write.
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Apply the plan.
    ///
    /// Updates state and changelogs. When the plan was made with `push`,
    /// also commits on a new branch, pushes, opens the pull request through
    /// `forge` and labels it as pending.
    #[instrument(skip_all, fields(releases = self.releases.len(), push = self.push))]
    pub async fn execute(
        mut self,
        ctx: &RunContext,
        forge: Option<&dyn Forge>,
        now: DateTime<Utc>,
        mut on_event: impl FnMut(ReleaseEvent),
    ) -> ReleaseResult<ReleaseInitReport> {
        let mut libraries = self.outcomes;
        if self.releases.is_empty() {
            info!("nothing to release");
            return Ok(ReleaseInitReport {
                libraries,
                pull_request: None,
            });
        }

        let branch = format!("librarian-release-{}", now.format("%Y%m%dT%H%M%SZ"));
        if self.push {
            self.repo.checkout_new_branch(&branch)?;
        }

        let date = now.date_naive();
        for release in &self.releases {
            if ctx.cancel.is_cancelled() {
                return Err(ReleaseError::Cancelled);
            }
            self.state.library_mut(&release.id)?.version = Some(release.version.clone());
            prepend_changelog(
                &release.changelog,
                &changelog_section(&release.version, date, &release.notes),
            )?;
            on_event(ReleaseEvent::LibraryUpdated {
                id: release.id.clone(),
                version: release.version.clone(),
            });
            libraries.insert(
                release.id.clone(),
                LibraryOutcome::Released {
                    version: release.version.clone(),
                    tag: release.tag.clone(),
                },
            );
        }
        self.state.save(self.repo.root())?;

        if !self.push {
            return Ok(ReleaseInitReport {
                libraries,
                pull_request: None,
            });
        }

        let forge = forge.ok_or(ForgeError::AuthRequired)?;
        let entries: Vec<ReleaseEntry> = self
            .releases
            .iter()
            .map(|r| ReleaseEntry {
                id: r.id.clone(),
                version: r.version.clone(),
                notes: r.notes.clone(),
            })
            .collect();
        let title = pull_request_title(now);
        let body = render_pull_request_body(&self.state.image, &entries);

        let mut paths = vec![LIBRARIAN_DIR.to_string()];
        paths.extend(self.releases.iter().filter_map(|r| {
            r.changelog
                .strip_prefix(self.repo.root())
                .ok()
                .map(|p| p.to_string())
        }));
        self.repo.commit_paths(&title, &paths, &ctx.identity())?;
        on_event(ReleaseEvent::Committed {
            branch: branch.clone(),
        });
        self.repo.push(&ctx.config.git.remote, &branch)?;

        let pr = forge
            .create_pull_request(CreatePullRequest {
                head: branch,
                base: self.base_branch.clone(),
                title,
                body,
            })
            .await?;
        forge
            .add_label_to_pull_request(pr.number, &ctx.config.release.pending_label)
            .await?;
        on_event(ReleaseEvent::PullRequestCreated {
            number: pr.number,
            url: pr.url.clone(),
        });

        Ok(ReleaseInitReport {
            libraries,
            pull_request: Some(pr),
        })
    }
}
