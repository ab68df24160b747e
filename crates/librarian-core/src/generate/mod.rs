//! Regenerating client libraries from API definitions.
//!
//! [`plan_generate`] does every check that can fail before any work starts:
//! state validity, library selection, the push token. [`GeneratePlan::execute`]
//! then resolves the shared sources and walks each library through
//!
//! ```text
//! Pending → SourceResolved → Cleaned → Generated → (Built) → (Committed) → (PullRequestCreated) → Done
//! ```
//!
//! one library at a time, in ascending ID order. A library that fails is
//! recorded with the stage it could not reach and the batch moves on; only
//! a failure to resolve the shared sources stops the whole batch.

pub mod clean;
pub mod configure;
pub mod message;
pub mod reconcile;
pub mod sources;
pub mod update;

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use clean::{CleanReport, clean_library};
pub use configure::{ConfigureOptions, configure};
pub use reconcile::{ReconcileReport, reconcile_output};
pub use sources::{ResolvedSources, resolve_sources};
pub use update::{UpdateReport, update_apis};

use crate::container::{
    ContainerCommand, ContainerError, ContainerRequest, Generator, write_request,
};
use crate::context::RunContext;
use crate::fetch::{FetchError, SourceCache};
use crate::forge::{CreatePullRequest, Forge, ForgeError, PullRequest};
use crate::git::{GitError, Repo};
use crate::language::Language;
use crate::state::{LIBRARIAN_DIR, LibrarianState, RepoConfig, StateError};

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

/// Errors from generate, configure and update-apis.
#[derive(Error, Debug)]
pub enum GenerateError {
    /// State or repository config problem.
    #[error(transparent)]
    State(#[from] StateError),

    /// Git failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// A source could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The generator container failed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The forge rejected a request.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// A preserve or remove pattern does not compile.
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        /// The pattern.
        pattern: String,
        /// Compiler error.
        source: regex::Error,
    },

    /// Filesystem error.
    #[error("{path}: {source}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Flags that do not fit together.
    #[error("{0}")]
    InvalidOptions(String),

    /// No library in the state owns the API.
    #[error("no library owns API {0:?}")]
    UnknownApi(String),

    /// A library's API directory is missing from the API source.
    #[error("library {library}: API {path:?} not found in the API source")]
    MissingApi {
        /// Library ID.
        library: String,
        /// API path.
        path: String,
    },

    /// `configure` was asked to add a library that already exists.
    #[error("library {0:?} already exists")]
    LibraryExists(String),

    /// The run was interrupted.
    #[error("cancelled")]
    Cancelled,
}

impl GenerateError {
    /// Whether this error comes from cancellation rather than a failure.
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Container(ContainerError::Cancelled)
                | Self::Fetch(FetchError::Cancelled)
        )
    }
}

/// Result alias for generate operations.
pub type GenerateResult<T> = Result<T, GenerateError>;

// ──────────────────────────────────────────────
// Stages, outcomes, events
// ──────────────────────────────────────────────

/// Where a library is in the generate pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryStage {
    /// Not started.
    Pending,
    /// API paths found in the shared sources.
    SourceResolved,
    /// Old generated files removed.
    Cleaned,
    /// Generator ran and its output was copied into the repository.
    Generated,
    /// Build container succeeded.
    Built,
    /// Changes committed.
    Committed,
    /// Pull request opened with the commit.
    PullRequestCreated,
    /// Finished.
    Done,
    /// Stopped by an error.
    Failed,
}

impl LibraryStage {
    /// Name used in output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SourceResolved => "source_resolved",
            Self::Cleaned => "cleaned",
            Self::Generated => "generated",
            Self::Built => "built",
            Self::Committed => "committed",
            Self::PullRequestCreated => "pull_request_created",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LibraryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one library fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum GenerateOutcome {
    /// Regenerated; `stage` is the last stage reached.
    Succeeded {
        /// Last stage reached.
        stage: LibraryStage,
        /// Generated files that were not allowed into the repository.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        skipped_files: Vec<String>,
    },
    /// Regenerated, but the result matched what was committed.
    NoChanges,
    /// Not attempted.
    Skipped {
        /// Why.
        reason: String,
    },
    /// Could not reach `stage`.
    Failed {
        /// Stage that failed.
        stage: LibraryStage,
        /// Error message.
        error: String,
    },
}

impl GenerateOutcome {
    /// Whether this is a failure.
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Progress events from [`GeneratePlan::execute`].
#[derive(Debug, Clone)]
pub enum GenerateEvent {
    /// `configure` added a library to the state.
    LibraryConfigured {
        /// Library ID.
        library: String,
    },
    /// Shared sources are ready.
    SourcesResolved {
        /// Where the API source came from.
        api_label: String,
        /// Its commit, when known.
        api_commit: Option<String>,
    },
    /// A library reached a stage.
    StageReached {
        /// Library ID.
        library: String,
        /// Stage reached.
        stage: LibraryStage,
    },
    /// A library failed.
    LibraryFailed {
        /// Library ID.
        library: String,
        /// Stage that failed.
        stage: LibraryStage,
        /// Error message.
        error: String,
    },
    /// The pull request was opened.
    PullRequestCreated {
        /// Pull request number.
        number: u64,
        /// Web URL.
        url: String,
    },
}

// ──────────────────────────────────────────────
// Options and plan
// ──────────────────────────────────────────────

/// Options for `generate`.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Only this library.
    pub library: Option<String>,
    /// Only the library owning this API path.
    pub api: Option<String>,
    /// Local checkout or `host/owner/name` of the API source.
    pub api_source: Option<String>,
    /// Fetch the API source at this commit instead of cloning it.
    pub api_source_commit: Option<String>,
    /// Image to run instead of the state's.
    pub image: Option<String>,
    /// Run the build container after generating.
    pub build: bool,
    /// Commit each regenerated library.
    pub commit: bool,
    /// Commit, push and open a pull request.
    pub push: bool,
    /// Base branch of the pull request (default: the current branch).
    pub branch: Option<String>,
    /// Scratch directory (default: a timestamped directory in the system
    /// temp dir).
    pub work_root: Option<Utf8PathBuf>,
}

impl GenerateOptions {
    pub(crate) const fn commits(&self) -> bool {
        self.commit || self.push
    }
}

/// The collaborators a generating command drives.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    /// Runs the language container.
    pub generator: &'a dyn Generator,
    /// Fetches pinned sources.
    pub cache: &'a SourceCache,
    /// Opens pull requests; needed only with `push`.
    pub forge: Option<&'a dyn Forge>,
}

/// Result of a generate run.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReport {
    /// Outcome per library, ascending by ID.
    pub libraries: BTreeMap<String, GenerateOutcome>,
    /// Commit of the API source the libraries were generated from.
    pub api_commit: Option<String>,
    /// Scratch directory with requests and staged output.
    pub work_root: Utf8PathBuf,
    /// The pull request, when one was opened.
    pub pull_request: Option<PullRequest>,
}

impl GenerateReport {
    /// Whether any library failed.
    pub fn has_failures(&self) -> bool {
        self.libraries.values().any(GenerateOutcome::is_failure)
    }
}

/// A checked generate run, ready to execute.
#[derive(Debug)]
pub struct GeneratePlan {
    repo: Repo,
    state: LibrarianState,
    repo_config: RepoConfig,
    language: Language,
    image: String,
    base_branch: String,
    started: DateTime<Utc>,
    options: GenerateOptions,
    /// Libraries to generate, ascending by ID.
    pub libraries: Vec<String>,
    /// Libraries that will not be generated.
    pub skipped: BTreeMap<String, GenerateOutcome>,
    /// Scratch directory.
    pub work_root: Utf8PathBuf,
}

/// Decide what `generate` would do in the repository at `repo_root`.
#[instrument(skip(ctx, options), fields(%repo_root))]
pub fn plan_generate(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    options: &GenerateOptions,
    now: DateTime<Utc>,
) -> GenerateResult<GeneratePlan> {
    if options.library.is_some() && options.api.is_some() {
        return Err(GenerateError::InvalidOptions(
            "--library and --api are mutually exclusive".to_string(),
        ));
    }
    let repo = open_checked(ctx, repo_root, options)?;
    let state = LibrarianState::load(repo.root())?;
    let repo_config = RepoConfig::load(repo.root())?;
    plan_from_state(ctx, repo, state, repo_config, options, now)
}

/// Checks shared by every generating command: the push token, then the
/// repository, then a clean working tree when committing.
pub(crate) fn open_checked(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    options: &GenerateOptions,
) -> GenerateResult<Repo> {
    if options.push && ctx.github_token().is_none() {
        return Err(ForgeError::AuthRequired.into());
    }
    let repo = Repo::open(repo_root)?;
    if options.commits() && !repo.is_clean()? {
        return Err(GenerateError::InvalidOptions(
            "the working tree has uncommitted changes".to_string(),
        ));
    }
    Ok(repo)
}

pub(crate) fn plan_from_state(
    ctx: &RunContext,
    repo: Repo,
    state: LibrarianState,
    repo_config: RepoConfig,
    options: &GenerateOptions,
    now: DateTime<Utc>,
) -> GenerateResult<GeneratePlan> {
    let selected: Vec<String> = if let Some(ref id) = options.library {
        if state.library(id).is_none() {
            return Err(StateError::UnknownLibrary(id.clone()).into());
        }
        vec![id.clone()]
    } else if let Some(ref api) = options.api {
        let library = state
            .library_for_api(api)
            .ok_or_else(|| GenerateError::UnknownApi(api.clone()))?;
        vec![library.id.clone()]
    } else {
        state.sorted_libraries().iter().map(|l| l.id.clone()).collect()
    };

    let mut libraries = Vec::new();
    let mut skipped = BTreeMap::new();
    for id in selected {
        if repo_config.generate_blocked(&id) {
            debug!(library = %id, "generation blocked");
            skipped.insert(
                id,
                GenerateOutcome::Skipped {
                    reason: "generate blocked".to_string(),
                },
            );
        } else {
            libraries.push(id);
        }
    }

    let work_root = work_root(options, now)?;
    let base_branch = match options.branch {
        Some(ref b) => b.clone(),
        None => repo.current_branch()?.unwrap_or_else(|| "main".to_string()),
    };
    let image = options
        .image
        .clone()
        .unwrap_or_else(|| ctx.image(&state.image));
    let language = ctx.language(&image);
    info!(libraries = libraries.len(), %work_root, %image, "generate planned");

    Ok(GeneratePlan {
        repo,
        state,
        repo_config,
        language,
        image,
        base_branch,
        started: now,
        options: options.clone(),
        libraries,
        skipped,
        work_root,
    })
}

pub(crate) fn work_root(
    options: &GenerateOptions,
    now: DateTime<Utc>,
) -> GenerateResult<Utf8PathBuf> {
    if let Some(ref dir) = options.work_root {
        return Ok(dir.clone());
    }
    let dir = std::env::temp_dir().join(format!("librarian-{}", now.format("%Y%m%dT%H%M%SZ")));
    Utf8PathBuf::from_path_buf(dir).map_err(|dir| {
        GenerateError::InvalidOptions(format!(
            "temporary directory {} is not valid UTF-8",
            dir.display()
        ))
    })
}

// ──────────────────────────────────────────────
// Execute
// ──────────────────────────────────────────────

impl GeneratePlan {
    /// Whether there is nothing to generate.
    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    /// Keep only the libraries for which `keep` holds; the others are
    /// reported as skipped with `reason`.
    pub fn retain_libraries(&mut self, reason: &str, mut keep: impl FnMut(&str) -> bool) {
        let (kept, dropped): (Vec<String>, Vec<String>) =
            self.libraries.drain(..).partition(|id| keep(id));
        self.libraries = kept;
        for id in dropped {
            self.skipped.insert(
                id,
                GenerateOutcome::Skipped {
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Resolve the shared sources and generate every planned library.
    pub async fn execute(
        self,
        ctx: &RunContext,
        backends: Backends<'_>,
        mut on_event: impl FnMut(GenerateEvent),
    ) -> GenerateResult<GenerateReport> {
        if self.libraries.is_empty() {
            info!("nothing to generate");
            return Ok(GenerateReport {
                libraries: self.skipped,
                api_commit: None,
                work_root: self.work_root,
                pull_request: None,
            });
        }
        create_dir(&self.work_root)?;
        let sources =
            resolve_sources(ctx, backends.cache, &self.options, &self.work_root, false).await?;
        on_event(GenerateEvent::SourcesResolved {
            api_label: sources.api_label.clone(),
            api_commit: sources.api_commit.clone(),
        });
        self.execute_with_sources(ctx, backends, &sources, on_event).await
    }

    /// Generate every planned library from already resolved sources.
    #[instrument(skip_all, fields(libraries = self.libraries.len(), push = self.options.push))]
    pub async fn execute_with_sources(
        mut self,
        ctx: &RunContext,
        backends: Backends<'_>,
        sources: &ResolvedSources,
        mut on_event: impl FnMut(GenerateEvent),
    ) -> GenerateResult<GenerateReport> {
        create_dir(&self.work_root)?;
        let branch = format!(
            "librarian-generate-{}",
            self.started.format("%Y%m%dT%H%M%SZ")
        );
        if self.options.push && !self.libraries.is_empty() {
            self.repo.checkout_new_branch(&branch)?;
        }

        let mut outcomes = std::mem::take(&mut self.skipped);
        let mut generated = false;
        for id in self.libraries.clone() {
            if ctx.cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            let mut stage = LibraryStage::Pending;
            let outcome = match self
                .generate_library(ctx, backends.generator, sources, &id, &mut stage, &mut on_event)
                .await
            {
                Ok(outcome) => {
                    generated = true;
                    outcome
                }
                Err(err) if err.is_cancelled() => return Err(GenerateError::Cancelled),
                Err(err) => {
                    warn!(library = %id, %stage, error = %err, "generation failed");
                    on_event(GenerateEvent::LibraryFailed {
                        library: id.clone(),
                        stage,
                        error: err.to_string(),
                    });
                    GenerateOutcome::Failed {
                        stage,
                        error: err.to_string(),
                    }
                }
            };
            outcomes.insert(id, outcome);
        }

        if generated && !self.options.commits() {
            self.state.save(self.repo.root())?;
        }

        let committed: Vec<String> = outcomes
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o,
                    GenerateOutcome::Succeeded {
                        stage: LibraryStage::Committed,
                        ..
                    }
                )
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut pull_request = None;
        if self.options.push && !committed.is_empty() {
            let forge = backends.forge.ok_or(ForgeError::AuthRequired)?;
            self.repo.push(&ctx.config.git.remote, &branch)?;
            let pr = forge
                .create_pull_request(CreatePullRequest {
                    head: branch,
                    base: self.base_branch.clone(),
                    title: message::pull_request_title(self.started),
                    body: message::pull_request_body(
                        &self.image,
                        &sources.api_label,
                        sources.api_commit.as_deref(),
                        &committed,
                    ),
                })
                .await?;
            info!(number = pr.number, url = %pr.url, "pull request created");
            for id in &committed {
                if let Some(GenerateOutcome::Succeeded { stage, .. }) = outcomes.get_mut(id) {
                    *stage = LibraryStage::PullRequestCreated;
                }
                on_event(GenerateEvent::StageReached {
                    library: id.clone(),
                    stage: LibraryStage::PullRequestCreated,
                });
            }
            on_event(GenerateEvent::PullRequestCreated {
                number: pr.number,
                url: pr.url.clone(),
            });
            pull_request = Some(pr);
        }

        for (id, outcome) in &outcomes {
            if matches!(
                outcome,
                GenerateOutcome::Succeeded { .. } | GenerateOutcome::NoChanges
            ) {
                on_event(GenerateEvent::StageReached {
                    library: id.clone(),
                    stage: LibraryStage::Done,
                });
            }
        }

        Ok(GenerateReport {
            libraries: outcomes,
            api_commit: sources.api_commit.clone(),
            work_root: self.work_root,
            pull_request,
        })
    }

    /// Run one library through the pipeline. `stage` tracks the stage being
    /// attempted so a failure can name it.
    #[instrument(skip(self, ctx, generator, sources, stage, on_event))]
    async fn generate_library(
        &mut self,
        ctx: &RunContext,
        generator: &dyn Generator,
        sources: &ResolvedSources,
        id: &str,
        stage: &mut LibraryStage,
        on_event: &mut impl FnMut(GenerateEvent),
    ) -> GenerateResult<GenerateOutcome> {
        let mut reached = |next: LibraryStage| {
            debug!(library = %id, stage = %next, "stage reached");
            on_event(GenerateEvent::StageReached {
                library: id.to_string(),
                stage: next,
            });
        };
        let library = self
            .state
            .library(id)
            .cloned()
            .ok_or_else(|| StateError::UnknownLibrary(id.to_string()))?;
        let library_config = self.repo_config.library(id).cloned();
        let repo_root = self.repo.root().to_path_buf();

        *stage = LibraryStage::SourceResolved;
        for api in &library.apis {
            if !sources.api_dir.join(&api.path).is_dir() {
                return Err(GenerateError::MissingApi {
                    library: id.to_string(),
                    path: api.path.clone(),
                });
            }
        }
        reached(LibraryStage::SourceResolved);

        *stage = LibraryStage::Cleaned;
        clean_library(&repo_root, &library)?;
        reached(LibraryStage::Cleaned);

        *stage = LibraryStage::Generated;
        let library_dir = self.work_root.join(id);
        let librarian_dir = library_dir.join("librarian");
        let output = library_dir.join("output");
        if output.exists() {
            std::fs::remove_dir_all(&output).map_err(clean::io_err(&output))?;
        }
        create_dir(&output)?;
        write_request(
            &librarian_dir,
            ContainerCommand::Generate,
            &library,
            library_config.as_ref(),
        )?;
        let flags = self.language.generator_flags(library_config.as_ref());
        let request = ContainerRequest {
            command: ContainerCommand::Generate,
            image: self.image.clone(),
            library_id: id.to_string(),
            librarian_dir: librarian_dir.clone(),
            api_source: Some(sources.api_dir.clone()),
            output: Some(output.clone()),
            repo: Some(repo_root.clone()),
            sources: sources.extras.clone(),
            flags,
        };
        generator.run(&request, &ctx.cancel).await?;
        let reconciled = reconcile_output(&output, &repo_root, &library, &self.repo_config)?;
        reached(LibraryStage::Generated);
        let mut last = LibraryStage::Generated;

        if self.options.build {
            if self.language.supports_build() {
                *stage = LibraryStage::Built;
                write_request(
                    &librarian_dir,
                    ContainerCommand::Build,
                    &library,
                    library_config.as_ref(),
                )?;
                let request = ContainerRequest {
                    command: ContainerCommand::Build,
                    output: None,
                    ..request
                };
                generator.run(&request, &ctx.cancel).await?;
                reached(LibraryStage::Built);
                last = LibraryStage::Built;
            } else {
                debug!(library = %id, language = %self.language.as_str(), "language has no build step");
            }
        }

        if let Some(ref commit) = sources.api_commit {
            self.state.library_mut(id)?.last_generated_commit = Some(commit.clone());
        }
        if !self.options.commits() {
            return Ok(GenerateOutcome::Succeeded {
                stage: last,
                skipped_files: reconciled.skipped,
            });
        }

        *stage = LibraryStage::Committed;
        self.state.save(&repo_root)?;
        let upstream = match (sources.api_repo(), sources.api_commit.as_deref()) {
            (Some(api_repo), Some(head)) => message::upstream_messages(api_repo, &library, head),
            _ => Vec::new(),
        };
        let text = message::commit_message(
            id,
            &sources.api_label,
            sources.api_commit.as_deref(),
            &upstream,
        );
        let mut paths = library.source_roots.clone();
        paths.push(LIBRARIAN_DIR.to_string());
        paths.extend(reconciled.global_files);
        if !self.repo.commit_paths(&text, &paths, &ctx.identity())? {
            info!(library = %id, "no changes to commit");
            return Ok(GenerateOutcome::NoChanges);
        }
        reached(LibraryStage::Committed);
        Ok(GenerateOutcome::Succeeded {
            stage: LibraryStage::Committed,
            skipped_files: reconciled.skipped,
        })
    }
}

fn create_dir(dir: &Utf8Path) -> GenerateResult<()> {
    std::fs::create_dir_all(dir).map_err(clean::io_err(dir))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::container::RecordingGenerator;
    use crate::forge::mock::MockForge;
    use crate::git::testing::TestRepo;
    use tempfile::TempDir;

    fn work_dir() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, dir)
    }

    #[test]
    fn push_without_token_fails_before_anything() {
        let options = GenerateOptions {
            push: true,
            ..Default::default()
        };
        let err = plan_generate(&ctx(false), Utf8Path::new("/nonexistent"), &options, now())
            .unwrap_err();
        assert!(matches!(err, GenerateError::Forge(ForgeError::AuthRequired)));
    }

    #[test]
    fn selects_by_api_and_skips_blocked() {
        let Some(t) = language_repo() else { return };
        let options = GenerateOptions {
            api: Some("google/foo/v1".into()),
            ..Default::default()
        };
        let plan = plan_generate(&ctx(false), t.root(), &options, now()).unwrap();
        assert_eq!(plan.libraries, ["foo"]);

        t.commit(
            "chore: block bar",
            &[(".librarian/config.yaml", "libraries:\n  - id: bar\n    generate_blocked: true\n")],
        );
        let plan =
            plan_generate(&ctx(false), t.root(), &GenerateOptions::default(), now()).unwrap();
        assert_eq!(plan.libraries, ["foo"]);
        assert!(matches!(plan.skipped["bar"], GenerateOutcome::Skipped { .. }));

        let options = GenerateOptions {
            api: Some("google/nope/v1".into()),
            ..Default::default()
        };
        let err = plan_generate(&ctx(false), t.root(), &options, now()).unwrap_err();
        assert!(matches!(err, GenerateError::UnknownApi(_)));
    }

    #[test]
    fn commit_needs_clean_tree() {
        let Some(t) = language_repo() else { return };
        t.write("foo/dirty.py", "x");
        let options = GenerateOptions {
            commit: true,
            ..Default::default()
        };
        let err = plan_generate(&ctx(false), t.root(), &options, now()).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidOptions(_)));
    }

    #[test]
    fn default_work_root_is_timestamped() {
        let Some(t) = language_repo() else { return };
        let plan =
            plan_generate(&ctx(false), t.root(), &GenerateOptions::default(), now()).unwrap();
        assert!(plan.work_root.as_str().ends_with("librarian-20261018T120000Z"));
    }

    #[tokio::test]
    async fn generates_into_repository_and_records_commit() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let generator = RecordingGenerator::new()
            .with_output("foo", &[("foo/gen/new.py", "new"), ("README.md", "x")])
            .with_output("bar", &[("bar/gen/bar.py", "bar2")]);

        let plan = plan_generate(&ctx, t.root(), &options(&apis, &work), now()).unwrap();
        let mut stages = Vec::new();
        let report = plan
            .execute(&ctx, backends(&generator, &cache(&work)), |e| {
                if let GenerateEvent::StageReached { library, stage } = e {
                    stages.push((library, stage));
                }
            })
            .await
            .unwrap();

        assert!(!report.has_failures());
        assert_eq!(
            report.libraries["foo"],
            GenerateOutcome::Succeeded {
                stage: LibraryStage::Generated,
                skipped_files: vec!["README.md".into()],
            }
        );
        assert!(!t.root().join("foo/gen/old.py").exists());
        assert!(t.root().join("foo/CHANGELOG.md").exists());
        assert_eq!(
            std::fs::read_to_string(t.root().join("foo/gen/new.py")).unwrap(),
            "new"
        );
        assert!(!t.root().join("README.md").exists());

        let head = apis.repo.head_sha().unwrap();
        let state = LibrarianState::load(t.root()).unwrap();
        assert_eq!(
            state.library("foo").unwrap().last_generated_commit.as_deref(),
            Some(head.as_str())
        );

        let foo: Vec<LibraryStage> = stages
            .iter()
            .filter(|(l, _)| l == "foo")
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(
            foo,
            [
                LibraryStage::SourceResolved,
                LibraryStage::Cleaned,
                LibraryStage::Generated,
                LibraryStage::Done,
            ]
        );

        let requests = generator.requests();
        let ids: Vec<&str> = requests.iter().map(|r| r.library_id.as_str()).collect();
        assert_eq!(ids, ["bar", "foo"]);
        assert!(work.join("foo/librarian/generate-request.json").is_file());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let generator = RecordingGenerator::new()
            .failing("bar", ContainerCommand::Generate, "protoc exploded")
            .with_output("foo", &[("foo/gen/new.py", "new")]);

        let plan = plan_generate(&ctx, t.root(), &options(&apis, &work), now()).unwrap();
        let report = plan
            .execute(&ctx, backends(&generator, &cache(&work)), |_| {})
            .await
            .unwrap();

        assert!(report.has_failures());
        match &report.libraries["bar"] {
            GenerateOutcome::Failed { stage, error } => {
                assert_eq!(*stage, LibraryStage::Generated);
                assert!(error.contains("protoc exploded"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            report.libraries["foo"],
            GenerateOutcome::Succeeded { .. }
        ));
        let state = LibrarianState::load(t.root()).unwrap();
        assert_eq!(state.library("bar").unwrap().last_generated_commit, None);
    }

    #[tokio::test]
    async fn build_failure_keeps_generated_files() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let generator = RecordingGenerator::new()
            .with_output("foo", &[("foo/gen/new.py", "new")])
            .failing("foo", ContainerCommand::Build, "tests failed");

        let mut options = options(&apis, &work);
        options.library = Some("foo".into());
        options.build = true;
        let plan = plan_generate(&ctx, t.root(), &options, now()).unwrap();
        let report = plan
            .execute(&ctx, backends(&generator, &cache(&work)), |_| {})
            .await
            .unwrap();

        assert!(matches!(
            report.libraries["foo"],
            GenerateOutcome::Failed {
                stage: LibraryStage::Built,
                ..
            }
        ));
        assert!(t.root().join("foo/gen/new.py").exists());
        let build = generator
            .requests()
            .into_iter()
            .find(|r| r.command == ContainerCommand::Build)
            .unwrap();
        assert!(build.output.is_none());
        assert_eq!(build.repo.as_deref(), Some(t.root()));
    }

    #[tokio::test]
    async fn missing_api_fails_that_library() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = TestRepo::new() else { return };
        apis.commit("feat: foo only", &[("google/foo/v1/foo.proto", "foo")]);
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);

        let plan = plan_generate(&ctx, t.root(), &options(&apis, &work), now()).unwrap();
        let report = plan
            .execute(&ctx, backends(&RecordingGenerator::new(), &cache(&work)), |_| {})
            .await
            .unwrap();
        assert!(matches!(
            report.libraries["bar"],
            GenerateOutcome::Failed {
                stage: LibraryStage::SourceResolved,
                ..
            }
        ));
        // Nothing was cleaned for the failed library.
        assert!(t.root().join("bar/gen/bar.py").exists());
    }

    #[tokio::test]
    async fn commits_per_library_and_reports_no_changes() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let generator = RecordingGenerator::new()
            .with_output("foo", &[("foo/gen/new.py", "new")])
            .with_output("bar", &[("bar/gen/bar.py", "bar")]);

        let mut options = options(&apis, &work);
        options.commit = true;
        let plan = plan_generate(&ctx, t.root(), &options, now()).unwrap();
        let report = plan
            .execute(&ctx, backends(&generator, &cache(&work)), |_| {})
            .await
            .unwrap();
        assert!(matches!(
            report.libraries["foo"],
            GenerateOutcome::Succeeded {
                stage: LibraryStage::Committed,
                ..
            }
        ));
        let head = t.repo.head_sha().unwrap();
        let message = t.repo.commit_message(&head).unwrap();
        assert!(message.starts_with("chore: regenerate foo"));
        assert!(t.repo.is_clean().unwrap());

        // Second run: same API commit, same output.
        let plan = plan_generate(&ctx, t.root(), &options, now()).unwrap();
        let report = plan
            .execute(&ctx, backends(&generator, &cache(&work)), |_| {})
            .await
            .unwrap();
        assert_eq!(report.libraries["foo"], GenerateOutcome::NoChanges);
        assert_eq!(report.libraries["bar"], GenerateOutcome::NoChanges);
        assert_eq!(t.repo.head_sha().unwrap(), head);
    }

    #[tokio::test]
    async fn push_opens_one_pull_request() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let _remote = add_remote(&t);
        let (_tmp, work) = work_dir();
        let ctx = ctx(true);
        let generator = RecordingGenerator::new().with_output("foo", &[("foo/gen/new.py", "new")]);
        let forge = MockForge::new();

        let mut options = options(&apis, &work);
        options.push = true;
        let plan = plan_generate(&ctx, t.root(), &options, now()).unwrap();
        let cache = cache(&work);
        let with_forge = Backends {
            forge: Some(&forge as &dyn Forge),
            ..backends(&generator, &cache)
        };
        let report = plan.execute(&ctx, with_forge, |_| {}).await.unwrap();

        let pr = report.pull_request.unwrap();
        assert_eq!(pr.head, "librarian-generate-20261018T120000Z");
        assert_eq!(pr.base, "main");
        assert!(pr.body.contains("* foo\n"));
        assert!(matches!(
            report.libraries["foo"],
            GenerateOutcome::Succeeded {
                stage: LibraryStage::PullRequestCreated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_batch() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = api_repo() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        ctx.cancel.cancel();

        let plan = plan_generate(&ctx, t.root(), &options(&apis, &work), now()).unwrap();
        let err = plan
            .execute(&ctx, backends(&RecordingGenerator::new(), &cache(&work)), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
