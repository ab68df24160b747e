//! Resolving the API source and extra upstream sources shared by a batch.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, instrument};

use super::{GenerateError, GenerateOptions, GenerateResult};
use crate::config::API_SOURCE_NAME;
use crate::context::RunContext;
use crate::fetch::{SourceCache, SourceRef};
use crate::git::{GitError, Repo};

/// Upstream trees every library of a batch generates from.
#[derive(Debug)]
pub struct ResolvedSources {
    /// API definitions, mounted at `/apis`.
    pub api_dir: Utf8PathBuf,
    /// Commit of the API source, when known.
    pub api_commit: Option<String>,
    /// Human-readable origin of the API source.
    pub api_label: String,
    /// Extra sources by name, mounted under `/sources`.
    pub extras: BTreeMap<String, Utf8PathBuf>,
    pub(crate) api_repo: Option<Repo>,
}

impl ResolvedSources {
    /// The API source as a git repository, when it has history.
    pub fn api_repo(&self) -> Option<&Repo> {
        self.api_repo.as_ref()
    }
}

enum ApiLocation {
    Local(Utf8PathBuf),
    Clone(String),
    Pinned { repo: String, commit: String },
}

fn locate(ctx: &RunContext, options: &GenerateOptions) -> ApiLocation {
    let source = options
        .api_source
        .clone()
        .unwrap_or_else(|| ctx.config.api_source.repo.clone());
    if Utf8Path::new(&source).is_dir() {
        return ApiLocation::Local(Utf8PathBuf::from(source));
    }
    match options.api_source_commit {
        Some(ref commit) => ApiLocation::Pinned {
            repo: source,
            commit: commit.clone(),
        },
        None => ApiLocation::Clone(source),
    }
}

/// Resolve every shared source for a batch.
///
/// The API source is a local directory, a clone into `work_root`, or a
/// cached tarball when a commit is pinned. Tarballs are fetched
/// concurrently with the configured extra sources. With `need_history`
/// the API source must be a git repository.
#[instrument(skip_all, fields(%work_root))]
pub async fn resolve_sources(
    ctx: &RunContext,
    cache: &SourceCache,
    options: &GenerateOptions,
    work_root: &Utf8Path,
    need_history: bool,
) -> GenerateResult<ResolvedSources> {
    if ctx.config.sources.contains_key(API_SOURCE_NAME) {
        return Err(GenerateError::InvalidOptions(format!(
            "source name {API_SOURCE_NAME:?} is reserved for the API source"
        )));
    }
    let mut refs: Vec<SourceRef> = ctx
        .config
        .sources
        .iter()
        .map(|(name, s)| SourceRef {
            name: name.clone(),
            repo: s.repo.clone(),
            commit: s.commit.clone(),
            sha256: s.sha256.clone(),
        })
        .collect();

    let (api_dir, api_repo, api_label, pinned_commit) = match locate(ctx, options) {
        ApiLocation::Local(dir) => {
            let repo = match Repo::open(&dir) {
                Ok(repo) => Some(repo),
                Err(GitError::NotARepo(_)) => None,
                Err(err) => return Err(err.into()),
            };
            let label = dir.to_string();
            (Some(dir), repo, label, None)
        }
        ApiLocation::Clone(source) => {
            let url = if source.contains("://") {
                source.clone()
            } else {
                format!("https://{source}")
            };
            let dest = work_root.join(API_SOURCE_NAME);
            info!(%url, %dest, "cloning API source");
            let repo = Repo::clone(&url, &dest, ctx.ci)?;
            (Some(dest), Some(repo), source, None)
        }
        ApiLocation::Pinned { repo, commit } => {
            if need_history {
                return Err(GenerateError::InvalidOptions(
                    "the API source history is needed; use a local checkout or omit --api-source-commit"
                        .to_string(),
                ));
            }
            refs.push(SourceRef {
                name: API_SOURCE_NAME.to_string(),
                repo: repo.clone(),
                commit: commit.clone(),
                sha256: None,
            });
            (None, None, repo, Some(commit))
        }
    };
    if need_history && api_repo.is_none() {
        return Err(GenerateError::InvalidOptions(format!(
            "API source {api_label} is not a git repository"
        )));
    }

    let mut fetched = if refs.is_empty() {
        BTreeMap::new()
    } else {
        cache.fetch_all(&refs, &ctx.cancel).await?
    };
    let api_dir = match api_dir {
        Some(dir) => dir,
        None => fetched
            .remove(API_SOURCE_NAME)
            .ok_or_else(|| {
                GenerateError::InvalidOptions("API source was not fetched".to_string())
            })?,
    };
    let api_commit = match (pinned_commit, &api_repo) {
        (Some(commit), _) => Some(commit),
        (None, Some(repo)) => Some(repo.head_sha()?),
        (None, None) => None,
    };

    debug!(%api_dir, commit = ?api_commit, extras = fetched.len(), "sources resolved");
    Ok(ResolvedSources {
        api_dir,
        api_commit,
        api_label,
        extras: fetched,
        api_repo,
    })
}
