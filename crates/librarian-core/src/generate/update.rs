//! `update-apis`: regenerate libraries whose APIs changed upstream.

use std::ops::ControlFlow;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::{
    Backends, GenerateEvent, GenerateOptions, GenerateReport, GenerateResult, plan_generate,
    resolve_sources,
};
use crate::context::RunContext;
use crate::git::{GitError, Repo};
use crate::state::LibraryState;

/// Result of `update-apis`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    /// Libraries whose APIs changed since they were last generated.
    pub stale: Vec<String>,
    /// The regeneration of the stale libraries.
    pub generate: GenerateReport,
}

/// Whether any commit in `last..head` touches one of `library`'s APIs.
///
/// The walk stops at the first such commit.
pub fn apis_changed(
    api_repo: &Repo,
    library: &LibraryState,
    last: &str,
    head: &str,
) -> GenerateResult<bool> {
    if last == head {
        return Ok(false);
    }
    let paths: Vec<String> = library.apis.iter().map(|a| a.path.clone()).collect();
    let mut changed = false;
    api_repo.walk_log::<_, GitError>(&format!("{last}..{head}"), &paths, |sha| {
        debug!(library = %library.id, commit = sha, "API change found");
        changed = true;
        Ok(ControlFlow::Break(()))
    })?;
    Ok(changed)
}

/// Regenerate, against the API source HEAD, every selected library whose
/// APIs changed since its `last_generated_commit`.
///
/// Libraries never generated are skipped; `generate` handles those.
#[instrument(skip(ctx, options, backends, on_event), fields(%repo_root))]
pub async fn update_apis(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    options: &GenerateOptions,
    backends: Backends<'_>,
    now: DateTime<Utc>,
    mut on_event: impl FnMut(GenerateEvent),
) -> GenerateResult<UpdateReport> {
    let mut plan = plan_generate(ctx, repo_root, options, now)?;
    std::fs::create_dir_all(&plan.work_root).map_err(super::clean::io_err(&plan.work_root))?;
    let sources = resolve_sources(ctx, backends.cache, options, &plan.work_root, true).await?;
    on_event(GenerateEvent::SourcesResolved {
        api_label: sources.api_label.clone(),
        api_commit: sources.api_commit.clone(),
    });

    let mut stale = Vec::new();
    let mut never_generated = Vec::new();
    if let (Some(api_repo), Some(head)) = (sources.api_repo(), sources.api_commit.as_deref()) {
        for id in &plan.libraries {
            let Some(library) = plan.state.library(id) else {
                continue;
            };
            match library.last_generated_commit {
                Some(ref last) => {
                    if apis_changed(api_repo, library, last, head)? {
                        stale.push(id.clone());
                    }
                }
                None => never_generated.push(id.clone()),
            }
        }
    }
    info!(stale = stale.len(), "API changes checked");

    plan.retain_libraries("never generated", |id| !never_generated.iter().any(|n| n == id));
    plan.retain_libraries("up to date", |id| stale.iter().any(|s| s == id));
    let generate = plan.execute_with_sources(ctx, backends, &sources, on_event).await?;
    Ok(UpdateReport { stale, generate })
}
