//! `configure`: onboard a new library and generate it.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::{
    Backends, GenerateError, GenerateEvent, GenerateOptions, GenerateReport, GenerateResult,
    open_checked, plan_from_state, resolve_sources, work_root,
};
use crate::container::{ContainerCommand, ContainerRequest, read_configure_response, write_request};
use crate::context::RunContext;
use crate::state::{Api, LibrarianState, LibraryState, RepoConfig};

/// Options for `configure`.
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    /// API path of the new library, e.g. `google/cloud/foo/v1`.
    pub api: String,
    /// ID of the new library.
    pub library: String,
    /// How to generate it once configured. `library` and `api` are ignored.
    pub generate: GenerateOptions,
}

/// The library entry used when the container leaves no response.
pub fn default_library(id: &str, api: &str) -> LibraryState {
    LibraryState {
        id: id.to_string(),
        apis: vec![Api {
            path: api.to_string(),
            service_config: String::new(),
        }],
        source_roots: vec![api.to_string()],
        ..Default::default()
    }
}

/// Add `options.library` for `options.api` to the state, then generate it.
///
/// The `configure` container command may complete the library entry; its
/// response replaces the default one. The updated state is validated as a
/// whole before it is saved.
#[instrument(
    skip(ctx, options, backends, on_event),
    fields(%repo_root, library = %options.library)
)]
pub async fn configure(
    ctx: &RunContext,
    repo_root: &Utf8Path,
    options: &ConfigureOptions,
    backends: Backends<'_>,
    now: DateTime<Utc>,
    mut on_event: impl FnMut(GenerateEvent),
) -> GenerateResult<GenerateReport> {
    let generate = GenerateOptions {
        library: Some(options.library.clone()),
        api: None,
        ..options.generate.clone()
    };
    let repo = open_checked(ctx, repo_root, &generate)?;
    let mut state = LibrarianState::load(repo.root())?;
    let repo_config = RepoConfig::load(repo.root())?;
    if state.library(&options.library).is_some() {
        return Err(GenerateError::LibraryExists(options.library.clone()));
    }
    if let Some(owner) = state.library_for_api(&options.api) {
        return Err(GenerateError::InvalidOptions(format!(
            "API {} already belongs to library {}",
            options.api, owner.id
        )));
    }

    let work_root = work_root(&generate, now)?;
    std::fs::create_dir_all(&work_root).map_err(super::clean::io_err(&work_root))?;
    let sources = resolve_sources(ctx, backends.cache, &generate, &work_root, false).await?;
    on_event(GenerateEvent::SourcesResolved {
        api_label: sources.api_label.clone(),
        api_commit: sources.api_commit.clone(),
    });
    if !sources.api_dir.join(&options.api).is_dir() {
        return Err(GenerateError::MissingApi {
            library: options.library.clone(),
            path: options.api.clone(),
        });
    }

    let image = generate
        .image
        .clone()
        .unwrap_or_else(|| ctx.image(&state.image));
    let language = ctx.language(&image);
    let library_config = repo_config.library(&options.library);
    let librarian_dir = work_root.join(&options.library).join("librarian");
    let default = default_library(&options.library, &options.api);
    write_request(
        &librarian_dir,
        ContainerCommand::Configure,
        &default,
        library_config,
    )?;
    let request = ContainerRequest {
        command: ContainerCommand::Configure,
        image,
        library_id: options.library.clone(),
        librarian_dir: librarian_dir.clone(),
        api_source: Some(sources.api_dir.clone()),
        output: None,
        repo: Some(repo.root().to_path_buf()),
        sources: sources.extras.clone(),
        flags: language.generator_flags(library_config),
    };
    backends.generator.run(&request, &ctx.cancel).await?;

    let library = match read_configure_response(&librarian_dir)? {
        Some(response) if response.id != options.library => {
            return Err(GenerateError::InvalidOptions(format!(
                "configure returned library {:?}, expected {:?}",
                response.id, options.library
            )));
        }
        Some(response) => response,
        None => default,
    };
    state.libraries.push(library);
    state.libraries.sort_by(|a, b| a.id.cmp(&b.id));
    state.validate()?;
    state.save(repo.root())?;
    info!(library = %options.library, "library configured");
    on_event(GenerateEvent::LibraryConfigured {
        library: options.library.clone(),
    });

    let mut generate = generate;
    generate.work_root = Some(work_root);
    let plan = plan_from_state(ctx, repo, state, repo_config, &generate, now)?;
    plan.execute_with_sources(ctx, backends, &sources, on_event).await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{GenerateOutcome, LibraryStage};
    use super::*;
    use crate::container::RecordingGenerator;
    use crate::state::StateError;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn work_dir() -> (TempDir, Utf8PathBuf) {
        let tmp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, dir)
    }

    fn options(api_source: &Utf8Path, work: &Utf8Path) -> ConfigureOptions {
        ConfigureOptions {
            api: "google/baz/v1".into(),
            library: "baz".into(),
            generate: GenerateOptions {
                api_source: Some(api_source.to_string()),
                work_root: Some(work.to_path_buf()),
                ..Default::default()
            },
        }
    }

    fn apis_with_baz() -> Option<crate::git::testing::TestRepo> {
        let apis = api_repo()?;
        apis.commit("feat: baz", &[("google/baz/v1/baz.proto", "baz")]);
        Some(apis)
    }

    #[tokio::test]
    async fn adopts_container_response_and_generates() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = apis_with_baz() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let cache = cache(&work);
        let mut response = default_library("baz", "google/baz/v1");
        response.source_roots = vec!["packages/baz".into()];
        response.version = Some("0.1.0".into());
        let generator = RecordingGenerator::new()
            .with_configure_response(response)
            .with_output("baz", &[("packages/baz/baz.py", "baz")]);

        let mut events = Vec::new();
        let report = configure(
            &ctx,
            t.root(),
            &options(apis.root(), &work),
            backends(&generator, &cache),
            now(),
            |e| events.push(e),
        )
        .await
        .unwrap();

        assert!(matches!(
            report.libraries["baz"],
            GenerateOutcome::Succeeded {
                stage: LibraryStage::Generated,
                ..
            }
        ));
        assert_eq!(report.libraries.len(), 1);
        let state = LibrarianState::load(t.root()).unwrap();
        let ids: Vec<&str> = state.libraries.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, ["bar", "baz", "foo"]);
        let baz = state.library("baz").unwrap();
        assert_eq!(baz.source_roots, ["packages/baz"]);
        assert!(baz.last_generated_commit.is_some());
        assert!(t.root().join("packages/baz/baz.py").is_file());
        assert!(events.iter().any(
            |e| matches!(e, GenerateEvent::LibraryConfigured { library } if library == "baz")
        ));

        let commands: Vec<ContainerCommand> =
            generator.requests().iter().map(|r| r.command).collect();
        assert_eq!(commands, [ContainerCommand::Configure, ContainerCommand::Generate]);
    }

    #[tokio::test]
    async fn falls_back_to_default_entry() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = apis_with_baz() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let cache = cache(&work);

        configure(
            &ctx,
            t.root(),
            &options(apis.root(), &work),
            backends(&RecordingGenerator::new(), &cache),
            now(),
            |_| {},
        )
        .await
        .unwrap();
        let state = LibrarianState::load(t.root()).unwrap();
        assert_eq!(
            state.library("baz").unwrap().source_roots,
            ["google/baz/v1"]
        );
    }

    #[tokio::test]
    async fn rejects_existing_library_and_owned_api() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = apis_with_baz() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let cache = cache(&work);
        let generator = RecordingGenerator::new();

        let mut opts = options(apis.root(), &work);
        opts.library = "foo".into();
        let err = configure(&ctx, t.root(), &opts, backends(&generator, &cache), now(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::LibraryExists(_)));

        let mut opts = options(apis.root(), &work);
        opts.api = "google/foo/v1".into();
        let err = configure(&ctx, t.root(), &opts, backends(&generator, &cache), now(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::InvalidOptions(_)));
        assert!(generator.requests().is_empty());
    }

    #[tokio::test]
    async fn invalid_response_is_not_saved() {
        let Some(t) = language_repo() else { return };
        let Some(apis) = apis_with_baz() else { return };
        let (_tmp, work) = work_dir();
        let ctx = ctx(false);
        let cache = cache(&work);
        let mut response = default_library("baz", "google/baz/v1");
        response.source_roots = vec!["../outside".into()];
        let generator = RecordingGenerator::new().with_configure_response(response);

        let err = configure(
            &ctx,
            t.root(),
            &options(apis.root(), &work),
            backends(&generator, &cache),
            now(),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenerateError::State(StateError::Invalid { .. })));
        let state = LibrarianState::load(t.root()).unwrap();
        assert!(state.library("baz").is_none());
    }
}
