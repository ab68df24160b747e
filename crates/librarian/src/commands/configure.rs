//! Configure command: onboard a library for an API and generate it.

use anyhow::Context;
use camino::Utf8Path;
use chrono::Utc;
use clap::Args;
use tracing::{debug, instrument};

use librarian_core::RunContext;
use librarian_core::container::DockerGenerator;
use librarian_core::forge::Forge;
use librarian_core::generate::{Backends, ConfigureOptions, configure};

use super::generate::source_cache;
use super::{
    Progress, SourceArgs, finish_generate, github_forge, repo_root, show_generate_event,
    with_push_config,
};

/// Arguments for the `configure` subcommand.
#[derive(Args, Debug)]
pub struct ConfigureArgs {
    /// API path of the new library, e.g. google/cloud/foo/v1
    #[arg(long, value_name = "PATH")]
    pub api: String,

    /// ID of the new library
    #[arg(long, value_name = "ID")]
    pub library: String,

    #[command(flatten)]
    pub source: SourceArgs,
}

/// Execute the configure command.
#[instrument(name = "cmd_configure", skip_all, fields(library = %args.library))]
pub async fn cmd_configure(
    args: ConfigureArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let ctx = with_push_config(ctx, args.source.push_config.as_deref())?;
    let root = repo_root(args.source.repo.as_deref(), cwd);
    debug!(%root, api = %args.api, "executing configure command");
    let options = ConfigureOptions {
        api: args.api,
        library: args.library,
        generate: args.source.generate_options(),
    };

    let forge = if options.generate.push {
        Some(github_forge(&ctx, &root)?)
    } else {
        None
    };
    let cache = source_cache(&ctx)?;
    let generator = DockerGenerator::from_config(&ctx.config.container);
    let backends = Backends {
        generator: &generator,
        cache: &cache,
        forge: forge.as_ref().map(|f| f as &dyn Forge),
    };

    let message = format!("configuring {}...", options.library);
    let progress = Progress::start(&ctx, global_json, &message);
    let result = configure(&ctx, &root, &options, backends, Utc::now(), |event| {
        show_generate_event(&progress, event);
    })
    .await;
    progress.finish();

    let report = result.with_context(|| format!("configure {} failed", options.library))?;
    finish_generate(&report, global_json)
}
