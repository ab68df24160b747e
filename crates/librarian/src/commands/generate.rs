//! Generate command: thin CLI layer over `librarian_core::generate`.

use anyhow::Context;
use camino::Utf8Path;
use chrono::Utc;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::RunContext;
use librarian_core::container::DockerGenerator;
use librarian_core::fetch::{SourceCache, cache_root};
use librarian_core::forge::Forge;
use librarian_core::generate::{Backends, GenerateOptions, plan_generate};

use super::{
    Progress, SourceArgs, finish_generate, github_forge, repo_root, show_generate_event,
    with_push_config,
};

/// Arguments for the `generate` subcommand.
#[derive(Args, Debug, Default)]
pub struct GenerateArgs {
    /// Only this library
    #[arg(long, value_name = "ID", conflicts_with = "api")]
    pub library: Option<String>,

    /// Only the library owning this API path
    #[arg(long, value_name = "PATH")]
    pub api: Option<String>,

    #[command(flatten)]
    pub source: SourceArgs,
}

/// The source cache configured for `ctx`.
pub fn source_cache(ctx: &RunContext) -> anyhow::Result<SourceCache> {
    let root = cache_root(ctx.config.cache_dir.as_deref()).context("no source cache directory")?;
    debug!(%root, "source cache");
    Ok(SourceCache::http(root))
}

/// Execute the generate command.
#[instrument(name = "cmd_generate", skip_all)]
pub async fn cmd_generate(
    args: GenerateArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let ctx = with_push_config(ctx, args.source.push_config.as_deref())?;
    let root = repo_root(args.source.repo.as_deref(), cwd);
    let options = GenerateOptions {
        library: args.library,
        api: args.api,
        ..args.source.generate_options()
    };
    debug!(%root, json_output = global_json, "executing generate command");

    let now = Utc::now();
    let plan = plan_generate(&ctx, &root, &options, now).context("generate planning failed")?;
    if !global_json {
        println!(
            "{}: {} ({} skipped)",
            "Generate".bold(),
            plan.libraries.join(", ").green(),
            plan.skipped.len()
        );
    }

    let forge = if options.push {
        Some(github_forge(&ctx, &root)?)
    } else {
        None
    };
    let cache = source_cache(&ctx)?;
    let generator = DockerGenerator::from_config(&ctx.config.container);

    let progress = Progress::start(&ctx, global_json, "resolving sources...");
    let backends = Backends {
        generator: &generator,
        cache: &cache,
        forge: forge.as_ref().map(|f| f as &dyn Forge),
    };
    let result = plan
        .execute(&ctx, backends, |event| show_generate_event(&progress, event))
        .await;
    progress.finish();

    let report = result.context("generate failed")?;
    finish_generate(&report, global_json)
}
