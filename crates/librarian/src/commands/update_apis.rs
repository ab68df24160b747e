//! Update-apis command: regenerate what changed upstream.

use anyhow::Context;
use camino::Utf8Path;
use chrono::Utc;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::RunContext;
use librarian_core::container::DockerGenerator;
use librarian_core::forge::Forge;
use librarian_core::generate::{Backends, GenerateOptions, update_apis};

use super::generate::source_cache;
use super::{
    Progress, SourceArgs, finish_generate, github_forge, repo_root, show_generate_event,
    with_push_config,
};

/// Arguments for the `update-apis` subcommand.
#[derive(Args, Debug, Default)]
pub struct UpdateApisArgs {
    /// Only consider this library
    #[arg(long, value_name = "ID")]
    pub library: Option<String>,

    #[command(flatten)]
    pub source: SourceArgs,
}

/// Execute the update-apis command.
#[instrument(name = "cmd_update_apis", skip_all)]
pub async fn cmd_update_apis(
    args: UpdateApisArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let ctx = with_push_config(ctx, args.source.push_config.as_deref())?;
    let root = repo_root(args.source.repo.as_deref(), cwd);
    debug!(%root, "executing update-apis command");
    let options = GenerateOptions {
        library: args.library,
        ..args.source.generate_options()
    };

    let forge = if options.push {
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

    let progress = Progress::start(&ctx, global_json, "checking API history...");
    let result = update_apis(&ctx, &root, &options, backends, Utc::now(), |event| {
        show_generate_event(&progress, event);
    })
    .await;
    progress.finish();

    let report = result.context("update-apis failed")?;
    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.generate.has_failures() {
            anyhow::bail!("some libraries failed to regenerate");
        }
        return Ok(());
    }
    if report.stale.is_empty() {
        println!("{} Every generated library is up to date", "✓".green());
    } else {
        println!(
            "{}: {}",
            "APIs changed".bold(),
            report.stale.join(", ").yellow()
        );
    }
    finish_generate(&report.generate, false)
}
