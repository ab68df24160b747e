//! Release commands: thin CLI layer over `librarian_core::release`.

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use clap::{Args, Subcommand};
use owo_colors::OwoColorize;
use tracing::{debug, instrument};

use librarian_core::RunContext;
use librarian_core::forge::Forge;
use librarian_core::release::{
    LibraryOutcome, ReleaseEvent, ReleaseInitOptions, TagAndReleaseOptions, plan_release_init,
    tag_and_release, wait_and_merge,
};

use super::{Progress, github_forge, repo_root, with_push_config};

/// Release subcommands.
#[derive(Subcommand, Debug)]
pub enum ReleaseCommand {
    /// Compute next versions, update state and changelogs, open a release PR
    Init(InitArgs),

    /// Tag and publish merged release pull requests
    TagAndRelease(TagAndReleaseArgs),

    /// Wait for a release pull request to be approved, then merge it
    MergePr(MergePrArgs),
}

/// Arguments for `release init`.
#[derive(Args, Debug, Default)]
pub struct InitArgs {
    /// Language repository (default: the current directory)
    #[arg(long, value_name = "DIR")]
    pub repo: Option<Utf8PathBuf>,

    /// Only release this library
    #[arg(long, value_name = "ID")]
    pub library: Option<String>,

    /// Release the library at this version if it is larger than the computed one
    #[arg(long, value_name = "VERSION", requires = "library")]
    pub library_version: Option<String>,

    /// Commit, push a branch and open a release pull request
    #[arg(long)]
    pub push: bool,

    /// Commit author for --push as EMAIL,NAME
    #[arg(long, value_name = "EMAIL,NAME")]
    pub push_config: Option<String>,

    /// Base branch of the pull request (default: the current branch)
    #[arg(long, value_name = "BRANCH")]
    pub branch: Option<String>,
}

/// Arguments for `release tag-and-release`.
#[derive(Args, Debug, Default)]
pub struct TagAndReleaseArgs {
    /// Language repository (default: the current directory)
    #[arg(long, value_name = "DIR")]
    pub repo: Option<Utf8PathBuf>,

    /// Only this pull request (default: every merged pending release PR)
    #[arg(long, value_name = "NUMBER")]
    pub pr: Option<u64>,
}

/// Arguments for `release merge-pr`.
#[derive(Args, Debug)]
pub struct MergePrArgs {
    /// Language repository (default: the current directory)
    #[arg(long, value_name = "DIR")]
    pub repo: Option<Utf8PathBuf>,

    /// The release pull request
    #[arg(long, value_name = "NUMBER")]
    pub pr: u64,
}

/// Execute a release subcommand.
pub async fn cmd_release(
    command: ReleaseCommand,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    match command {
        ReleaseCommand::Init(args) => cmd_init(args, global_json, ctx, cwd).await,
        ReleaseCommand::TagAndRelease(args) => {
            cmd_tag_and_release(args, global_json, ctx, cwd).await
        }
        ReleaseCommand::MergePr(args) => cmd_merge_pr(args, global_json, ctx, cwd).await,
    }
}

#[instrument(name = "cmd_release_init", skip_all)]
async fn cmd_init(
    args: InitArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let ctx = with_push_config(ctx, args.push_config.as_deref())?;
    let root = repo_root(args.repo.as_deref(), cwd);
    debug!(%root, push = args.push, "executing release init");
    let options = ReleaseInitOptions {
        library: args.library,
        library_version: args.library_version,
        push: args.push,
        branch: args.branch,
    };

    let plan = plan_release_init(&ctx, &root, &options).context("release planning failed")?;
    if !global_json {
        if plan.is_empty() {
            println!("{}", "Nothing to release.".yellow());
        }
        for release in &plan.releases {
            println!(
                "{}: {} → {} {}",
                release.id.bold(),
                release.previous_version.as_deref().unwrap_or("none").dimmed(),
                release.version.green().bold(),
                format!("({} commits)", release.commits.len()).dimmed()
            );
        }
        println!();
    }

    let forge = if options.push && !plan.is_empty() {
        Some(github_forge(&ctx, &root)?)
    } else {
        None
    };
    let progress = Progress::start(&ctx, global_json, "updating changelogs...");
    let result = plan
        .execute(
            &ctx,
            forge.as_ref().map(|f| f as &dyn Forge),
            Utc::now(),
            |event| match event {
                ReleaseEvent::LibraryUpdated { id, version } => progress.line(format!(
                    "  {} {} {}",
                    "✓".green(),
                    id.bold(),
                    version.dimmed()
                )),
                ReleaseEvent::Committed { branch } => {
                    progress.line(format!("  {} Committed on {}", "✓".green(), branch.cyan()));
                    progress.set("opening pull request...".to_string());
                }
                ReleaseEvent::PullRequestCreated { number, url } => progress.line(format!(
                    "  {} Release pull request #{} {}",
                    "✓".green(),
                    number,
                    url.cyan()
                )),
            },
        )
        .await;
    progress.finish();
    let report = result.context("release init failed")?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        for (id, outcome) in &report.libraries {
            print_outcome(id, outcome);
        }
    }
    if report.has_failures() {
        bail!("some libraries could not be prepared for release");
    }
    Ok(())
}

#[instrument(name = "cmd_tag_and_release", skip_all)]
async fn cmd_tag_and_release(
    args: TagAndReleaseArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let root = repo_root(args.repo.as_deref(), cwd);
    debug!(%root, pr = ?args.pr, "executing tag-and-release");
    let forge = github_forge(ctx, &root)?;

    let progress = Progress::start(ctx, global_json, "publishing releases...");
    let result = tag_and_release(ctx, &root, &forge, &TagAndReleaseOptions { pr: args.pr }).await;
    progress.finish();
    let report = result.context("tag-and-release failed")?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.pull_requests.is_empty() {
        println!("{}", "No merged release pull requests.".yellow());
    } else {
        for pr in &report.pull_requests {
            let label = if pr.completed {
                "done".green().to_string()
            } else {
                "still pending".yellow().to_string()
            };
            println!("{} {} ({label})", format!("#{}", pr.number).bold(), pr.url.cyan());
            for (id, outcome) in &pr.libraries {
                print_outcome(id, outcome);
            }
        }
    }
    if report.has_failures() {
        bail!("some releases could not be created");
    }
    Ok(())
}

#[instrument(name = "cmd_merge_pr", skip_all, fields(pr = args.pr))]
async fn cmd_merge_pr(
    args: MergePrArgs,
    global_json: bool,
    ctx: &RunContext,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    let root = repo_root(args.repo.as_deref(), cwd);
    let forge = github_forge(ctx, &root)?;

    let progress = Progress::start(
        ctx,
        global_json,
        &format!("waiting for approval of #{}...", args.pr),
    );
    let result = wait_and_merge(ctx, &forge, args.pr).await;
    progress.finish();
    let pr = result.with_context(|| format!("could not merge pull request #{}", args.pr))?;

    if global_json {
        println!("{}", serde_json::to_string_pretty(&pr)?);
    } else {
        println!(
            "{} Merged #{} {}",
            "✓".green().bold(),
            pr.number,
            pr.url.cyan()
        );
    }
    Ok(())
}

fn print_outcome(id: &str, outcome: &LibraryOutcome) {
    match outcome {
        LibraryOutcome::Released { version, tag } => {
            println!(
                "  {} {} {} {}",
                "✓".green(),
                id.bold(),
                version.green(),
                tag.dimmed()
            );
        }
        LibraryOutcome::Skipped { reason } => {
            println!(
                "  {} {} {}",
                "–".yellow(),
                id.bold(),
                format!("skipped: {reason}").dimmed()
            );
        }
        LibraryOutcome::Failed { error } => {
            println!("  {} {} {}", "✗".red(), id.bold(), error.red());
        }
    }
}
