//! Command implementations

pub mod configure;

pub mod doctor;

pub mod generate;

pub mod release;

pub mod update_apis;

pub mod version;

use std::time::Duration;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use librarian_core::RunContext;
use librarian_core::forge::github::GitHubForge;
use librarian_core::generate::{GenerateEvent, GenerateOptions, GenerateOutcome, GenerateReport};
use librarian_core::git::Repo;

// ──────────────────────────────────────────────
// Shared arguments
// ──────────────────────────────────────────────

/// Arguments shared by the commands that run the generator.
#[derive(Args, Debug, Default, Clone)]
pub struct SourceArgs {
    /// Language repository (default: the current directory)
    #[arg(long, value_name = "DIR")]
    pub repo: Option<Utf8PathBuf>,

    /// API definitions: a local checkout or HOST/OWNER/NAME (default from config)
    #[arg(long, alias = "source", value_name = "SOURCE")]
    pub api_source: Option<String>,

    /// Fetch the API source at this commit instead of cloning it
    #[arg(long, value_name = "SHA")]
    pub api_source_commit: Option<String>,

    /// Generator image to run instead of the one in the state
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Run the build container after generating
    #[arg(long)]
    pub build: bool,

    /// Commit each regenerated library
    #[arg(long)]
    pub commit: bool,

    /// Commit, push a branch and open a pull request
    #[arg(long)]
    pub push: bool,

    /// Commit author for --commit/--push as EMAIL,NAME
    #[arg(long, value_name = "EMAIL,NAME")]
    pub push_config: Option<String>,

    /// Base branch of the pull request (default: the current branch)
    #[arg(long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Scratch directory for requests and staged output
    #[arg(long, alias = "work-root", value_name = "DIR")]
    pub output: Option<Utf8PathBuf>,
}

impl SourceArgs {
    /// Generate options for these arguments, without library selection.
    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            api_source: self.api_source.clone(),
            api_source_commit: self.api_source_commit.clone(),
            image: self.image.clone(),
            build: self.build,
            commit: self.commit,
            push: self.push,
            branch: self.branch.clone(),
            work_root: self.output.clone(),
            ..Default::default()
        }
    }
}

/// The language repository: `repo` resolved against `cwd`, or `cwd`.
pub fn repo_root(repo: Option<&Utf8Path>, cwd: &Utf8Path) -> Utf8PathBuf {
    match repo {
        Some(repo) if repo.is_absolute() => repo.to_path_buf(),
        Some(repo) => cwd.join(repo),
        None => cwd.to_path_buf(),
    }
}

/// `ctx` with the commit author replaced by a `--push-config` value.
pub fn with_push_config(ctx: &RunContext, push_config: Option<&str>) -> anyhow::Result<RunContext> {
    let mut ctx = ctx.clone();
    if let Some(value) = push_config {
        let Some((email, name)) = value.split_once(',') else {
            bail!("--push-config must be EMAIL,NAME, got {value:?}");
        };
        let (email, name) = (email.trim(), name.trim());
        if email.is_empty() || name.is_empty() {
            bail!("--push-config must be EMAIL,NAME, got {value:?}");
        }
        ctx.config.git.author_email = email.to_string();
        ctx.config.git.author_name = name.to_string();
    }
    Ok(ctx)
}

/// A GitHub client for the repository at `repo_root`.
pub fn github_forge(ctx: &RunContext, repo_root: &Utf8Path) -> anyhow::Result<GitHubForge> {
    let repo = Repo::open(repo_root)
        .with_context(|| format!("{repo_root} is not a git repository"))?;
    ctx.github_forge(&repo)
        .context("cannot determine the GitHub repository")
}

// ──────────────────────────────────────────────
// Progress display
// ──────────────────────────────────────────────

/// Terminal progress: a spinner for the current step, lines for results.
///
/// Nothing is shown with `--json`; under CI only the lines are.
pub struct Progress {
    bar: ProgressBar,
    lines: bool,
}

impl Progress {
    /// Start a spinner with `message`.
    pub fn start(ctx: &RunContext, json: bool, message: &str) -> Self {
        if json || ctx.ci {
            return Self {
                bar: ProgressBar::hidden(),
                lines: !json,
            };
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar, lines: true }
    }

    /// Replace the spinner message.
    pub fn set(&self, message: String) {
        self.bar.set_message(message);
    }

    /// Print a line above the spinner.
    pub fn line(&self, line: String) {
        if self.lines {
            self.bar.suspend(|| println!("{line}"));
        }
    }

    /// Remove the spinner.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Show a generate event.
pub fn show_generate_event(progress: &Progress, event: GenerateEvent) {
    match event {
        GenerateEvent::LibraryConfigured { library } => {
            progress.line(format!("  {} {} configured", "✓".green(), library.bold()));
        }
        GenerateEvent::SourcesResolved {
            api_label,
            api_commit,
        } => {
            let at = api_commit.map(|c| format!(" at {c}")).unwrap_or_default();
            progress.line(format!(
                "  {} API source {}{}",
                "✓".green(),
                api_label.cyan(),
                at.dimmed()
            ));
        }
        GenerateEvent::StageReached { library, stage } => {
            progress.set(format!("{library}: {stage}"));
        }
        GenerateEvent::LibraryFailed {
            library,
            stage,
            error,
        } => {
            progress.line(format!(
                "  {} {} failed at {}: {}",
                "✗".red(),
                library.bold(),
                stage,
                error.red()
            ));
        }
        GenerateEvent::PullRequestCreated { number, url } => {
            progress.line(format!(
                "  {} Pull request #{} {}",
                "✓".green(),
                number,
                url.cyan()
            ));
        }
    }
}

/// Print a generate report and fail when any library failed.
pub fn finish_generate(report: &GenerateReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!();
        for (id, outcome) in &report.libraries {
            print_generate_outcome(id, outcome);
        }
        let failed = report.libraries.values().filter(|o| o.is_failure()).count();
        let skipped = report
            .libraries
            .values()
            .filter(|o| matches!(o, GenerateOutcome::Skipped { .. }))
            .count();
        let succeeded = report.libraries.len() - failed - skipped;
        println!();
        println!(
            "{} succeeded, {} failed, {} skipped",
            succeeded.to_string().green(),
            failed.to_string().red(),
            skipped.to_string().yellow()
        );
        println!("{}: {}", "Work root".dimmed(), report.work_root.cyan());
    }
    if report.has_failures() {
        let failed = report.libraries.values().filter(|o| o.is_failure()).count();
        bail!("{failed} of {} libraries failed", report.libraries.len());
    }
    Ok(())
}

fn print_generate_outcome(id: &str, outcome: &GenerateOutcome) {
    match outcome {
        GenerateOutcome::Succeeded {
            stage,
            skipped_files,
        } => {
            println!("  {} {} {}", "✓".green(), id.bold(), stage.dimmed());
            for file in skipped_files {
                println!("      {} {}", "not written:".yellow(), file.dimmed());
            }
        }
        GenerateOutcome::NoChanges => {
            println!("  {} {} {}", "○".green(), id.bold(), "no changes".dimmed());
        }
        GenerateOutcome::Skipped { reason } => {
            println!(
                "  {} {} {}",
                "–".yellow(),
                id.bold(),
                format!("skipped: {reason}").dimmed()
            );
        }
        GenerateOutcome::Failed { stage, error } => {
            println!(
                "  {} {} {} {}",
                "✗".red(),
                id.bold(),
                format!("failed at {stage}:").red(),
                error
            );
        }
    }
}
