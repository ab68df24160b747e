//! Doctor command: diagnose configuration and environment.

use camino::Utf8Path;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, instrument};

use librarian_core::config::{self, Config};
use librarian_core::context::{CI_ENV, REPOSITORY_ENV};
use librarian_core::fetch::{CACHE_ENV, cache_root};
use librarian_core::secrets::GITHUB_TOKEN_ENV;
use librarian_core::state::{LibrarianState, StateError};

/// Arguments for the `doctor` subcommand.
#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    // No subcommand-specific arguments; uses global --json flag
}

#[derive(Serialize)]
struct DoctorReport {
    config: ConfigStatus,
    directories: DirectoryPaths,
    runtime: RuntimeStatus,
    git: Option<String>,
    state: StateStatus,
    environment: Vec<EnvVar>,
}

#[derive(Serialize)]
struct ConfigStatus {
    /// Path to the project config file, if any
    file: Option<String>,
    found: bool,
}

#[derive(Serialize)]
struct DirectoryPaths {
    config: Option<String>,
    cache: Option<String>,
    logs: Option<String>,
}

#[derive(Serialize)]
struct RuntimeStatus {
    name: String,
    /// Resolved executable, when on `PATH`
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
enum StateStatus {
    Valid { image: String, libraries: usize },
    Missing,
    Invalid { error: String },
}

#[derive(Serialize)]
struct EnvVar {
    name: &'static str,
    /// Whether the variable is set; secrets are never echoed
    set: bool,
    value: Option<String>,
    description: &'static str,
}

impl EnvVar {
    fn read(name: &'static str, description: &'static str, secret: bool) -> Self {
        let value = std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            name,
            set: value.is_some(),
            value: if secret { None } else { value },
            description,
        }
    }
}

impl DoctorReport {
    fn gather(config: &Config, cwd: &Utf8Path) -> Self {
        let config_file = config::find_project_config(cwd);
        let runtime = &config.container.runtime;
        let state = match LibrarianState::load(cwd) {
            Ok(state) => StateStatus::Valid {
                image: state.image.clone(),
                libraries: state.libraries.len(),
            },
            Err(StateError::NotFound(_)) => StateStatus::Missing,
            Err(err) => StateStatus::Invalid {
                error: err.to_string(),
            },
        };

        Self {
            config: ConfigStatus {
                found: config_file.is_some(),
                file: config_file.map(|p| p.to_string()),
            },
            directories: DirectoryPaths {
                config: config::user_config_dir().map(|p| p.to_string()),
                cache: cache_root(config.cache_dir.as_deref())
                    .ok()
                    .map(|p| p.to_string()),
                logs: config
                    .log_dir
                    .clone()
                    .or_else(|| config::user_data_local_dir().map(|d| d.join("logs")))
                    .map(|p| p.to_string()),
            },
            runtime: RuntimeStatus {
                name: runtime.clone(),
                path: which::which(runtime).ok().map(|p| p.display().to_string()),
            },
            git: which::which("git").ok().map(|p| p.display().to_string()),
            state,
            environment: vec![
                EnvVar::read(GITHUB_TOKEN_ENV, "GitHub token for --push and releases", true),
                EnvVar::read(REPOSITORY_ENV, "Registry path for generator images", false),
                EnvVar::read(CACHE_ENV, "Source cache root", false),
                EnvVar::read(CI_ENV, "Non-interactive run", false),
                EnvVar::read("RUST_LOG", "Log filter directive", false),
            ],
        }
    }
}

/// Run diagnostics and report configuration status.
///
/// # Arguments
/// * `global_json` - Global `--json` flag from CLI
/// * `config` - Loaded configuration
/// * `cwd` - Current working directory
#[instrument(name = "cmd_doctor", skip_all)]
pub fn cmd_doctor(
    _args: DoctorArgs,
    global_json: bool,
    config: &Config,
    cwd: &Utf8Path,
) -> anyhow::Result<()> {
    debug!(json_output = global_json, "executing doctor command");

    let spinner = if global_json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Gathering diagnostics...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    let report = DoctorReport::gather(config, cwd);
    spinner.finish_and_clear();

    if global_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Configuration".bold().underline());
    match report.config.file {
        Some(ref file) => println!("  {} Config file: {}", "✓".green(), file.cyan()),
        None => println!("  {} No config file found (using defaults)", "○".yellow()),
    }
    println!();

    println!("{}", "Directories".bold().underline());
    print_dir("  Config", report.directories.config.as_deref());
    print_dir("  Source cache", report.directories.cache.as_deref());
    print_dir("  Logs", report.directories.logs.as_deref());
    println!();

    println!("{}", "Tools".bold().underline());
    print_tool(&report.runtime.name, report.runtime.path.as_deref());
    print_tool("git", report.git.as_deref());
    println!();

    println!("{}", "Repository".bold().underline());
    match report.state {
        StateStatus::Valid {
            ref image,
            libraries,
        } => println!(
            "  {} {} libraries, image {}",
            "✓".green(),
            libraries,
            image.cyan()
        ),
        StateStatus::Missing => println!(
            "  {} No .librarian/state.yaml in {}",
            "○".dimmed(),
            cwd.cyan()
        ),
        StateStatus::Invalid { ref error } => println!("  {} {}", "✗".red(), error.red()),
    }
    println!();

    println!("{}", "Environment".bold().underline());
    for var in &report.environment {
        let shown = match (var.set, var.value.as_deref()) {
            (false, _) => "(not set)".dimmed().to_string(),
            (true, Some(value)) => value.cyan().to_string(),
            (true, None) => "(set)".green().to_string(),
        };
        println!("  {}: {} {}", var.name.dimmed(), shown, var.description.dimmed());
    }

    Ok(())
}

fn print_dir(label: &str, path: Option<&str>) {
    print!("{}: ", label.dimmed());
    match path {
        Some(p) => println!("{}", p.cyan()),
        None => println!("{}", "(unavailable)".yellow()),
    }
}

fn print_tool(name: &str, path: Option<&str>) {
    match path {
        Some(p) => println!("  {} {}: {}", "✓".green(), name, p.cyan()),
        None => println!("  {} {}: {}", "✗".red(), name, "not found on PATH".yellow()),
    }
}
