//! librarian CLI
#![deny(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use librarian::{Cli, Commands, commands};
use librarian_core::RunContext;
use librarian_core::config::ConfigLoader;
use tracing::{debug, warn};

mod observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.color.apply();

    if let Some(ref dir) = cli.chdir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to change directory to {}", dir.display()))?;
    }

    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let cwd = camino::Utf8PathBuf::try_from(cwd).map_err(|e| {
        anyhow::anyhow!(
            "current directory is not valid UTF-8: {}",
            e.into_path_buf().display()
        )
    })?;
    let mut loader = ConfigLoader::new().with_project_search(&cwd);
    if let Some(ref config_path) = cli.config {
        let config_path = camino::Utf8PathBuf::try_from(config_path.clone()).map_err(|e| {
            anyhow::anyhow!(
                "config path is not valid UTF-8: {}",
                e.into_path_buf().display()
            )
        })?;
        loader = loader.with_file(&config_path);
    }
    let config = loader.load().context("failed to load configuration")?;

    let obs_config = observability::ObservabilityConfig::new(
        config
            .log_dir
            .as_ref()
            .map(|dir| dir.as_std_path().to_path_buf()),
        !cli.quiet,
    );
    let env_filter = observability::env_filter(cli.quiet, cli.verbose, config.log_level.as_str());
    let _guard = observability::init_observability(&obs_config, env_filter)
        .context("failed to initialize logging")?;

    let ctx = RunContext::from_env(config);
    debug!(
        verbose = cli.verbose,
        quiet = cli.quiet,
        json = cli.json,
        ci = ctx.ci,
        chdir = ?cli.chdir,
        "CLI initialized"
    );

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current step");
            cancel.cancel();
        }
    });

    let result = match cli.command {
        Commands::Configure(args) => {
            commands::configure::cmd_configure(args, cli.json, &ctx, &cwd).await
        }
        Commands::Generate(args) => {
            commands::generate::cmd_generate(args, cli.json, &ctx, &cwd).await
        }
        Commands::UpdateApis(args) => {
            commands::update_apis::cmd_update_apis(args, cli.json, &ctx, &cwd).await
        }
        Commands::Release(command) => {
            commands::release::cmd_release(command, cli.json, &ctx, &cwd).await
        }
        Commands::Version => commands::version::cmd_version(cli.json),
        Commands::Doctor(args) => commands::doctor::cmd_doctor(args, cli.json, &ctx.config, &cwd),
    };
    if let Err(ref err) = result {
        tracing::error!(error = %format_args!("{err:#}"), "fatal error");
    }
    result
}
