//! strata - reproducible layered images for locked Python apps
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{commands, Cli, Commands};
use strata::config::ConfigManager;
use strata::error::StrataResult;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StrataResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Project-local strata.toml is merged for commands that target a project
    let project_dir = strata::cli::commands::project_dir(cli.command.project()).ok();
    let config = match project_dir {
        Some(ref dir) => config_manager.load_for_project(dir).await?,
        None => config_manager.load().await?,
    };

    // 0 = warn (progress only), 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }

    ConfigManager::ensure_state_dirs().await?;

    match cli.command {
        Commands::Build(args) => commands::build(args, &config).await,
        Commands::Check(args) => commands::check(args, &config).await,
        Commands::Plan(args) => commands::plan(args, &config).await,
        Commands::Containerfile(args) => commands::containerfile(args, &config).await,
        Commands::Cache(args) => commands::cache(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    }
}
