//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

/// strata - reproducible layered images for locked Python apps
///
/// Resolves a frozen lockfile, installs dependencies before the source
/// tree so source edits reuse the dependency layer, and writes an image
/// directory with the app's entry command.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the image
    Build(BuildArgs),

    /// Validate the lockfile against the manifest without building
    Check(ProjectArgs),

    /// Show build steps, cache keys and cache hits without building
    Plan(PlanArgs),

    /// Print an equivalent Containerfile
    Containerfile(ProjectArgs),

    /// Manage the cache store
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

impl Commands {
    /// Project directory the command was pointed at, if any
    pub fn project(&self) -> Option<&Path> {
        match self {
            Self::Build(args) => args.project.as_deref(),
            Self::Check(args) | Self::Containerfile(args) => args.project.as_deref(),
            Self::Plan(args) => args.project.as_deref(),
            Self::Cache(CacheArgs {
                action: CacheAction::Info { project },
            }) => project.as_deref(),
            Self::Cache(_) | Self::Config(_) => None,
        }
    }
}

/// Arguments shared by project commands
#[derive(Parser, Debug)]
pub struct ProjectArgs {
    /// Project directory (defaults to current directory)
    #[arg(short, long)]
    pub project: Option<PathBuf>,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Project directory (defaults to current directory)
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Image tag (defaults to image.tag, then `<project>:latest`)
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Directory images are written to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Ignore committed layers and rebuild every step
    #[arg(long)]
    pub no_cache: bool,

    /// Re-run the build this many times on transient fetch failures
    #[arg(long)]
    pub retries: Option<u32>,
}

/// Arguments for the plan command
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Project directory (defaults to current directory)
    #[arg(short, long)]
    pub project: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List artifacts and layers in the store
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show store location and the project's layer states
    Info {
        /// Project directory (defaults to current directory)
        #[arg(short, long)]
        project: Option<PathBuf>,
    },

    /// Remove entries older than N days
    Gc {
        /// Remove entries older than N days (default: from config)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove everything in the store
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build() {
        let cli = Cli::parse_from([
            "strata", "build", "--tag", "tools:dev", "--no-cache", "--retries", "2",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.tag.as_deref(), Some("tools:dev"));
                assert!(args.no_cache);
                assert_eq!(args.retries, Some(2));
                assert!(args.project.is_none());
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_parses_plan_json() {
        let cli = Cli::parse_from(["strata", "plan", "--format", "json", "-p", "app"]);
        assert_eq!(cli.command.project(), Some(Path::new("app")));
        match cli.command {
            Commands::Plan(args) => assert_eq!(args.format, OutputFormat::Json),
            _ => panic!("expected Plan command"),
        }
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["strata", "cache", "gc", "--days", "7", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
            }) => {
                assert_eq!(days, Some(7));
                assert!(dry_run);
            }
            _ => panic!("expected cache gc"),
        }
    }

    #[test]
    fn verbose_counts() {
        let cli = Cli::parse_from(["strata", "-vv", "check"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Check(_)));
    }

    #[test]
    fn config_action_optional() {
        let cli = Cli::parse_from(["strata", "config"]);
        match cli.command {
            Commands::Config(args) => assert!(args.action.is_none()),
            _ => panic!("expected Config command"),
        }
    }
}
