//! Cache command - inspect and prune the cache store

use crate::cache::{format_bytes, ArtifactFetcher, CacheEntry, CacheState, CacheStore, EntryKind};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::cli::commands::{open_store, ProjectSetup};
use crate::config::Config;
use crate::error::StrataResult;
use crate::layer::Pipeline;
use chrono::Utc;
use console::style;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> StrataResult<()> {
    let store = open_store(config)?;

    match args.action {
        CacheAction::List { format } => list_entries(&store, format),
        CacheAction::Info { project } => show_info(&store, project, config).await,
        CacheAction::Gc { days, dry_run } => gc_entries(&store, config, days, dry_run),
        CacheAction::Clear { yes } => clear_store(&store, yes),
    }
}

/// List artifacts and layers
fn list_entries(store: &CacheStore, format: OutputFormat) -> StrataResult<()> {
    let entries = store.entries()?;

    if entries.is_empty() && format != OutputFormat::Json {
        println!("Cache store is empty.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_entry_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{} {}", entry.kind, entry.name);
            }
        }
    }
    Ok(())
}

fn print_entry_table(entries: &[CacheEntry]) {
    println!(
        "{:<10} {:<36} {:<10} {:>10} {:<17}",
        "KIND", "NAME", "STATE", "SIZE", "CREATED"
    );
    println!("{}", "-".repeat(87));

    for entry in entries {
        let state = match entry.state {
            CacheState::Complete => style("complete").green().to_string(),
            CacheState::Building => style("building").yellow().to_string(),
            CacheState::Miss => style("miss").dim().to_string(),
        };
        let name = match entry.kind {
            EntryKind::Layer => entry.name[..entry.name.len().min(16)].to_string(),
            EntryKind::Artifact => entry.name.clone(),
        };
        println!(
            "{:<10} {:<36} {:<10} {:>10} {:<17}",
            entry.kind,
            name,
            state,
            format_bytes(entry.size_bytes),
            entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!();
    println!("Total: {} entr(ies), {}", entries.len(), format_bytes(total));
}

/// Show the store location and the project's layer states
async fn show_info(
    store: &CacheStore,
    project: Option<PathBuf>,
    config: &Config,
) -> StrataResult<()> {
    let entries = store.entries()?;
    let artifacts = entries.iter().filter(|e| e.kind == EntryKind::Artifact).count();
    let layers = entries.len() - artifacts;
    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();

    println!("Store: {}", store.root().display());
    println!(
        "  {} artifact(s), {} layer(s), {}",
        artifacts,
        layers,
        format_bytes(total)
    );
    println!();

    let setup = ProjectSetup::load(config, project.as_deref(), None).await?;
    println!("Project: {} ({})", setup.dir.display(), setup.settings.tag);

    let fetcher = ArtifactFetcher::new(&setup.dir);
    let rows = Pipeline::new(store, &fetcher, setup.settings, setup.inputs)
        .plan()
        .await?;
    for row in rows.iter().filter(|r| r.step.produces_layer()) {
        let (marker, label) = match row.state {
            Some(CacheState::Complete) => (style("✓").green(), "cached"),
            Some(CacheState::Building) => (style("~").yellow(), "interrupted"),
            Some(CacheState::Miss) => (style("○").dim(), "will build"),
            None => (style("?").dim(), "unknown"),
        };
        println!("  {} {} [{}]", marker, row.step, label);
    }

    Ok(())
}

/// Remove entries older than the configured age
fn gc_entries(
    store: &CacheStore,
    config: &Config,
    days_override: Option<u32>,
    dry_run: bool,
) -> StrataResult<()> {
    let gc_days = days_override.unwrap_or(config.cache.gc_days);

    if gc_days == 0 {
        println!("Cache GC is disabled (gc_days = 0)");
        return Ok(());
    }

    let entries = store.entries()?;
    let to_remove: Vec<&CacheEntry> = entries
        .iter()
        .filter(|e| e.is_older_than_days(gc_days) || e.state == CacheState::Building)
        .collect();

    if to_remove.is_empty() {
        println!("No entries older than {} days.", gc_days);
        return Ok(());
    }

    println!("Found {} entr(ies) to remove:", to_remove.len());
    for entry in &to_remove {
        let age_days = (Utc::now() - entry.created_at).num_days();
        println!(
            "  {} {} {} ({} days old, {})",
            style("•").red(),
            entry.kind,
            entry.name,
            age_days,
            format_bytes(entry.size_bytes)
        );
    }

    if dry_run {
        println!();
        println!("Dry run - nothing removed.");
        return Ok(());
    }

    let _lock = store.lock_for_pruning()?;
    println!();
    print!("Removing entries... ");
    let _ = io::stdout().flush();

    let mut freed = 0;
    for entry in &to_remove {
        if !entry.path.exists() {
            continue;
        }
        debug!("Removing {} {}", entry.kind, entry.name);
        store.remove(entry)?;
        freed += entry.size_bytes;
    }

    println!(
        "{} removed {} entr(ies), freed {}",
        style("✓").green(),
        to_remove.len(),
        format_bytes(freed)
    );
    Ok(())
}

/// Remove everything in the store
fn clear_store(store: &CacheStore, skip_confirm: bool) -> StrataResult<()> {
    let entries = store.entries()?;
    if entries.is_empty() {
        println!("Cache store is already empty.");
        return Ok(());
    }

    println!(
        "This will remove {} entr(ies) from {}",
        entries.len(),
        store.root().display()
    );

    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            println!("Failed to read input, aborting.");
            return Ok(());
        }

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let _lock = store.lock_for_pruning()?;
    let freed = store.clear()?;
    println!("{} cleared cache store, freed {}", style("✓").green(), format_bytes(freed));
    Ok(())
}
