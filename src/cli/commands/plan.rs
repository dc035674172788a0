//! Plan command - cache keys and hit/miss states without building

use crate::cache::{ArtifactFetcher, CacheState};
use crate::cli::args::{OutputFormat, PlanArgs};
use crate::cli::commands::{open_store, ProjectSetup};
use crate::config::Config;
use crate::error::StrataResult;
use crate::layer::{Pipeline, PlannedStep};
use console::style;

/// Execute the plan command
pub async fn execute(args: PlanArgs, config: &Config) -> StrataResult<()> {
    let setup = ProjectSetup::load(config, args.project.as_deref(), None).await?;
    let store = open_store(config)?;
    let fetcher = ArtifactFetcher::new(&setup.dir);
    let tag = setup.settings.tag.clone();

    let rows = Pipeline::new(&store, &fetcher, setup.settings, setup.inputs)
        .plan()
        .await?;

    match args.format {
        OutputFormat::Table => print_plan_table(&tag, &rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{} {}", row.step, row.cache_key.as_deref().unwrap_or("-"));
            }
        }
    }
    Ok(())
}

fn print_plan_table(tag: &str, rows: &[PlannedStep]) {
    println!("Plan for {}", style(tag).bold());
    println!();
    println!("{:<22} {:<28} {:<14} {:<10}", "STEP", "INPUTS", "KEY", "STATE");
    println!("{}", "-".repeat(76));

    for row in rows {
        let inputs: Vec<String> = row.inputs.iter().map(|i| i.to_string()).collect();
        let key = row
            .cache_key
            .as_deref()
            .map(|k| k[..12].to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = match row.state {
            Some(CacheState::Complete) => style("hit").green().to_string(),
            Some(CacheState::Building) => style("partial").yellow().to_string(),
            Some(CacheState::Miss) => style("miss").dim().to_string(),
            None => "-".to_string(),
        };
        println!(
            "{:<22} {:<28} {:<14} {:<10}",
            row.step,
            inputs.join(","),
            key,
            state
        );
        if let Some(note) = &row.note {
            println!("  {} {}", style("!").yellow(), style(note).dim());
        }
    }
}
