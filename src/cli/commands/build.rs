//! Build command - run the pipeline and write the image

use crate::audit::AuditLog;
use crate::cache::ArtifactFetcher;
use crate::cli::args::BuildArgs;
use crate::cli::commands::{open_store, ProjectSetup};
use crate::config::Config;
use crate::error::StrataResult;
use crate::layer::{BuildReport, Pipeline, Plan};
use crate::ui::{self, BuildProgress, UiContext};
use console::style;
use std::time::Duration;
use tracing::{info, warn};

/// Pause between attempts after a transient failure
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let mut setup = ProjectSetup::load(config, args.project.as_deref(), args.tag).await?;
    setup.settings.no_cache = args.no_cache;
    let output_dir = args.output.unwrap_or_else(|| setup.output_dir.clone());
    let retries = args.retries.unwrap_or(config.install.retries);

    let store = open_store(config)?;
    let fetcher = ArtifactFetcher::new(&setup.dir);
    let audit = AuditLog::new(config);
    let tag = setup.settings.tag.clone();

    audit
        .log(
            "build.started",
            &serde_json::json!({
                "tag": tag,
                "project": setup.dir.display().to_string(),
                "no_cache": args.no_cache,
            }),
        )
        .await;

    let mut attempt = 1;
    let report = loop {
        let progress = BuildProgress::new(&ctx, &tag, Plan::canonical().steps().len());
        let pipeline = Pipeline::new(&store, &fetcher, setup.settings.clone(), setup.inputs.clone())
            .with_observer(&progress);
        let result = pipeline.run(&output_dir).await;
        progress.finish();

        match result {
            Ok(report) => break report,
            Err(e) => {
                audit.build_failed(&tag, attempt, &e).await;
                if e.is_retryable() && attempt <= retries {
                    warn!("Attempt {} failed: {}", attempt, e);
                    ui::step_warn(
                        &ctx,
                        &format!("{} (retrying, attempt {} of {})", e, attempt + 1, retries + 1),
                    );
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                return Err(e);
            }
        }
    };

    audit.build_completed(&report, attempt).await;
    print_summary(&ctx, &report);
    Ok(())
}

fn print_summary(ctx: &UiContext, report: &BuildReport) {
    info!("Image {} written to {}", report.tag, report.image_dir.display());

    ui::outro_success(ctx, &format!("Built {}", report.tag));
    ui::key_value(ctx, "Image", &report.image_dir.display().to_string());
    ui::key_value(ctx, "Digest", &report.image_digest[..12]);
    ui::key_value(
        ctx,
        "Layers",
        &format!(
            "{} ({} cached)",
            report.steps.iter().filter(|s| s.digest.is_some()).count(),
            report.cache_hits()
        ),
    );
    ui::key_value(ctx, "Packages", &report.packages.len().to_string());
    if report.fetched > 0 {
        ui::key_value(ctx, "Fetched", &report.fetched.to_string());
    }
    ui::key_value(ctx, "Port", &report.launch.port.to_string());
    ui::key_value(ctx, "Command", &report.launch.argv().join(" "));

    let total: u64 = report.steps.iter().map(|s| s.duration_ms).sum();
    ui::remark(
        ctx,
        &format!(
            "{} in {}",
            style("done").dim(),
            format_duration(Duration::from_millis(total))
        ),
    );
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 60 {
        format!("{}m {}s", d.as_secs() / 60, d.as_secs() % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }
}
