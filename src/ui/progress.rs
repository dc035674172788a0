//! Progress indicators with CI fallback

use super::output::UiContext;
use crate::layer::{BuildStep, StepObserver, StepStatus};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = ProgressBar::new_spinner();
            if let Ok(s) = ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}") {
                spinner.set_style(s.tick_chars(TICK_CHARS));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(120));
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        self.finish();
        if self.interactive {
            println!("  {} {}", style("✓").green(), message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        self.finish();
        if self.interactive {
            println!("  {} {}", style("✗").red(), message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }

    fn finish(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

/// Step-by-step build progress.
///
/// Shows an indicatif bar over the plan's steps in interactive mode and
/// one line per finished step otherwise.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, tag: &str, steps: usize) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(steps as u64);
            if let Ok(s) = ProgressStyle::default_bar().template(
                "  {spinner:.cyan} Building {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}",
            ) {
                bar.set_style(s.tick_chars(TICK_CHARS).progress_chars("━╸─"));
            }
            bar.set_prefix(tag.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Building {}...", tag);
            None
        };
        Self { bar }
    }

    /// Finish and clear the progress bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

impl StepObserver for BuildProgress {
    fn step_changed(&self, step: BuildStep, status: &StepStatus) {
        match (&self.bar, status) {
            (Some(bar), StepStatus::Running) => bar.set_message(step.to_string()),
            (Some(bar), StepStatus::Complete { cache_hit }) => {
                let label = if *cache_hit { "cached" } else { "built" };
                bar.println(format!("  {} {} ({})", style("✓").green(), step, style(label).dim()));
                bar.inc(1);
            }
            (Some(bar), StepStatus::Failed) => {
                bar.println(format!("  {} {}", style("✗").red(), step));
            }
            (None, StepStatus::Running) => {}
            (None, StepStatus::Complete { cache_hit }) => {
                let label = if *cache_hit { "CACHED" } else { "DONE" };
                println!("  [{}] {}", label, step);
            }
            (None, StepStatus::Failed) => println!("  {} {}", style("[FAIL]").red(), step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Testing...");
        spinner.stop("Done");
        // Should not panic
    }

    #[test]
    fn build_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = BuildProgress::new(&ctx, "tools:latest", 5);
        progress.step_changed(BuildStep::ResolveLock, &StepStatus::Running);
        progress.step_changed(
            BuildStep::ResolveLock,
            &StepStatus::Complete { cache_hit: false },
        );
        progress.step_changed(BuildStep::InstallDependencies, &StepStatus::Failed);
        progress.finish();
    }
}
