//! Output functions for consistent CLI formatting

use console::style;

/// Variables whose presence forces plain, line-per-event output
const PLAIN_VARS: &[&str] = &[
    "CI",
    "NO_COLOR",
    "STRATA_PLAIN",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
];

/// Whether status lines and build progress are drawn for a person at a
/// terminal or written as plain lines for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiContext {
    fancy: bool,
}

impl UiContext {
    /// Decide from stderr, where progress is drawn, and the environment
    pub fn detect() -> Self {
        Self::decide(console::user_attended_stderr(), |var| std::env::var(var).ok())
    }

    /// Plain output regardless of the terminal
    pub fn non_interactive() -> Self {
        Self { fancy: false }
    }

    /// Spinners, progress bars and symbols instead of bracketed tags
    pub fn use_fancy_output(&self) -> bool {
        self.fancy
    }

    fn decide(stderr_attended: bool, var: impl Fn(&str) -> Option<String>) -> Self {
        let dumb = var("TERM").is_some_and(|term| term == "dumb");
        let plain = dumb || PLAIN_VARS.iter().any(|&name| var(name).is_some());
        Self {
            fancy: stderr_attended && !plain,
        }
    }
}

/// Display success outro
pub fn outro_success(ctx: &UiContext, message: &str) {
    println!();
    if ctx.use_fancy_output() {
        println!("{} {}", style("✓").green(), style(message).green().bold());
    } else {
        println!("{} {}", style("[OK]").green(), message);
    }
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("✓").green(), message);
    } else {
        println!("  {} {}", style("[OK]").green(), message);
    }
}

/// Display a success step with detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {} ({})", style("✓").green(), message, style(detail).dim());
    } else {
        println!("  {} {} ({})", style("[OK]").green(), message, detail);
    }
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("!").yellow(), message);
    } else {
        println!("  {} {}", style("[WARN]").yellow(), message);
    }
}

/// Display an error step
pub fn step_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("✗").red(), message);
    } else {
        println!("  {} {}", style("[FAIL]").red(), message);
    }
}

/// Display an info step
pub fn step_info(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        println!("  {} {}", style("•").cyan(), message);
    } else {
        println!("  {} {}", style("[INFO]").cyan(), message);
    }
}

/// Display a remark/hint
pub fn remark(_ctx: &UiContext, message: &str) {
    println!("  {}", style(message).dim());
}

/// Print styled key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}
