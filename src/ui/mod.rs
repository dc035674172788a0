//! Terminal output with a plain fallback for CI and pipes
//!
//! Interactive terminals get colored symbols and spinners; everything
//! else gets bracketed status tags, one line per event.
//!
//! ```rust,ignore
//! use strata::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Checking lockfile...");
//! spinner.stop("Lockfile matches manifest");
//! ui::key_value(&ctx, "Packages", "12");
//! ```

mod output;
mod progress;

pub use output::{
    key_value, outro_success, remark, step_error, step_info, step_ok, step_ok_detail, step_warn,
    UiContext,
};
pub use progress::{BuildProgress, TaskSpinner};
