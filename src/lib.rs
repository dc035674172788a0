//! strata - reproducible layered images for locked Python apps
//!
//! Validates a `pyproject.toml`/`uv.lock` pair in frozen mode, installs
//! third-party packages before the application source so source edits
//! reuse the dependency layer, and writes an image directory whose entry
//! process serves the app.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod entry;
pub mod error;
pub mod image;
pub mod install;
pub mod layer;
pub mod resolve;
pub mod ui;

pub use error::{StrataError, StrataResult};
