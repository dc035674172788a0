//! Layer sequencing
//!
//! Build steps run in a fixed order, least likely to change first. Each
//! layer-producing step is keyed by its parent layer, its command and the
//! digests of the inputs it declares, so a layer is rebuilt only when
//! something it actually reads has changed.

pub mod cache;
pub mod containerfile;
pub mod digest;
pub mod sequencer;
pub mod step;

pub use cache::{cache_key, LayerCache, LayerRecord};
pub use containerfile::render_containerfile;
pub use sequencer::{
    BuildReport, BuildSettings, NoopObserver, Pipeline, PlannedStep, StepObserver, StepOutcome,
    StepStatus, DEFAULT_EXCLUDES,
};
pub use step::{BuildInputs, BuildStep, InputKind, Plan, StepInputs};
