//! Build steps, their declared inputs, and plan validation
//!
//! Each step declares the input kinds it may read. Executors reach inputs
//! only through [`StepInputs`], which refuses anything undeclared, so a
//! step cannot depend on a file its cache key does not cover.

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Kinds of build input a step can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputKind {
    Manifest,
    Lockfile,
    SourceTree,
    RuntimeConfig,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manifest => "manifest",
            Self::Lockfile => "lockfile",
            Self::SourceTree => "source-tree",
            Self::RuntimeConfig => "runtime-config",
        };
        write!(f, "{}", name)
    }
}

/// One step of the image build
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStep {
    ResolveLock,
    InstallDependencies,
    CopySource,
    InstallFull,
    WriteRuntimeConfig,
}

impl BuildStep {
    /// Steps in canonical order, least likely to change first
    pub const CANONICAL: [BuildStep; 5] = [
        Self::ResolveLock,
        Self::InstallDependencies,
        Self::CopySource,
        Self::InstallFull,
        Self::WriteRuntimeConfig,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ResolveLock => "resolve-lock",
            Self::InstallDependencies => "install-dependencies",
            Self::CopySource => "copy-source",
            Self::InstallFull => "install-full",
            Self::WriteRuntimeConfig => "write-runtime-config",
        }
    }

    /// Input kinds this step may read
    pub fn declared_inputs(&self) -> &'static [InputKind] {
        match self {
            Self::ResolveLock | Self::InstallDependencies | Self::InstallFull => {
                &[InputKind::Manifest, InputKind::Lockfile]
            }
            Self::CopySource => &[InputKind::SourceTree],
            Self::WriteRuntimeConfig => &[InputKind::RuntimeConfig],
        }
    }

    pub fn declares(&self, kind: InputKind) -> bool {
        self.declared_inputs().contains(&kind)
    }

    /// Whether the step's file changes become a layer
    pub fn produces_layer(&self) -> bool {
        !matches!(self, Self::ResolveLock)
    }

    pub fn is_install(&self) -> bool {
        matches!(self, Self::InstallDependencies | Self::InstallFull)
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// A validated, ordered list of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<BuildStep>,
}

impl Plan {
    /// The standard five-step plan
    pub fn canonical() -> Self {
        Self {
            steps: BuildStep::CANONICAL.to_vec(),
        }
    }

    /// Validate an arbitrary step order
    pub fn new(steps: Vec<BuildStep>) -> StrataResult<Self> {
        let mut seen = BTreeSet::new();
        let mut resolved = false;
        let mut dependencies_installed = false;

        for step in &steps {
            if !seen.insert(*step) {
                return Err(StrataError::PlanOrdering(format!(
                    "step {} appears more than once",
                    step
                )));
            }
            if step.is_install() && !resolved {
                return Err(StrataError::PlanOrdering(format!(
                    "{} must run after resolve-lock",
                    step
                )));
            }
            if step.declares(InputKind::SourceTree) && !dependencies_installed {
                return Err(StrataError::PlanOrdering(format!(
                    "{} reads the source tree before install-dependencies",
                    step
                )));
            }
            match step {
                BuildStep::ResolveLock => resolved = true,
                BuildStep::InstallDependencies => dependencies_installed = true,
                _ => {}
            }
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }
}

/// Host paths of every build input
#[derive(Debug, Clone)]
pub struct BuildInputs {
    pub manifest: PathBuf,
    pub lockfile: PathBuf,
    pub source_dir: PathBuf,
    pub runtime_config: PathBuf,
}

impl BuildInputs {
    pub fn path(&self, kind: InputKind) -> &Path {
        match kind {
            InputKind::Manifest => &self.manifest,
            InputKind::Lockfile => &self.lockfile,
            InputKind::SourceTree => &self.source_dir,
            InputKind::RuntimeConfig => &self.runtime_config,
        }
    }
}

/// The inputs one step is allowed to see
#[derive(Debug, Clone, Copy)]
pub struct StepInputs<'a> {
    step: BuildStep,
    inputs: &'a BuildInputs,
}

impl<'a> StepInputs<'a> {
    pub fn new(step: BuildStep, inputs: &'a BuildInputs) -> Self {
        Self { step, inputs }
    }

    pub fn step(&self) -> BuildStep {
        self.step
    }

    /// Path of a declared input; undeclared access is an error
    pub fn path(&self, kind: InputKind) -> StrataResult<&'a Path> {
        if !self.step.declares(kind) {
            return Err(StrataError::UndeclaredInput {
                step: self.step.to_string(),
                input: kind.to_string(),
            });
        }
        Ok(self.inputs.path(kind))
    }
}
