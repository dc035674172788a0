//! Error types for strata
//!
//! All modules use `StrataResult<T>` as their return type. Every pipeline
//! error is fatal at the pipeline layer; only the orchestrator decides
//! whether a failed build is worth running again.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// All errors that can occur in strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Resolution errors
    #[error("Lockfile does not match manifest: {reason}")]
    LockMismatch { reason: String },

    #[error("Invalid manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Invalid lockfile {path}: {reason}")]
    LockfileInvalid { path: PathBuf, reason: String },

    // Installation errors
    #[error("Failed to install {package}: {reason}")]
    PackageInstall { package: String, reason: String },

    #[error("Failed to fetch {package} from {url}: {reason}")]
    PackageFetch {
        package: String,
        url: String,
        reason: String,
    },

    // Sequencing errors
    #[error("Invalid build plan: {0}")]
    PlanOrdering(String),

    #[error("Step {step} read undeclared input {input}")]
    UndeclaredInput { step: String, input: String },

    // Configuration errors
    #[error("Runtime configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a lock mismatch error
    pub fn lock_mismatch(reason: impl Into<String>) -> Self {
        Self::LockMismatch {
            reason: reason.into(),
        }
    }

    /// Create a package install error
    pub fn install(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PackageInstall {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable by an outer orchestrator.
    ///
    /// Only transport failures qualify. Drift, integrity and config errors
    /// fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PackageFetch { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockMismatch { .. } => {
                Some("Regenerate the lockfile (e.g. `uv lock`) and commit it with the manifest")
            }
            Self::ConfigNotFound(_) => {
                Some("Create the runtime config file or point paths.runtime_config at it")
            }
            Self::PackageFetch { .. } => Some("Check network access, or rerun with --retries"),
            Self::PlanOrdering(_) => Some("Dependency installs must run before the source copy"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StrataError::lock_mismatch("requests==1.0.0 does not satisfy >=2.0");
        assert!(err.to_string().contains("Lockfile does not match manifest"));
        assert!(err.to_string().contains("requests==1.0.0"));
    }

    #[test]
    fn error_hint() {
        let err = StrataError::ConfigNotFound(PathBuf::from(".streamlit/config.toml"));
        assert!(err.hint().unwrap().contains("runtime_config"));
        assert!(StrataError::Internal("x".into()).hint().is_none());
    }

    #[test]
    fn error_retryable() {
        let fetch = StrataError::PackageFetch {
            package: "requests".into(),
            url: "https://example.invalid/requests.whl".into(),
            reason: "connection reset".into(),
        };
        assert!(fetch.is_retryable());
        assert!(!StrataError::lock_mismatch("drift").is_retryable());
        assert!(!StrataError::install("requests", "hash mismatch").is_retryable());
    }
}
