//! Requirement strings and version specifiers
//!
//! Manifest dependencies are PEP 508 strings, parsed with `pep508_rs`.
//! The frozen check needs the distribution name, the requested extras, the
//! version specifiers and the marker, which is evaluated against the build
//! target.

use crate::error::{StrataError, StrataResult};
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{MarkerEnvironment, PackageName, Requirement as Pep508Requirement, VersionOrUrl};
use std::fmt;
use std::str::FromStr;

/// Normalize a distribution, extra or group name (PEP 503)
pub fn normalize_name(name: &str) -> String {
    let name = name.trim();
    match PackageName::from_str(name) {
        Ok(normalized) => normalized.to_string(),
        Err(_) => name.to_ascii_lowercase(),
    }
}

/// A parsed dependency requirement from the manifest
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Normalized distribution name
    pub name: String,

    /// Normalized extras requested in brackets
    pub extras: Vec<String>,

    /// Version specifiers (empty means any version)
    pub specifiers: VersionSpecifiers,

    /// Environment marker, if any
    pub marker: Option<String>,

    parsed: Pep508Requirement,
    raw: String,
}

impl Requirement {
    /// Parse a PEP 508 requirement string
    pub fn parse(raw: &str) -> StrataResult<Self> {
        let trimmed = raw.trim();
        let parsed = Pep508Requirement::from_str(trimmed)
            .map_err(|e| StrataError::User(format!("requirement '{}': {}", trimmed, e)))?;

        let specifiers = match &parsed.version_or_url {
            None => parse_specifiers(""),
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => {
                parse_specifiers(&specifiers.to_string())
            }
            Some(VersionOrUrl::Url(_)) => {
                return Err(StrataError::User(format!(
                    "URL requirement '{}' is not supported in frozen installs",
                    trimmed
                )))
            }
        }
        .map_err(|reason| StrataError::User(format!("requirement '{}': {}", trimmed, reason)))?;

        let mut extras: Vec<String> = parsed.extras.iter().map(ToString::to_string).collect();
        extras.sort();
        extras.dedup();

        Ok(Self {
            name: parsed.name.to_string(),
            extras,
            specifiers,
            marker: parsed.marker.as_ref().map(ToString::to_string),
            parsed,
            raw: trimmed.to_string(),
        })
    }

    /// Whether the requirement's marker holds in `env`
    pub fn applies_to(&self, env: &MarkerEnvironment) -> bool {
        self.parsed.evaluate_markers(env, &[])
    }

    /// Whether a locked version string satisfies this requirement
    pub fn is_satisfied_by(&self, version: &str) -> StrataResult<bool> {
        let parsed = parse_version(version)
            .map_err(|reason| StrataError::User(format!("version '{}': {}", version, reason)))?;
        Ok(self.specifiers.contains(&parsed))
    }

    /// The normalized specifier list, for messages
    pub fn specifier_display(&self) -> String {
        self.specifiers.to_string()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Parse a comma-separated specifier list; empty input means "any version"
pub fn parse_specifiers(spec: &str) -> Result<VersionSpecifiers, String> {
    if spec.trim().is_empty() {
        return VersionSpecifiers::from_str(">=0").map_err(|e| e.to_string());
    }
    VersionSpecifiers::from_str(spec).map_err(|e| e.to_string())
}

/// Parse a PEP 440 version
pub fn parse_version(version: &str) -> Result<Version, String> {
    Version::from_str(version.trim()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::target::Target;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize_name("Charset_Normalizer"), "charset-normalizer");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a-_.b"), "a-b");
        assert_eq!(normalize_name("requests"), "requests");
    }

    #[test]
    fn parse_simple_lower_bound() {
        let req = Requirement::parse("requests>=2.0").unwrap();
        assert_eq!(req.name, "requests");
        assert!(req.is_satisfied_by("2.31.0").unwrap());
        assert!(!req.is_satisfied_by("1.0.0").unwrap());
    }

    #[test]
    fn parse_without_specifier_accepts_anything() {
        let req = Requirement::parse("streamlit").unwrap();
        assert_eq!(req.specifier_display(), ">=0");
        assert!(req.is_satisfied_by("1.41.1").unwrap());
    }

    #[test]
    fn parse_extras_and_marker() {
        let req =
            Requirement::parse("Requests[socks, security] >=2.0,<3 ; python_version >= '3.8'")
                .unwrap();
        assert_eq!(req.name, "requests");
        assert_eq!(req.extras, vec!["security", "socks"]);
        assert!(req.marker.is_some());
        assert!(req.is_satisfied_by("2.31.0").unwrap());
        assert!(!req.is_satisfied_by("3.0.0").unwrap());
    }

    #[test]
    fn marker_evaluated_against_target() {
        let env = Target::for_python("3.12").unwrap().marker_environment().unwrap();
        let windows = Requirement::parse("pywin32>=306 ; sys_platform == 'win32'").unwrap();
        assert!(!windows.applies_to(&env));

        let old_python = Requirement::parse("tomli>=2 ; python_version < '3.11'").unwrap();
        assert!(!old_python.applies_to(&env));

        let plain = Requirement::parse("requests>=2.0").unwrap();
        assert!(plain.applies_to(&env));
    }

    #[test]
    fn compatible_release_operator() {
        let req = Requirement::parse("bibtexparser~=1.4").unwrap();
        assert!(req.is_satisfied_by("1.4.3").unwrap());
        assert!(!req.is_satisfied_by("2.0.0").unwrap());
    }

    #[test]
    fn rejects_url_requirements() {
        assert!(Requirement::parse("pkg @ https://example.com/pkg.whl").is_err());
    }

    #[test]
    fn rejects_missing_name() {
        assert!(Requirement::parse(">=2.0").is_err());
    }

    #[test]
    fn rejects_garbage_specifier() {
        assert!(Requirement::parse("requests>>2").is_err());
    }
}
