//! Lockfile parsing
//!
//! Reads the `uv.lock` layout: a format version, the Python constraint the
//! lock was produced for, and one `[[package]]` entry per distribution with
//! its exact version, source, dependency edges, optional-dependency tables
//! and wheel artifacts. A lock is universal: edges carry markers and a
//! package lists one wheel per platform it supports.

use crate::error::{StrataError, StrataResult};
use crate::resolve::requirement::normalize_name;
use pep508_rs::MarkerTree;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Lockfile format versions this reader understands
const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Deserialize)]
struct RawLockfile {
    version: u32,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default, rename = "package")]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    version: Option<String>,
    source: PackageSource,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default, rename = "optional-dependencies")]
    optional_dependencies: BTreeMap<String, Vec<RawDependency>>,
    #[serde(default)]
    wheels: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    name: String,
    #[serde(default)]
    extra: Vec<String>,
    marker: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawArtifact {
    url: Option<String>,
    path: Option<String>,
    hash: Option<String>,
}

/// Where a locked package comes from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageSource {
    /// Package index URL
    Registry(String),
    /// The project itself, installed editable
    Editable(String),
    /// The project itself, not installed as a package
    Virtual(String),
    /// Local directory dependency
    Directory(String),
}

impl PackageSource {
    /// Whether this entry describes a local (non-registry) package
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Registry(_))
    }
}

/// A locked artifact with its integrity hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// `http(s)://` or `file://` URL, or a path relative to the project
    pub location: String,

    /// Lowercase hex SHA-256 of the artifact bytes
    pub sha256: String,
}

impl Artifact {
    /// File name component of the artifact location
    pub fn filename(&self) -> &str {
        let trimmed = self.location.split(['?', '#']).next().unwrap_or("");
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

/// A dependency edge between locked packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Normalized name of the package depended on
    pub name: String,

    /// Normalized extras requested on that package
    pub extras: Vec<String>,

    /// Environment marker guarding the edge
    pub marker: Option<String>,
}

/// One `[[package]]` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedPackage {
    /// Normalized name
    pub name: String,

    /// Exact version (`None` only for virtual projects)
    pub version: Option<String>,

    /// Package source
    pub source: PackageSource,

    /// Direct dependencies, sorted by name
    pub dependencies: Vec<Dependency>,

    /// Dependencies added by each extra, keyed by normalized extra name
    pub optional_dependencies: BTreeMap<String, Vec<Dependency>>,

    /// Every wheel in the lock, in file order
    pub wheels: Vec<Artifact>,

    /// The wheel chosen for the build target; set by the resolver
    pub wheel: Option<Artifact>,
}

impl LockedPackage {
    /// `name==version` label for messages and lock names
    pub fn pin(&self) -> String {
        match &self.version {
            Some(v) => format!("{}=={}", self.name, v),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for LockedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pin())
    }
}

/// Parsed lockfile
#[derive(Debug, Clone)]
pub struct Lockfile {
    /// Where the lockfile was read from
    pub path: PathBuf,

    /// Lockfile format version
    pub version: u32,

    /// Python constraint the lock was produced for
    pub requires_python: Option<String>,

    /// Locked packages, in file order
    pub packages: Vec<LockedPackage>,
}

impl Lockfile {
    /// Parse a lockfile from disk
    pub async fn from_file(path: &Path) -> StrataResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading lockfile {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse a lockfile from TOML content
    pub fn parse(content: &str, path: &Path) -> StrataResult<Self> {
        let invalid = |reason: String| StrataError::LockfileInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let raw: RawLockfile = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        if !SUPPORTED_VERSIONS.contains(&raw.version) {
            return Err(invalid(format!(
                "unsupported lockfile version {}",
                raw.version
            )));
        }

        let mut packages = Vec::with_capacity(raw.packages.len());
        for pkg in raw.packages {
            let wheels = pkg
                .wheels
                .iter()
                .map(|artifact| parse_artifact(&pkg.name, artifact))
                .collect::<Result<Vec<_>, _>>()
                .map_err(invalid)?;
            let dependencies = parse_edges(&pkg.name, &pkg.dependencies).map_err(invalid)?;
            let mut optional_dependencies = BTreeMap::new();
            for (extra, edges) in &pkg.optional_dependencies {
                optional_dependencies.insert(
                    normalize_name(extra),
                    parse_edges(&pkg.name, edges).map_err(invalid)?,
                );
            }

            packages.push(LockedPackage {
                name: normalize_name(&pkg.name),
                version: pkg.version,
                source: pkg.source,
                dependencies,
                optional_dependencies,
                wheels,
                wheel: None,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            version: raw.version,
            requires_python: raw.requires_python,
            packages,
        })
    }

    /// Look up a package by (unnormalized) name
    pub fn find(&self, name: &str) -> Option<&LockedPackage> {
        let key = normalize_name(name);
        self.packages.iter().find(|p| p.name == key)
    }
}

fn parse_edges(package: &str, raw: &[RawDependency]) -> Result<Vec<Dependency>, String> {
    let mut edges = Vec::with_capacity(raw.len());
    for dep in raw {
        if let Some(marker) = &dep.marker {
            MarkerTree::from_str(marker).map_err(|e| {
                format!("marker '{}' on {} -> {}: {}", marker, package, dep.name, e)
            })?;
        }
        let mut extras: Vec<String> = dep.extra.iter().map(|e| normalize_name(e)).collect();
        extras.sort();
        extras.dedup();
        edges.push(Dependency {
            name: normalize_name(&dep.name),
            extras,
            marker: dep.marker.clone(),
        });
    }
    edges.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(edges)
}

fn parse_artifact(package: &str, raw: &RawArtifact) -> Result<Artifact, String> {
    let location = raw
        .url
        .clone()
        .or_else(|| raw.path.clone())
        .ok_or_else(|| format!("wheel for {} has neither url nor path", package))?;
    let hash = raw
        .hash
        .as_deref()
        .ok_or_else(|| format!("wheel for {} has no hash", package))?;
    let sha256 = hash
        .strip_prefix("sha256:")
        .ok_or_else(|| format!("wheel hash for {} must be sha256:<hex>", package))?
        .to_ascii_lowercase();
    if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("wheel hash for {} is not a SHA-256 digest", package));
    }
    Ok(Artifact { location, sha256 })
}
