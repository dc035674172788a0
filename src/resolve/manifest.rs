//! Dependency manifest parsing
//!
//! The manifest is the application's `pyproject.toml`. Only the tables the
//! pipeline reads are modelled; everything else is ignored.

use crate::error::{StrataError, StrataResult};
use crate::resolve::requirement::{normalize_name, Requirement};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    project: Option<RawProject>,

    #[serde(default, rename = "dependency-groups")]
    dependency_groups: BTreeMap<String, Vec<toml::Value>>,

    #[serde(rename = "build-system")]
    build_system: Option<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawProject {
    name: Option<String>,
    version: Option<String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Parsed dependency manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Where the manifest was read from
    pub path: PathBuf,

    /// Normalized project name
    pub name: String,

    /// Project version (`None` for dynamic versions)
    pub version: Option<String>,

    /// Python version constraint
    pub requires_python: Option<String>,

    /// Runtime dependencies
    pub dependencies: Vec<Requirement>,

    /// Named dependency groups (PEP 735), names normalized
    pub groups: BTreeMap<String, Vec<Requirement>>,

    /// Whether the project declares a build backend
    pub has_build_system: bool,
}

impl Manifest {
    /// Parse a manifest from a file on disk
    pub async fn from_file(path: &Path) -> StrataResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading manifest {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse a manifest from TOML content
    pub fn parse(content: &str, path: &Path) -> StrataResult<Self> {
        let invalid = |reason: String| StrataError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let raw: RawManifest = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        let project = raw
            .project
            .ok_or_else(|| invalid("missing [project] table".to_string()))?;
        let name = project
            .name
            .ok_or_else(|| invalid("missing project.name".to_string()))?;

        let dependencies = project
            .dependencies
            .iter()
            .map(|d| Requirement::parse(d).map_err(|e| invalid(e.to_string())))
            .collect::<StrataResult<Vec<_>>>()?;

        let mut groups = BTreeMap::new();
        for (group, entries) in &raw.dependency_groups {
            let mut reqs = Vec::new();
            for entry in entries {
                // `{ include-group = "..." }` tables are expanded below
                if let Some(spec) = entry.as_str() {
                    reqs.push(Requirement::parse(spec).map_err(|e| invalid(e.to_string()))?);
                }
            }
            groups.insert(normalize_name(group), reqs);
        }
        expand_group_includes(&raw.dependency_groups, &mut groups)
            .map_err(invalid)?;

        Ok(Self {
            path: path.to_path_buf(),
            name: normalize_name(&name),
            version: project.version,
            requires_python: project.requires_python,
            dependencies,
            groups,
            has_build_system: raw.build_system.is_some(),
        })
    }

    /// Requirements for the runtime dependencies plus the selected groups
    pub fn requirements_for(&self, groups: &[String]) -> StrataResult<Vec<&Requirement>> {
        let mut reqs: Vec<&Requirement> = self.dependencies.iter().collect();
        for group in groups {
            let key = normalize_name(group);
            let members = self.groups.get(&key).ok_or_else(|| {
                StrataError::User(format!(
                    "dependency group '{}' is not defined in {}",
                    group,
                    self.path.display()
                ))
            })?;
            reqs.extend(members.iter());
        }
        Ok(reqs)
    }
}

/// Resolve `{ include-group = "name" }` entries, rejecting cycles
fn expand_group_includes(
    raw: &BTreeMap<String, Vec<toml::Value>>,
    groups: &mut BTreeMap<String, Vec<Requirement>>,
) -> Result<(), String> {
    fn collect(
        name: &str,
        raw: &BTreeMap<String, Vec<toml::Value>>,
        parsed: &BTreeMap<String, Vec<Requirement>>,
        stack: &mut Vec<String>,
        out: &mut Vec<Requirement>,
    ) -> Result<(), String> {
        if stack.iter().any(|s| s == name) {
            return Err(format!("dependency group cycle through '{}'", name));
        }
        let entries = raw
            .iter()
            .find(|(k, _)| normalize_name(k) == name)
            .map(|(_, v)| v)
            .ok_or_else(|| format!("included dependency group '{}' is not defined", name))?;
        stack.push(name.to_string());
        out.extend(parsed.get(name).cloned().unwrap_or_default());
        for entry in entries {
            if let Some(include) = entry.get("include-group").and_then(|v| v.as_str()) {
                collect(&normalize_name(include), raw, parsed, stack, out)?;
            }
        }
        stack.pop();
        Ok(())
    }

    let parsed = groups.clone();
    for name in parsed.keys() {
        let mut expanded = Vec::new();
        collect(name, raw, &parsed, &mut Vec::new(), &mut expanded)?;
        groups.insert(name.clone(), expanded);
    }
    Ok(())
}
