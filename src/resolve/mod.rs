//! Lockfile resolver
//!
//! Validates a manifest/lockfile pair in frozen mode and emits the exact
//! install set. Resolution never touches the network or the cache store:
//! a mismatch is reported before a single package is fetched.

pub mod lockfile;
pub mod manifest;
pub mod requirement;
pub mod target;

pub use lockfile::{Artifact, Dependency, LockedPackage, Lockfile, PackageSource};
pub use manifest::Manifest;
pub use requirement::{normalize_name, Requirement};
pub use target::{python_version_for, Target};

use crate::error::{StrataError, StrataResult};
use crate::resolve::requirement::parse_specifiers;
use crate::resolve::target::marker_applies;
use pep508_rs::MarkerEnvironment;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// The exact package set an installer materializes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSet {
    /// Third-party packages, sorted by normalized name, each with the
    /// wheel selected for the target
    pub packages: Vec<LockedPackage>,

    /// The project's own entry from the lockfile
    pub project: LockedPackage,

    /// Python constraint shared by manifest and lockfile
    pub requires_python: Option<String>,
}

impl InstallSet {
    /// `name==version` pins of the third-party packages
    pub fn pins(&self) -> Vec<String> {
        self.packages.iter().map(LockedPackage::pin).collect()
    }

    /// Whether the project itself is installed as a package
    pub fn installs_project(&self) -> bool {
        matches!(
            self.project.source,
            PackageSource::Editable(_) | PackageSource::Directory(_)
        )
    }
}

/// Validate the lockfile against the manifest and compute the install set.
///
/// `groups` selects dependency groups whose packages are installed in
/// addition to the runtime dependencies. Packages reachable only through
/// unselected groups, or only through edges whose marker does not hold on
/// `target`, are legal in the lockfile but are not installed.
pub fn resolve_lock(
    manifest: &Manifest,
    lockfile: &Lockfile,
    groups: &[String],
    target: &Target,
) -> StrataResult<InstallSet> {
    let by_name = index_packages(lockfile)?;

    let project = by_name
        .get(manifest.name.as_str())
        .copied()
        .ok_or_else(|| {
            StrataError::lock_mismatch(format!(
                "project '{}' has no entry in the lockfile",
                manifest.name
            ))
        })?;
    if !project.source.is_local() {
        return Err(StrataError::lock_mismatch(format!(
            "project '{}' is locked from a registry, expected a local source",
            manifest.name
        )));
    }
    if let (Some(declared), Some(locked)) = (&manifest.version, &project.version) {
        if declared != locked {
            return Err(StrataError::lock_mismatch(format!(
                "project version {} is locked as {}",
                declared, locked
            )));
        }
    }
    if !same_python_constraint(
        manifest.requires_python.as_deref(),
        lockfile.requires_python.as_deref(),
    ) {
        return Err(StrataError::lock_mismatch(format!(
            "requires-python is {} in the manifest but {} in the lockfile",
            manifest.requires_python.as_deref().unwrap_or("unset"),
            lockfile.requires_python.as_deref().unwrap_or("unset"),
        )));
    }

    // Every declared requirement, in any group, must be locked and satisfied
    let mut all_groups: Vec<String> = manifest.groups.keys().cloned().collect();
    all_groups.sort();
    let declared = manifest.requirements_for(&all_groups)?;
    for req in &declared {
        check_requirement(req, &by_name)?;
    }

    // Everything reachable from the project on any platform is legal
    let legal = closure(roots_of(declared.iter().copied()), &by_name, None)?;
    for pkg in &lockfile.packages {
        if pkg.name != manifest.name && !legal.contains(pkg.name.as_str()) {
            return Err(StrataError::lock_mismatch(format!(
                "lockfile contains {} which nothing in the manifest requires",
                pkg.pin()
            )));
        }
    }

    // The install set covers runtime deps plus the selected groups, on the target only
    let env = target.marker_environment()?;
    let selected = manifest.requirements_for(groups)?;
    let roots = roots_of(selected.into_iter().filter(|req| {
        let applies = req.applies_to(&env);
        if !applies {
            debug!("Skipping '{}' on {}", req, target);
        }
        applies
    }));
    let install = closure(roots, &by_name, Some(&env))?;

    let mut packages = Vec::with_capacity(install.len());
    for name in &install {
        let pkg = by_name[name];
        if pkg.source.is_local() {
            return Err(StrataError::lock_mismatch(format!(
                "dependency {} has a local source, which frozen image builds cannot fetch",
                pkg.name
            )));
        }
        if pkg.version.is_none() {
            return Err(StrataError::lock_mismatch(format!(
                "dependency {} has no locked version",
                pkg.name
            )));
        }
        if pkg.wheels.is_empty() {
            return Err(StrataError::lock_mismatch(format!(
                "{} has no wheel artifact in the lockfile",
                pkg.pin()
            )));
        }
        let wheel = target.select_wheel(&pkg.wheels).ok_or_else(|| {
            StrataError::install(
                pkg.pin(),
                format!(
                    "none of its {} wheel(s) is compatible with {}",
                    pkg.wheels.len(),
                    target
                ),
            )
        })?;
        debug!("Selected {} for {}", wheel.filename(), pkg.pin());

        let mut selected = pkg.clone();
        selected.wheel = Some(wheel.clone());
        packages.push(selected);
    }

    debug!(
        "Resolved {} package(s) for {} on {} from {}",
        packages.len(),
        manifest.name,
        target,
        lockfile.path.display()
    );

    Ok(InstallSet {
        packages,
        project: project.clone(),
        requires_python: lockfile.requires_python.clone(),
    })
}

fn index_packages(lockfile: &Lockfile) -> StrataResult<BTreeMap<&str, &LockedPackage>> {
    let mut by_name = BTreeMap::new();
    for pkg in &lockfile.packages {
        if by_name.insert(pkg.name.as_str(), pkg).is_some() {
            return Err(StrataError::lock_mismatch(format!(
                "package '{}' is locked more than once",
                pkg.name
            )));
        }
    }
    Ok(by_name)
}

/// Two requires-python values agree when they hold the same specifiers,
/// whatever their order and spacing
fn same_python_constraint(manifest: Option<&str>, lockfile: Option<&str>) -> bool {
    match (manifest, lockfile) {
        (None, None) => true,
        (Some(a), Some(b)) => match (parse_specifiers(a), parse_specifiers(b)) {
            (Ok(a), Ok(b)) => {
                let a: HashSet<_> = a.iter().cloned().collect();
                let b: HashSet<_> = b.iter().cloned().collect();
                a == b
            }
            _ => a.trim() == b.trim(),
        },
        _ => false,
    }
}

fn check_requirement(
    req: &Requirement,
    by_name: &BTreeMap<&str, &LockedPackage>,
) -> StrataResult<()> {
    let locked = by_name.get(req.name.as_str()).ok_or_else(|| {
        StrataError::lock_mismatch(format!("'{}' is required but not locked", req))
    })?;
    let version = locked.version.as_deref().ok_or_else(|| {
        StrataError::lock_mismatch(format!("'{}' is locked without a version", req.name))
    })?;
    let satisfied = req
        .is_satisfied_by(version)
        .map_err(|e| StrataError::lock_mismatch(e.to_string()))?;
    if !satisfied {
        return Err(StrataError::lock_mismatch(format!(
            "{} does not satisfy '{}'",
            locked.pin(),
            req
        )));
    }
    Ok(())
}

fn roots_of<'r>(reqs: impl Iterator<Item = &'r Requirement>) -> Vec<(String, Vec<String>)> {
    reqs.map(|req| (req.name.clone(), req.extras.clone()))
        .collect()
}

/// Transitive closure over lockfile dependency edges, sorted by name.
///
/// Each root carries the extras requested on it; an extra pulls in the
/// package's matching optional-dependency table. With `env`, edges whose
/// marker does not hold are skipped.
fn closure<'a>(
    roots: Vec<(String, Vec<String>)>,
    by_name: &BTreeMap<&'a str, &'a LockedPackage>,
    env: Option<&MarkerEnvironment>,
) -> StrataResult<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    let mut seen_extras: BTreeSet<(&'a str, String)> = BTreeSet::new();
    let mut stack = roots;

    while let Some((name, extras)) = stack.pop() {
        let (key, pkg) = by_name.get_key_value(name.as_str()).ok_or_else(|| {
            StrataError::lock_mismatch(format!("'{}' is required but not locked", name))
        })?;

        let mut edges: Vec<&Dependency> = Vec::new();
        if seen.insert(*key) {
            edges.extend(&pkg.dependencies);
        }
        for extra in extras {
            if !seen_extras.insert((*key, extra.clone())) {
                continue;
            }
            match pkg.optional_dependencies.get(&extra) {
                Some(deps) => edges.extend(deps),
                None => debug!("{} has no extra '{}' in the lockfile", pkg.pin(), extra),
            }
        }

        for dep in edges {
            if let (Some(env), Some(marker)) = (env, &dep.marker) {
                if !marker_applies(marker, env)? {
                    continue;
                }
            }
            if !by_name.contains_key(dep.name.as_str()) {
                return Err(StrataError::lock_mismatch(format!(
                    "{} depends on '{}', which is not locked",
                    pkg.pin(),
                    dep.name
                )));
            }
            stack.push((dep.name.clone(), dep.extras.clone()));
        }
    }

    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const HASH: &str = "ab00000000000000000000000000000000000000000000000000000000000000";

    fn manifest(deps: &str) -> Manifest {
        let content = format!(
            r#"
[project]
name = "tools"
version = "0.1.0"
requires-python = ">=3.12"
dependencies = [{deps}]

[dependency-groups]
dev = ["pytest>=8"]
"#
        );
        Manifest::parse(&content, Path::new("pyproject.toml")).unwrap()
    }

    fn registry(name: &str, version: &str, deps: &[&str]) -> String {
        let deps: Vec<String> = deps.iter().map(|d| format!("{{ name = \"{d}\" }}")).collect();
        format!(
            r#"
[[package]]
name = "{name}"
version = "{version}"
source = {{ registry = "https://pypi.org/simple" }}
dependencies = [{deps}]
wheels = [{{ url = "https://files.example/{name}-{version}-py3-none-any.whl", hash = "sha256:{HASH}" }}]
"#,
            deps = deps.join(", ")
        )
    }

    fn lockfile(project_deps: &[&str], packages: &[String]) -> Lockfile {
        let deps: Vec<String> = project_deps
            .iter()
            .map(|d| format!("{{ name = \"{d}\" }}"))
            .collect();
        let content = format!(
            r#"
version = 1
requires-python = ">=3.12"

[[package]]
name = "tools"
version = "0.1.0"
source = {{ virtual = "." }}
dependencies = [{}]
{}
"#,
            deps.join(", "),
            packages.join("\n")
        );
        Lockfile::parse(&content, Path::new("uv.lock")).unwrap()
    }

    fn target() -> Target {
        Target::for_python("3.12").unwrap()
    }

    fn package(name: &str, version: &str, body: &str) -> String {
        format!(
            r#"
[[package]]
name = "{name}"
version = "{version}"
source = {{ registry = "https://pypi.org/simple" }}
{body}
"#
        )
    }

    fn wheel(file: &str) -> String {
        format!(r#"{{ url = "https://files.example/{file}", hash = "sha256:{HASH}" }}"#)
    }

    fn requests_lock(version: &str) -> Lockfile {
        lockfile(
            &["requests"],
            &[
                registry("requests", version, &["idna", "urllib3"]),
                registry("idna", "3.7", &[]),
                registry("urllib3", "2.2.1", &[]),
                registry("pytest", "8.2.0", &["pluggy"]),
                registry("pluggy", "1.5.0", &[]),
            ],
        )
    }

    #[test]
    fn satisfied_lock_resolves_transitive_set() {
        let set = resolve_lock(
            &manifest("\"requests>=2.0\""),
            &requests_lock("2.31.0"),
            &[],
            &target(),
        )
        .unwrap();
        assert_eq!(
            set.pins(),
            vec!["idna==3.7", "requests==2.31.0", "urllib3==2.2.1"]
        );
        assert_eq!(set.project.name, "tools");
        assert!(!set.installs_project());
    }

    #[test]
    fn version_drift_is_rejected() {
        let err = resolve_lock(
            &manifest("\"requests>=2.0\""),
            &requests_lock("1.0.0"),
            &[],
            &target(),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::LockMismatch { .. }));
        assert!(err.to_string().contains("requests==1.0.0"));
    }

    #[test]
    fn missing_entry_is_rejected() {
        let err = resolve_lock(
            &manifest("\"requests>=2.0\", \"streamlit>=1.41\""),
            &requests_lock("2.31.0"),
            &[],
            &target(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("streamlit"));
        assert!(err.to_string().contains("not locked"));
    }

    #[test]
    fn extraneous_entry_is_rejected() {
        let mut lock = requests_lock("2.31.0");
        let stray = lockfile(&[], &[registry("left-pad", "1.0.0", &[])]);
        lock.packages.push(stray.find("left-pad").unwrap().clone());
        let err =
            resolve_lock(&manifest("\"requests>=2.0\""), &lock, &[], &target()).unwrap_err();
        assert!(err.to_string().contains("left-pad==1.0.0"));
    }

    #[test]
    fn dangling_dependency_edge_is_rejected() {
        let lock = lockfile(
            &["requests"],
            &[
                registry("requests", "2.31.0", &["idna"]),
                registry("pytest", "8.2.0", &[]),
            ],
        );
        let err =
            resolve_lock(&manifest("\"requests>=2.0\""), &lock, &[], &target()).unwrap_err();
        assert!(err.to_string().contains("depends on 'idna'"));
    }

    #[test]
    fn python_constraint_drift_is_rejected() {
        let mut lock = requests_lock("2.31.0");
        lock.requires_python = Some(">=3.11".into());
        let err =
            resolve_lock(&manifest("\"requests>=2.0\""), &lock, &[], &target()).unwrap_err();
        assert!(err.to_string().contains("requires-python"));
    }

    #[test]
    fn selected_group_joins_install_set() {
        let set = resolve_lock(
            &manifest("\"requests>=2.0\""),
            &requests_lock("2.31.0"),
            &["dev".to_string()],
            &target(),
        )
        .unwrap();
        assert!(set.pins().contains(&"pytest==8.2.0".to_string()));
        assert!(set.pins().contains(&"pluggy==1.5.0".to_string()));
    }

    #[test]
    fn project_version_drift_is_rejected() {
        let mut m = manifest("\"requests>=2.0\"");
        m.version = Some("0.2.0".into());
        let err = resolve_lock(&m, &requests_lock("2.31.0"), &[], &target()).unwrap_err();
        assert!(err.to_string().contains("0.2.0"));
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let mut lock = requests_lock("2.31.0");
        let dup = lock.find("idna").unwrap().clone();
        lock.packages.push(dup);
        let err =
            resolve_lock(&manifest("\"requests>=2.0\""), &lock, &[], &target()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn wheel_is_selected_for_the_target() {
        let numpy = package(
            "numpy",
            "2.1.0",
            &format!(
                "wheels = [{}, {}, {}, {}]",
                wheel("numpy-2.1.0-cp312-cp312-macosx_14_0_arm64.whl"),
                wheel("numpy-2.1.0-cp312-cp312-manylinux_2_17_aarch64.manylinux2014_aarch64.whl"),
                wheel("numpy-2.1.0-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl"),
                wheel("numpy-2.1.0-cp312-cp312-win_amd64.whl"),
            ),
        );
        let lock = lockfile(&["numpy"], &[numpy, registry("pytest", "8.2.0", &[])]);
        let m = manifest("\"numpy>=2\"");

        let set = resolve_lock(&m, &lock, &[], &target()).unwrap();
        let selected = set.packages[0].wheel.as_ref().unwrap();
        assert_eq!(
            selected.filename(),
            "numpy-2.1.0-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl"
        );
    }

    #[test]
    fn no_compatible_wheel_fails_the_package() {
        let numpy = package(
            "numpy",
            "2.1.0",
            &format!(
                "wheels = [{}, {}]",
                wheel("numpy-2.1.0-cp312-cp312-macosx_14_0_arm64.whl"),
                wheel("numpy-2.1.0-cp312-cp312-win_amd64.whl"),
            ),
        );
        let lock = lockfile(&["numpy"], &[numpy, registry("pytest", "8.2.0", &[])]);
        let m = manifest("\"numpy>=2\"");

        let err = resolve_lock(&m, &lock, &[], &target()).unwrap_err();
        match err {
            StrataError::PackageInstall { package, reason } => {
                assert_eq!(package, "numpy==2.1.0");
                assert!(reason.contains("2 wheel(s)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn edge_marker_excludes_other_platform_deps() {
        let click = package(
            "click",
            "8.1.7",
            &format!(
                "dependencies = [{{ name = \"colorama\", marker = \"sys_platform == 'win32'\" }}]\nwheels = [{}]",
                wheel("click-8.1.7-py3-none-any.whl")
            ),
        );
        let lock = lockfile(
            &["click"],
            &[
                click,
                registry("colorama", "0.4.6", &[]),
                registry("pytest", "8.2.0", &[]),
            ],
        );
        let m = manifest("\"click>=8\"");

        let set = resolve_lock(&m, &lock, &[], &target()).unwrap();
        assert_eq!(set.pins(), vec!["click==8.1.7"]);
    }

    #[test]
    fn requirement_marker_skips_root() {
        let lock = lockfile(
            &["requests", "pywin32"],
            &[
                registry("requests", "2.31.0", &["idna", "urllib3"]),
                registry("idna", "3.7", &[]),
                registry("urllib3", "2.2.1", &[]),
                registry("pywin32", "306", &[]),
                registry("pytest", "8.2.0", &["pluggy"]),
                registry("pluggy", "1.5.0", &[]),
            ],
        );
        let m = manifest("\"requests>=2.0\", \"pywin32>=306; sys_platform == 'win32'\"");

        let set = resolve_lock(&m, &lock, &[], &target()).unwrap();
        assert!(!set.pins().iter().any(|p| p.starts_with("pywin32")));
        assert!(set.pins().contains(&"requests==2.31.0".to_string()));
    }

    #[test]
    fn requested_extra_pulls_optional_dependencies() {
        let requests = package(
            "requests",
            "2.32.3",
            &format!(
                "dependencies = [{{ name = \"idna\" }}]\nwheels = [{}]\n\n[package.optional-dependencies]\nsocks = [{{ name = \"pysocks\" }}]",
                wheel("requests-2.32.3-py3-none-any.whl")
            ),
        );
        let lock = lockfile(
            &["requests"],
            &[
                requests,
                registry("idna", "3.7", &[]),
                registry("pysocks", "1.7.1", &[]),
                registry("pytest", "8.2.0", &["pluggy"]),
                registry("pluggy", "1.5.0", &[]),
            ],
        );

        let set =
            resolve_lock(&manifest("\"requests[socks]>=2.0\""), &lock, &[], &target()).unwrap();
        assert_eq!(
            set.pins(),
            vec!["idna==3.7", "pysocks==1.7.1", "requests==2.32.3"]
        );

        // Without the extra nothing requires pysocks
        let err = resolve_lock(&manifest("\"requests>=2.0\""), &lock, &[], &target())
            .unwrap_err();
        assert!(err.to_string().contains("pysocks==1.7.1"));
    }

    #[test]
    fn python_constraint_compares_as_specifier_set() {
        let mut m = manifest("\"requests>=2.0\"");
        m.requires_python = Some(">=3.9,<4".into());
        let mut lock = requests_lock("2.31.0");
        lock.requires_python = Some(">=3.9, <4".into());
        assert!(resolve_lock(&m, &lock, &[], &target()).is_ok());

        lock.requires_python = Some("<4, >=3.9".into());
        assert!(resolve_lock(&m, &lock, &[], &target()).is_ok());

        lock.requires_python = Some(">=3.10, <4".into());
        assert!(resolve_lock(&m, &lock, &[], &target()).is_err());

        lock.requires_python = None;
        assert!(resolve_lock(&m, &lock, &[], &target()).is_err());
    }
}
