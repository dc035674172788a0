//! Target interpreter and platform
//!
//! A build installs for one interpreter on one Linux platform. The target
//! decides which environment markers hold and which wheel of a package is
//! installed; a lockfile covers every platform, the image only one.

use crate::error::{StrataError, StrataResult};
use crate::resolve::lockfile::Artifact;
use crate::resolve::requirement::parse_specifiers;
use pep440_rs::Version;
use pep508_rs::{MarkerEnvironment, MarkerTree, StringVersion};
use std::fmt;
use std::str::FromStr;

/// Python minor version used when nothing else decides it
pub const DEFAULT_PYTHON: &str = "3.12";

/// Platform of the default base image (Debian bookworm, glibc 2.36)
pub const DEFAULT_PLATFORM: &str = "manylinux_2_36_x86_64";

/// Minor versions of Python 3 considered when picking from a constraint
const PYTHON3_MINORS: std::ops::RangeInclusive<u64> = 6..=30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Libc {
    Glibc,
    Musl,
}

/// A `manylinux_X_Y_<arch>` or `musllinux_X_Y_<arch>` platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    libc: Libc,
    version: (u32, u32),
    arch: String,
}

impl Platform {
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Rank of a wheel platform tag on this platform; `None` if it cannot run
    fn rank(&self, tag: &str) -> Option<u32> {
        if tag == "any" {
            return Some(0);
        }
        let tagged = parse_platform_tag(tag)?;
        if tagged.libc != self.libc || tagged.arch != self.arch || tagged.version > self.version {
            return None;
        }
        Some(1 + tagged.version.0 * 1000 + tagged.version.1)
    }
}

impl FromStr for Platform {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let legacy = s.starts_with("manylinux1_") || s.starts_with("manylinux20");
        parse_platform_tag(s)
            .filter(|_| !legacy)
            .ok_or_else(|| {
                StrataError::User(format!(
                    "unsupported target platform '{}' (expected manylinux_X_Y_<arch> or musllinux_X_Y_<arch>)",
                    s
                ))
            })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.libc {
            Libc::Glibc => "manylinux",
            Libc::Musl => "musllinux",
        };
        write!(f, "{}_{}_{}_{}", prefix, self.version.0, self.version.1, self.arch)
    }
}

fn parse_platform_tag(tag: &str) -> Option<Platform> {
    // Legacy aliases predate the glibc-versioned form
    for (alias, version) in [
        ("manylinux1_", (2, 5)),
        ("manylinux2010_", (2, 12)),
        ("manylinux2014_", (2, 17)),
    ] {
        if let Some(arch) = tag.strip_prefix(alias) {
            return Some(Platform {
                libc: Libc::Glibc,
                version,
                arch: arch.to_string(),
            });
        }
    }

    let (libc, rest) = if let Some(rest) = tag.strip_prefix("manylinux_") {
        (Libc::Glibc, rest)
    } else if let Some(rest) = tag.strip_prefix("musllinux_") {
        (Libc::Musl, rest)
    } else {
        return None;
    };
    let mut parts = rest.splitn(3, '_');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let arch = parts.next().filter(|a| !a.is_empty())?;
    Some(Platform {
        libc,
        version: (major, minor),
        arch: arch.to_string(),
    })
}

/// Interpreter and platform a build installs for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    python: (u64, u64),
    platform: Platform,
}

impl Target {
    /// Target CPython `X.Y` on `platform`
    pub fn new(python_version: &str, platform: &str) -> StrataResult<Self> {
        let python = parse_minor(python_version).ok_or_else(|| {
            StrataError::User(format!(
                "Python version '{}' must be of the form X.Y",
                python_version
            ))
        })?;
        Ok(Self {
            python,
            platform: platform.parse()?,
        })
    }

    /// CPython `X.Y` on the default platform
    pub fn for_python(python_version: &str) -> StrataResult<Self> {
        Self::new(python_version, DEFAULT_PLATFORM)
    }

    pub fn python_version(&self) -> String {
        format!("{}.{}", self.python.0, self.python.1)
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Marker environment of CPython on Linux for this target
    pub fn marker_environment(&self) -> StrataResult<MarkerEnvironment> {
        let short = self.python_version();
        let full = format!("{}.0", short);
        let version = |value: &str| {
            StringVersion::from_str(value).map_err(|e| {
                StrataError::Internal(format!("'{}' is not a marker version: {}", value, e))
            })
        };
        Ok(MarkerEnvironment {
            implementation_name: "cpython".into(),
            implementation_version: version(&full)?,
            os_name: "posix".into(),
            platform_machine: self.platform.arch.clone(),
            platform_python_implementation: "CPython".into(),
            platform_release: String::new(),
            platform_system: "Linux".into(),
            platform_version: String::new(),
            python_full_version: version(&full)?,
            python_version: version(&short)?,
            sys_platform: "linux".into(),
        })
    }

    /// Best wheel for this target, `None` when no wheel can be installed
    pub fn select_wheel<'w>(&self, wheels: &'w [Artifact]) -> Option<&'w Artifact> {
        let mut best: Option<((u32, u32), &'w Artifact)> = None;
        for wheel in wheels {
            let Some(score) = self.wheel_score(wheel.filename()) else {
                continue;
            };
            // Earlier wheels win ties
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, wheel));
            }
        }
        best.map(|(_, wheel)| wheel)
    }

    /// `(platform rank, interpreter rank)` of a wheel file name
    fn wheel_score(&self, filename: &str) -> Option<(u32, u32)> {
        let (python_tags, abi_tags, platform_tags) = wheel_tags(filename)?;
        let mut best = None;
        for platform in platform_tags.split('.') {
            let Some(platform_rank) = self.platform.rank(platform) else {
                continue;
            };
            for python in python_tags.split('.') {
                for abi in abi_tags.split('.') {
                    if let Some(rank) = self.interpreter_rank(python, abi) {
                        best = best.max(Some((platform_rank, rank)));
                    }
                }
            }
        }
        best
    }

    /// Rank of a python/ABI tag pair: exact ABI, then abi3, then none
    fn interpreter_rank(&self, python: &str, abi: &str) -> Option<u32> {
        let (major, minor) = self.python;
        let exact = format!("cp{}{}", major, minor);
        match abi {
            _ if abi == exact => (python == exact).then_some(3),
            "abi3" => {
                let (tag_major, tag_minor) = split_tag(python.strip_prefix("cp")?)?;
                (tag_major == major && tag_minor.map_or(false, |m| m <= minor)).then_some(2)
            }
            "none" => {
                if python == exact {
                    return Some(1);
                }
                let (tag_major, tag_minor) = split_tag(python.strip_prefix("py")?)?;
                (tag_major == major && tag_minor.map_or(true, |m| m <= minor)).then_some(1)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPython {}.{} on {}",
            self.python.0, self.python.1, self.platform
        )
    }
}

/// Python, ABI and platform tag sets of a wheel file name
pub fn wheel_tags(filename: &str) -> Option<(String, String, String)> {
    let stem = filename.trim().strip_suffix(".whl")?;
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() < 5 {
        return None;
    }
    let n = parts.len();
    Some((
        parts[n - 3].to_ascii_lowercase(),
        parts[n - 2].to_ascii_lowercase(),
        parts[n - 1].to_ascii_lowercase(),
    ))
}

/// `312` -> `(3, Some(12))`, `3` -> `(3, None)`
fn split_tag(digits: &str) -> Option<(u64, Option<u64>)> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let major = digits[..1].parse().ok()?;
    let minor = match &digits[1..] {
        "" => None,
        rest => Some(rest.parse().ok()?),
    };
    Some((major, minor))
}

fn parse_minor(version: &str) -> Option<(u64, u64)> {
    let (major, minor) = version.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Whether a lockfile marker expression holds in `env`
pub fn marker_applies(marker: &str, env: &MarkerEnvironment) -> StrataResult<bool> {
    let tree = MarkerTree::from_str(marker).map_err(|e| {
        StrataError::lock_mismatch(format!("invalid marker '{}': {}", marker, e))
    })?;
    Ok(tree.evaluate(env, &[]))
}

/// Pick the `X.Y` Python version for a `requires-python` constraint.
///
/// The default version wins when the constraint allows it; otherwise the
/// allowed minor version closest to it.
pub fn python_version_for(requires_python: Option<&str>) -> String {
    let Some(constraint) = requires_python else {
        return DEFAULT_PYTHON.to_string();
    };
    let specifiers = match parse_specifiers(constraint) {
        Ok(specifiers) => specifiers,
        Err(reason) => {
            tracing::warn!("Ignoring requires-python '{}': {}", constraint, reason);
            return DEFAULT_PYTHON.to_string();
        }
    };
    let allows = |minor: u64| {
        // Any patch release of the minor version counts
        [0, 99].iter().any(|patch| specifiers.contains(&Version::new([3, minor, *patch])))
    };

    let default_minor = parse_minor(DEFAULT_PYTHON).map_or(12, |(_, minor)| minor);
    let chosen = PYTHON3_MINORS
        .filter(|minor| allows(*minor))
        .min_by_key(|minor| (minor.abs_diff(default_minor), *minor));
    match chosen {
        Some(minor) => format!("3.{}", minor),
        None => {
            tracing::warn!(
                "requires-python '{}' allows no Python 3 release, using {}",
                constraint,
                DEFAULT_PYTHON
            );
            DEFAULT_PYTHON.to_string()
        }
    }
}
