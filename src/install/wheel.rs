//! Wheel unpacking
//!
//! Installs a wheel archive into a [`Venv`] the way a PEP 427 installer
//! does: archive entries land in site-packages, `<dist>.data/` subtrees are
//! routed to their scheme directories, and `#!python` script shebangs are
//! pointed at the environment's interpreter. Entry names that would
//! escape the destination abort the install.
//!
//! Removal reads the wheel's own `RECORD` from the installed dist-info and
//! deletes what it lists, so an upgraded distribution leaves no stale
//! modules behind.

use crate::error::{StrataError, StrataResult};
use crate::install::venv::Venv;
use crate::install::writer::FileWriter;
use crate::resolve::LockedPackage;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::warn;
use zip::ZipArchive;

/// Marker written into every installed dist-info directory
pub const INSTALLER_NAME: &str = "strata";

/// Result of unpacking one wheel
#[derive(Debug, Clone)]
pub struct UnpackedWheel {
    /// The wheel's `.dist-info` directory in site-packages
    pub dist_info: PathBuf,
    /// Archive entries installed
    pub entries: usize,
}

/// Unpack `bytes` (a wheel) for `package` into `venv`
pub fn unpack_wheel(
    package: &LockedPackage,
    bytes: &[u8],
    venv: &Venv,
    writer: &mut FileWriter,
) -> StrataResult<UnpackedWheel> {
    let fail = |reason: String| StrataError::install(package.pin(), reason);

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| fail(format!("not a valid wheel archive: {}", e)))?;

    let site = venv.site_packages();
    let mut dist_info: Option<PathBuf> = None;
    let mut entries = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| fail(format!("reading archive entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let rel = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| fail(format!("archive entry '{}' escapes the install root", name)))?;

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| fail(format!("extracting '{}': {}", name, e)))?;
        let mode_exec = entry.unix_mode().is_some_and(|m| m & 0o111 != 0);

        let (dest, is_script) = route_entry(&rel, venv).map_err(fail)?;
        if let Some(first) = first_component(&rel) {
            if first.ends_with(".dist-info") && dist_info.is_none() {
                dist_info = Some(site.join(first));
            }
        }

        if is_script {
            contents = rewrite_shebang(contents, &venv.image_python());
        }
        writer.write(&dest, &contents, mode_exec || is_script)?;
        entries += 1;
    }

    let dist_info =
        dist_info.ok_or_else(|| fail("wheel has no .dist-info directory".to_string()))?;
    writer.write(
        &dist_info.join("INSTALLER"),
        format!("{}\n", INSTALLER_NAME).as_bytes(),
        false,
    )?;

    Ok(UnpackedWheel {
        dist_info,
        entries,
    })
}

/// Remove an installed distribution: every file its `RECORD` lists, then
/// the dist-info directory. Returns the number of files removed.
pub fn remove_installed(dist_info: &Path, venv: &Venv) -> StrataResult<usize> {
    let record = dist_info.join("RECORD");
    let listing = match fs::read_to_string(&record) {
        Ok(listing) => listing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(StrataError::io(format!("reading {}", record.display()), e)),
    };

    let mut removed = 0;
    let mut parents = Vec::new();
    for line in listing.lines() {
        let Some(path) = record_path(line) else {
            continue;
        };
        let rel = Path::new(path);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Ignoring RECORD entry '{}' outside the environment", path);
            continue;
        }
        let Ok((dest, _)) = route_entry(rel, venv) else {
            continue;
        };
        if dest.starts_with(dist_info) {
            continue;
        }
        match fs::remove_file(&dest) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StrataError::io(format!("removing {}", dest.display()), e)),
        }
        if let Some(parent) = dest.parent() {
            parents.push(parent.to_path_buf());
        }
    }

    fs::remove_dir_all(dist_info)
        .map_err(|e| StrataError::io(format!("removing {}", dist_info.display()), e))?;

    // Drop package directories left empty, deepest first
    parents.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    parents.dedup();
    let site = venv.site_packages();
    let bin = venv.bin_dir();
    let keep = [venv.root(), site.as_path(), bin.as_path()];
    for parent in &parents {
        let mut dir = parent.as_path();
        while dir.starts_with(venv.root()) && !keep.contains(&dir) {
            if fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    Ok(removed)
}

/// First field of a RECORD row, honoring CSV quoting
fn record_path(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    let path = match line.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => line.split(',').next()?,
    };
    (!path.is_empty()).then_some(path)
}

/// Map an archive path to its destination; the flag marks scripts
fn route_entry(rel: &Path, venv: &Venv) -> Result<(PathBuf, bool), String> {
    let mut components = rel.components();
    let first = match components.next() {
        Some(Component::Normal(c)) => c.to_string_lossy().into_owned(),
        _ => return Err(format!("unexpected archive path {}", rel.display())),
    };

    if !first.ends_with(".data") {
        return Ok((venv.site_packages().join(rel), false));
    }

    let scheme = match components.next() {
        Some(Component::Normal(c)) => c.to_string_lossy().into_owned(),
        _ => return Err(format!("malformed data entry {}", rel.display())),
    };
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        return Err(format!("malformed data entry {}", rel.display()));
    }

    match scheme.as_str() {
        "purelib" | "platlib" => Ok((venv.site_packages().join(rest), false)),
        "scripts" => Ok((venv.bin_dir().join(rest), true)),
        "data" => Ok((venv.root().join(rest), false)),
        "headers" => {
            let dist = first.trim_end_matches(".data");
            let dir = venv
                .root()
                .join("include")
                .join("site")
                .join(format!("python{}", venv.python_version()))
                .join(dist);
            Ok((dir.join(rest), false))
        }
        other => Err(format!("unknown wheel data scheme '{}'", other)),
    }
}

fn first_component(path: &Path) -> Option<String> {
    match path.components().next() {
        Some(Component::Normal(c)) => Some(c.to_string_lossy().into_owned()),
        _ => None,
    }
}

/// Replace a `#!python` / `#!pythonw` shebang with the venv interpreter
fn rewrite_shebang(contents: Vec<u8>, python: &Path) -> Vec<u8> {
    if !contents.starts_with(b"#!python") {
        return contents;
    }
    let line_end = contents
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(contents.len());
    let mut out = format!("#!{}", python.display()).into_bytes();
    out.extend_from_slice(&contents[line_end..]);
    out
}
