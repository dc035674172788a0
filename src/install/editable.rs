//! Editable install of the project package
//!
//! The project is never built into a wheel. A `.pth` file puts its source
//! root on `sys.path` and a minimal dist-info makes it visible to
//! `importlib.metadata`.

use crate::error::StrataResult;
use crate::install::venv::Venv;
use crate::install::wheel::INSTALLER_NAME;
use crate::install::writer::FileWriter;
use crate::resolve::Manifest;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Identity of the project being installed
#[derive(Debug, Clone)]
pub struct ProjectMetadata {
    pub name: String,
    pub version: String,
    pub requires_python: Option<String>,
    pub requires_dist: Vec<String>,
}

impl ProjectMetadata {
    /// Take the project identity from the manifest, with a fallback version
    pub fn from_manifest(manifest: &Manifest, locked_version: Option<&str>) -> Self {
        let version = manifest
            .version
            .clone()
            .or_else(|| locked_version.map(str::to_string))
            .unwrap_or_else(|| "0".to_string());
        Self {
            name: manifest.name.clone(),
            version,
            requires_python: manifest.requires_python.clone(),
            requires_dist: manifest.dependencies.iter().map(|r| r.to_string()).collect(),
        }
    }

    /// Wheel-style escaped name (`my-app` -> `my_app`)
    fn escaped_name(&self) -> String {
        self.name.replace('-', "_")
    }

    fn render_metadata(&self) -> String {
        let mut body = format!(
            "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
            self.name, self.version
        );
        if let Some(requires) = &self.requires_python {
            body.push_str(&format!("Requires-Python: {}\n", requires));
        }
        for dep in &self.requires_dist {
            body.push_str(&format!("Requires-Dist: {}\n", dep));
        }
        body
    }
}

/// Install `project` editable, pointing at `source_root` inside the image.
///
/// Returns the dist-info directory.
pub fn install_editable(
    project: &ProjectMetadata,
    source_root: &Path,
    venv: &Venv,
    writer: &mut FileWriter,
) -> StrataResult<PathBuf> {
    let site = venv.site_packages();
    let escaped = project.escaped_name();

    let pth = site.join(format!("_{}.pth", escaped));
    writer.write(&pth, format!("{}\n", source_root.display()).as_bytes(), false)?;

    let dist_info = site.join(format!("{}-{}.dist-info", escaped, project.version));
    let mut record = vec![pth.clone()];

    let files: Vec<(&str, Vec<u8>)> = vec![
        ("METADATA", project.render_metadata().into_bytes()),
        ("INSTALLER", format!("{}\n", INSTALLER_NAME).into_bytes()),
        (
            "direct_url.json",
            serde_json::to_string_pretty(&json!({
                "dir_info": { "editable": true },
                "url": format!("file://{}", source_root.display()),
            }))?
            .into_bytes(),
        ),
    ];
    for (name, body) in files {
        let path = dist_info.join(name);
        writer.write(&path, &body, false)?;
        record.push(path);
    }

    let record_path = dist_info.join("RECORD");
    record.push(record_path.clone());
    let mut lines: Vec<String> = record
        .iter()
        .map(|p| {
            let rel = p.strip_prefix(&site).unwrap_or(p);
            format!("{},,", rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    lines.sort();
    writer.write(&record_path, format!("{}\n", lines.join("\n")).as_bytes(), false)?;

    Ok(dist_info)
}
