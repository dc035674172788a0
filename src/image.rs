//! Image writer
//!
//! An image is a directory `<output>/<tag>/`:
//!
//! ```text
//! image.json                 tag, base, ordered layers, runtime config
//! layers/<digest>/layer.json step, digest, removals
//! layers/<digest>/tree/      layer contents
//! ```
//!
//! The directory is assembled next to its destination and swapped in only
//! once complete. A failed build leaves the previous image for the tag
//! untouched.

use crate::cache::store::sanitize;
use crate::entry::LaunchCommand;
use crate::error::{StrataError, StrataResult};
use crate::layer::cache::{LayerCache, LayerRecord};
use crate::layer::digest;
use crate::layer::step::BuildStep;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Image document schema version
pub const IMAGE_SCHEMA: u32 = 1;

/// Runtime settings of the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub cmd: Vec<String>,
    /// In-image path of the runtime configuration file
    pub runtime_config: PathBuf,
}

impl ImageConfig {
    pub fn from_launch(launch: &LaunchCommand, runtime_config: &Path) -> Self {
        let mut env = BTreeMap::new();
        let venv_bin = launch.working_dir.join(".venv").join("bin");
        env.insert(
            "PATH".to_string(),
            format!(
                "{}:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                venv_bin.display()
            ),
        );
        env.insert(
            "VIRTUAL_ENV".to_string(),
            launch.working_dir.join(".venv").display().to_string(),
        );
        Self {
            working_dir: launch.working_dir.clone(),
            env,
            exposed_ports: vec![launch.port],
            cmd: launch.argv(),
            runtime_config: runtime_config.to_path_buf(),
        }
    }
}

/// One layer reference in `image.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayer {
    pub step: BuildStep,
    pub key: String,
    pub digest: String,
    pub files: usize,
}

/// Contents of `image.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema: u32,
    pub tag: String,
    /// Base image reference the layers apply on top of
    pub base_image: String,
    pub layers: Vec<ImageLayer>,
    pub config: ImageConfig,
}

impl ImageManifest {
    pub fn new(
        tag: &str,
        base_image: &str,
        records: &[LayerRecord],
        config: ImageConfig,
    ) -> Self {
        Self {
            schema: IMAGE_SCHEMA,
            tag: tag.to_string(),
            base_image: base_image.to_string(),
            layers: records
                .iter()
                .map(|r| ImageLayer {
                    step: r.step,
                    key: r.key.clone(),
                    digest: r.digest.clone(),
                    files: r.files(),
                })
                .collect(),
            config,
        }
    }

    /// Digest of the image document
    pub fn digest(&self) -> StrataResult<String> {
        let body = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&body)))
    }

    /// Read `image.json` from an image directory
    pub fn read(image_dir: &Path) -> StrataResult<Self> {
        let path = image_dir.join("image.json");
        let content = fs::read_to_string(&path)
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Serialize)]
struct LayerSummary<'a> {
    step: BuildStep,
    digest: &'a str,
    removed: &'a [String],
}

/// Directory an image for `tag` is written to
pub fn image_dir(output_dir: &Path, tag: &str) -> PathBuf {
    output_dir.join(sanitize(tag))
}

/// Write the image for `manifest` under `output_dir`, replacing any previous one
pub fn write_image(
    output_dir: &Path,
    manifest: &ImageManifest,
    layers: &LayerCache<'_>,
    records: &[LayerRecord],
) -> StrataResult<PathBuf> {
    fs::create_dir_all(output_dir)
        .map_err(|e| StrataError::io(format!("creating {}", output_dir.display()), e))?;

    let dest = image_dir(output_dir, &manifest.tag);
    let id = uuid::Uuid::new_v4();
    let staging = output_dir.join(format!(".{}.tmp-{}", sanitize(&manifest.tag), id));

    let result = assemble(&staging, manifest, layers, records);
    if let Err(e) = result {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let previous = output_dir.join(format!(".{}.old-{}", sanitize(&manifest.tag), id));
    if dest.exists() {
        fs::rename(&dest, &previous)
            .map_err(|e| StrataError::io(format!("moving aside {}", dest.display()), e))?;
    }
    if let Err(e) = fs::rename(&staging, &dest) {
        // Put the previous image back before reporting
        if previous.exists() {
            let _ = fs::rename(&previous, &dest);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(StrataError::io(format!("publishing {}", dest.display()), e));
    }
    if previous.exists() {
        let _ = fs::remove_dir_all(&previous);
    }

    debug!("Wrote image {} to {}", manifest.tag, dest.display());
    Ok(dest)
}

fn assemble(
    staging: &Path,
    manifest: &ImageManifest,
    layers: &LayerCache<'_>,
    records: &[LayerRecord],
) -> StrataResult<()> {
    fs::create_dir_all(staging)
        .map_err(|e| StrataError::io(format!("creating {}", staging.display()), e))?;
    for record in records {
        let layer_dir = staging.join("layers").join(&record.digest);
        if layer_dir.exists() {
            continue;
        }
        let tree = layer_dir.join("tree");
        fs::create_dir_all(&tree)
            .map_err(|e| StrataError::io(format!("creating {}", tree.display()), e))?;
        digest::copy_entries(&layers.tree_dir(&record.key), &tree, &record.entries)?;
        let summary = LayerSummary {
            step: record.step,
            digest: &record.digest,
            removed: &record.removed,
        };
        fs::write(
            layer_dir.join("layer.json"),
            serde_json::to_string_pretty(&summary)?,
        )
        .map_err(|e| StrataError::io(format!("writing layer summary for {}", record.step), e))?;
    }

    let doc = serde_json::to_string_pretty(manifest)?;
    fs::write(staging.join("image.json"), doc)
        .map_err(|e| StrataError::io("writing image.json", e))?;
    Ok(())
}
