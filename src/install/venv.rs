//! Virtual environment layout
//!
//! The environment lives at `<workdir>/.venv` inside the staging root and
//! points at the base image's interpreter. Nothing here runs Python; the
//! layout is written directly so the result is byte-for-byte reproducible.

use crate::error::{StrataError, StrataResult};
use crate::install::writer::FileWriter;
use crate::resolve::normalize_name;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Interpreter path in the base image
pub const DEFAULT_INTERPRETER: &str = "/usr/local/bin/python3";

/// A distribution found in site-packages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDist {
    pub version: String,
    pub dist_info: PathBuf,
}

/// Virtual environment rooted at a host path
#[derive(Debug, Clone)]
pub struct Venv {
    root: PathBuf,
    image_path: PathBuf,
    python_version: String,
    interpreter: PathBuf,
}

impl Venv {
    /// Describe an environment at `root` for Python `X.Y`
    pub fn new(root: impl Into<PathBuf>, python_version: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            image_path: root.clone(),
            root,
            python_version: python_version.into(),
            interpreter: PathBuf::from(DEFAULT_INTERPRETER),
        }
    }

    /// Use a different base interpreter
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Where the environment will live inside the image
    pub fn with_image_path(mut self, image_path: impl Into<PathBuf>) -> Self {
        self.image_path = image_path.into();
        self
    }

    /// Interpreter path as seen from inside the image
    pub fn image_python(&self) -> PathBuf {
        self.image_path.join("bin").join("python")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python_version(&self) -> &str {
        &self.python_version
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn site_packages(&self) -> PathBuf {
        self.root
            .join("lib")
            .join(format!("python{}", self.python_version))
            .join("site-packages")
    }

    /// Create or refresh the environment skeleton
    pub fn ensure(&self, writer: &mut FileWriter) -> StrataResult<()> {
        let home = self
            .interpreter
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/usr/local/bin".to_string());
        let cfg = format!(
            "home = {}\ninclude-system-site-packages = false\nversion = {}\n",
            home, self.python_version
        );
        writer.write(&self.root.join("pyvenv.cfg"), cfg.as_bytes(), false)?;

        let bin = self.bin_dir();
        for name in [
            "python".to_string(),
            "python3".to_string(),
            format!("python{}", self.python_version),
        ] {
            writer.symlink(&bin.join(name), &self.interpreter)?;
        }

        let site = self.site_packages();
        fs::create_dir_all(&site)
            .map_err(|e| StrataError::io(format!("creating {}", site.display()), e))?;
        Ok(())
    }

    /// Distributions present in site-packages, keyed by normalized name
    pub fn installed(&self) -> StrataResult<BTreeMap<String, InstalledDist>> {
        let site = self.site_packages();
        let mut found = BTreeMap::new();
        let entries = match fs::read_dir(&site) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(StrataError::io(format!("reading {}", site.display()), e)),
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".dist-info")) else {
                continue;
            };
            if let Some((name, version)) = stem.rsplit_once('-') {
                found.insert(
                    normalize_name(name),
                    InstalledDist {
                        version: version.to_string(),
                        dist_info: entry.path(),
                    },
                );
            }
        }
        Ok(found)
    }
}
