//! Layer cache
//!
//! Committed layers live in the store under their cache key:
//!
//! ```text
//! layers/<key>/layer.json   record: step, content digest, entry listing
//! layers/<key>/tree/        the files the step added or changed
//! ```
//!
//! A layer is assembled under `tmp/` and renamed into place, so its record
//! only ever appears next to a complete tree.

use crate::cache::{CacheState, CacheStore, LAYER_RECORD};
use crate::error::{StrataError, StrataResult};
use crate::layer::digest::{self, Snapshot, TreeDiff};
use crate::layer::step::{BuildStep, InputKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version tag mixed into every cache key
const KEY_SCHEMA: &str = "strata-layer-v1";

/// Metadata of a committed layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub key: String,
    pub step: BuildStep,
    /// Content digest over entries and removals
    pub digest: String,
    pub entries: Snapshot,
    #[serde(default)]
    pub removed: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl LayerRecord {
    /// Number of regular files in the layer
    pub fn files(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, digest::EntryDigest::File { .. }))
            .count()
    }
}

/// Cache key of a step: parent key, step command, declared input digests
pub fn cache_key(parent: &str, command: &str, inputs: &[(InputKind, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_SCHEMA.as_bytes());
    hasher.update([0]);
    hasher.update(parent.as_bytes());
    hasher.update([0]);
    hasher.update(command.as_bytes());
    hasher.update([0]);
    for (kind, digest) in inputs {
        hasher.update(kind.to_string().as_bytes());
        hasher.update(b"=");
        hasher.update(digest.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Lookup, commit and apply of layers in a store
pub struct LayerCache<'a> {
    store: &'a CacheStore,
}

impl<'a> LayerCache<'a> {
    pub fn new(store: &'a CacheStore) -> Self {
        Self { store }
    }

    /// Tree directory of a committed layer
    pub fn tree_dir(&self, key: &str) -> PathBuf {
        self.store.layer_dir(key).join("tree")
    }

    /// Record of a complete layer, if one is committed under `key`
    pub fn lookup(&self, key: &str) -> StrataResult<Option<LayerRecord>> {
        if self.store.layer_state(key) != CacheState::Complete {
            return Ok(None);
        }
        let path = self.store.layer_dir(key).join(LAYER_RECORD);
        let content = fs::read_to_string(&path)
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Commit the changes a step made to `rootfs` under `key`
    pub fn commit(
        &self,
        key: &str,
        step: BuildStep,
        rootfs: &Path,
        diff: &TreeDiff,
    ) -> StrataResult<LayerRecord> {
        let record = LayerRecord {
            key: key.to_string(),
            step,
            digest: digest::snapshot_digest(&diff.changed, &diff.removed),
            entries: diff.changed.clone(),
            removed: diff.removed.clone(),
            created_at: Utc::now(),
        };

        let staging = self.store.tmp_path("layer");
        let tree = staging.join("tree");
        fs::create_dir_all(&tree)
            .map_err(|e| StrataError::io(format!("creating {}", tree.display()), e))?;
        digest::copy_entries(rootfs, &tree, &diff.changed)?;
        fs::write(
            staging.join(LAYER_RECORD),
            serde_json::to_string_pretty(&record)?,
        )
        .map_err(|e| StrataError::io(format!("writing layer record for {}", step), e))?;

        let dest = self.store.layer_dir(key);
        match self.store.layer_state(key) {
            CacheState::Complete => {
                // Another build committed the same key first; keep theirs
                let _ = fs::remove_dir_all(&staging);
                return self.existing(key);
            }
            CacheState::Building => {
                debug!("Discarding interrupted layer {}", key);
                fs::remove_dir_all(&dest)
                    .map_err(|e| StrataError::io(format!("removing {}", dest.display()), e))?;
            }
            CacheState::Miss => {}
        }

        if let Err(e) = fs::rename(&staging, &dest) {
            let _ = fs::remove_dir_all(&staging);
            if self.store.layer_state(key) == CacheState::Complete {
                return self.existing(key);
            }
            return Err(StrataError::io(format!("committing layer {}", key), e));
        }

        debug!(
            "Committed {} layer {} ({} entries)",
            step,
            &record.digest[..12],
            record.entries.len()
        );
        Ok(record)
    }

    /// Replay a committed layer onto `rootfs`
    pub fn apply(&self, record: &LayerRecord, rootfs: &Path) -> StrataResult<()> {
        digest::copy_entries(&self.tree_dir(&record.key), rootfs, &record.entries)?;
        digest::remove_entries(rootfs, &record.removed)
    }

    fn existing(&self, key: &str) -> StrataResult<LayerRecord> {
        self.lookup(key)?.ok_or_else(|| {
            StrataError::Internal(format!("layer {} vanished while committing", key))
        })
    }
}
