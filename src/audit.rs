//! Audit log of build lifecycle events
//!
//! Appends JSON lines to `<state dir>/strata/audit.log`: which tag was
//! built from which inputs, the resulting image digest, and failures with
//! their error kind. Enabled unless `general.audit_log = false`.

use crate::config::{schema::Config, ConfigManager};
use crate::error::StrataError;
use crate::layer::BuildReport;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Log an audit event as a JSON line.
    ///
    /// IO failures are logged and dropped; they never fail the build.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log: {}", e);
        }
    }

    /// Record a successful build
    pub async fn build_completed(&self, report: &BuildReport, attempt: u32) {
        let steps: Vec<_> = report
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "step": s.step,
                    "cache_key": s.cache_key,
                    "cache_hit": s.cache_hit,
                    "digest": s.digest,
                })
            })
            .collect();
        self.log(
            "build.completed",
            &serde_json::json!({
                "tag": report.tag,
                "image_digest": report.image_digest,
                "attempt": attempt,
                "fetched": report.fetched,
                "steps": steps,
            }),
        )
        .await;
    }

    /// Record a failed build attempt
    pub async fn build_failed(&self, tag: &str, attempt: u32, error: &StrataError) {
        self.log(
            "build.failed",
            &serde_json::json!({
                "tag": tag,
                "attempt": attempt,
                "retryable": error.is_retryable(),
                "error": error.to_string(),
            }),
        )
        .await;
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
