//! Audit Trail
//!
//! One JSON event line per engine-level operation, appended to
//! `audit/audit.jsonl`. The trail is observability, never correctness: a
//! failed append is logged and swallowed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, Result};

// ============================================================================
// EVENTS
// ============================================================================

/// One audited engine operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the operation ran
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Operation name: breathe, recall, forget, consolidate, repair
    pub op: String,
    /// Identity the operation acted on
    pub ci_id: String,
    /// Record involved, when there is a single one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Free-form context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ============================================================================
// AUDIT LOG
// ============================================================================

/// Append-only audit writer
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open the audit log under the given directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err("creating audit directory"))?;
        Ok(Self {
            path: dir.join("audit.jsonl"),
        })
    }

    /// Record one operation. Best-effort: failures are logged, not raised.
    pub fn record(
        &self,
        op: &str,
        ci_id: &str,
        record_id: Option<&str>,
        detail: Option<String>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            op: op.to_string(),
            ci_id: ci_id.to_string(),
            record_id: record_id.map(String::from),
            detail,
        };
        if let Err(e) = self.append(&event) {
            tracing::warn!(op, ci_id, error = %e, "audit append failed");
        }
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }
}

// ============================================================================
// TESTS
// ============================================================================
