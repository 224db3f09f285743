//! Audit trail of firewall change transitions
//!
//! Every stage, confirm, revert, recovery and failed rollback attempt is
//! appended to `audit.log` in the state directory as one JSON object per line.
//! Audit failures are logged and never interrupt the change they describe.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::core::firewall::PendingChange;

pub const AUDIT_FILE: &str = "audit.log";

/// What happened to a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Stage,
    Confirm,
    Revert,
    AutoRevertTimedOut,
    RecoveryRevert,
    RecoveryResume,
    /// Unconfirmed change rolled back because the daemon was stopping
    ShutdownRevert,
    ApplyFailed,
    RollbackFailed,
    /// Configuration-only edit committed without touching the kernel
    DirectCommit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub event: EventType,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<Uuid>,
    #[serde(default)]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event: EventType, ok: bool, details: Value, error: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            event,
            ok,
            change_id: None,
            details,
            error,
        }
    }

    /// A completed transition of `change`
    pub fn for_change(event: EventType, change: &PendingChange) -> Self {
        Self {
            change_id: Some(change.id),
            ..Self::new(event, true, change_details(change), None)
        }
    }

    /// A failed attempt at a transition of `change`
    pub fn failed(event: EventType, change: &PendingChange, error: impl ToString) -> Self {
        Self {
            change_id: Some(change.id),
            ..Self::new(event, false, change_details(change), Some(error.to_string()))
        }
    }
}

fn change_details(change: &PendingChange) -> Value {
    json!({
        "description": change.description,
        "created_at": change.created_at,
        "rules_before": change.before.rules.fingerprint(),
        "rules_after": change.after.rules.fingerprint(),
    })
}

/// Append-only JSON-lines writer for [`AuditEvent`]s
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(AUDIT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event` as a single line and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the log cannot be opened or written.
    pub async fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await
    }

    /// Appends `event`, downgrading a write failure to a warning.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event).await {
            tracing::warn!(
                event = %event.event,
                path = %self.path.display(),
                "Audit write failed: {e}"
            );
        }
    }

    /// Up to `limit` events, newest first. Unparseable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the log exists but cannot be read.
    pub async fn recent(&self, limit: usize) -> std::io::Result<Vec<AuditEvent>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(text
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
            .take(limit)
            .collect())
    }
}
