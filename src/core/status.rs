//! Read-only status projection
//!
//! The session publishes a [`StatusSnapshot`] into a `watch` channel after
//! every transition. [`StatusReporter`] reads it without touching the session
//! lock, so dashboards can poll freely even while an apply is in flight. The
//! countdown is stored as a monotonic deadline and turned into seconds at read
//! time, so the snapshot never needs refreshing while time passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::firewall::{ConfigSnapshot, PendingChange, Policy};

/// The pending change as seen by status readers
#[derive(Debug, Clone)]
pub struct PendingView {
    pub id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub deadline: Instant,
}

impl PendingView {
    pub fn new(change: &PendingChange, deadline: Instant) -> Self {
        Self {
            id: change.id,
            description: change.description.clone(),
            created_at: change.created_at,
            deadline,
        }
    }

    /// Whole seconds until the deadline, rounded up
    pub fn seconds_remaining(&self) -> u32 {
        seconds_until(self.deadline)
    }
}

/// Everything status readers may look at, published as one consistent value
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Last committed configuration
    pub active: Arc<ConfigSnapshot>,
    /// What is installed in the kernel right now (the staged side while pending)
    pub live: Arc<ConfigSnapshot>,
    pub pending: Option<PendingView>,
}

impl StatusSnapshot {
    pub fn idle(active: Arc<ConfigSnapshot>) -> Self {
        Self {
            live: Arc::clone(&active),
            active,
            pending: None,
        }
    }
}

/// Summary returned by [`StatusReporter::get_status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub input_policy: Policy,
    pub forward_policy: Policy,
    pub output_policy: Policy,
    pub pending: bool,
    pub seconds_remaining: Option<u32>,
    pub change_id: Option<Uuid>,
    pub description: Option<String>,
}

/// Cheap, cloneable reader of the session's latest state
#[derive(Debug, Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusReporter {
    pub fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// The latest published snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    pub fn get_status(&self) -> EngineStatus {
        let snapshot = self.rx.borrow();
        let policy = &snapshot.live.config.policy;
        let pending = snapshot.pending.as_ref();

        EngineStatus {
            enabled: policy.enabled,
            input_policy: policy.input_policy,
            forward_policy: policy.forward_policy,
            output_policy: policy.output_policy,
            pending: pending.is_some(),
            seconds_remaining: pending.map(PendingView::seconds_remaining),
            change_id: pending.map(|p| p.id),
            description: pending.map(|p| p.description.clone()),
        }
    }
}

fn seconds_until(deadline: Instant) -> u32 {
    let left = deadline.saturating_duration_since(Instant::now());
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}
