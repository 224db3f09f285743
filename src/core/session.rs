//! Commit-confirm change session
//!
//! [`ChangeSession`] is the single writer for the firewall. Every change goes
//! through the same cycle:
//!
//! 1. `stage`: compile the edited configuration, persist a [`PendingChange`],
//!    install the new rules and start a countdown.
//! 2. `confirm`: commit the staged side as the new active configuration.
//! 3. `revert` (explicit, or the countdown running out): reinstall the
//!    previous rules and commit them as active again.
//!
//! Only one change can be pending at a time. Transitions are serialized by an
//! async mutex that is held across the apply, and each one publishes a fresh
//! [`StatusSnapshot`] so readers never have to take the lock.
//!
//! The pending record is written before new rules go live and is marked with
//! its outcome before the outcome is carried out, so [`ChangeSession::start`]
//! can always finish or undo whatever a crashed process left behind.
//!
//! A session holds the [`StoreLock`] on its state directory for as long as it
//! lives, so two processes never drive the same table at once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::command::ConfigCommand;
use crate::core::applier::RuleApplier;
use crate::core::compiler::compile;
use crate::core::error::{Error, Result};
use crate::core::firewall::{
    ChangeState, ConfigSnapshot, FirewallConfig, NetworkLayout, PendingChange,
};
use crate::core::status::{PendingView, StatusReporter, StatusSnapshot};
use crate::core::store::{RuleStore, StoreLock};

/// What to do with an unconfirmed change found at startup
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RecoveryPolicy {
    /// Reinstall the rules from before the change
    #[default]
    Revert,
    /// Keep the change live for whatever remains of its countdown
    Resume,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub recovery: RecoveryPolicy,
    /// Reinstall the active rules when starting with nothing pending
    pub apply_on_startup: bool,
    /// First delay between failed rollback attempts; doubles up to the max
    pub rollback_backoff: Duration,
    pub rollback_backoff_max: Duration,
    pub audit: Option<AuditLog>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            recovery: RecoveryPolicy::Revert,
            apply_on_startup: true,
            rollback_backoff: Duration::from_millis(500),
            rollback_backoff_max: Duration::from_secs(30),
            audit: None,
        }
    }
}

/// Result of [`ChangeSession::stage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// New rules are live and must be confirmed before the countdown ends
    Staged { id: Uuid, seconds_remaining: u32 },
    /// The change compiled to the rules already live; nothing is pending
    Unchanged,
}

struct Pending {
    change: PendingChange,
    live: Arc<ConfigSnapshot>,
    deadline: Instant,
    cancel: CancellationToken,
}

struct Inner {
    active: Arc<ConfigSnapshot>,
    pending: Option<Pending>,
}

pub struct ChangeSession {
    layout: NetworkLayout,
    store: RuleStore,
    applier: Arc<dyn RuleApplier>,
    options: SessionOptions,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<StatusSnapshot>,
    _lock: StoreLock,
}

impl std::fmt::Debug for ChangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSession")
            .field("layout", &self.layout)
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ChangeSession {
    /// Loads the stored state, recovers any change left pending by a previous
    /// process and returns the running session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`](crate::core::error::StoreError::Locked)
    /// if another process already runs a session on the same state
    /// directory. Also returns `Err` if a stored record cannot be trusted, the active
    /// configuration no longer compiles for `layout`, or the startup apply
    /// fails.
    pub async fn start(
        layout: NetworkLayout,
        store: RuleStore,
        applier: Arc<dyn RuleApplier>,
        options: SessionOptions,
    ) -> Result<Arc<Self>> {
        let lock = store.lock()?;
        let active = match store.load_active()? {
            Some(snapshot) => snapshot,
            None => {
                info!("No active configuration stored, starting from defaults");
                let config = FirewallConfig::default();
                let rules = compile(&config, &layout)?;
                ConfigSnapshot { config, rules }
            }
        };
        let record = store.load_pending()?;

        let active = Arc::new(active);
        let (status_tx, _) = watch::channel(StatusSnapshot::idle(Arc::clone(&active)));
        let session = Arc::new(Self {
            layout,
            store,
            applier,
            options,
            inner: Mutex::new(Inner {
                active,
                pending: None,
            }),
            status_tx,
            _lock: lock,
        });

        session.recover(record).await?;
        Ok(session)
    }

    pub fn layout(&self) -> &NetworkLayout {
        &self.layout
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// A lock-free reader of this session's state
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.status_tx.subscribe())
    }

    /// Applies `command` to the active configuration and makes the result live
    /// pending confirmation.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if another change is pending
    /// - [`Error::Compile`] if the edited configuration is invalid
    /// - [`Error::Apply`] if the new rules could not be installed; the
    ///   previous rules stay live and nothing is pending
    pub async fn stage(self: &Arc<Self>, command: ConfigCommand) -> Result<StageOutcome> {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = &inner.pending {
            return Err(Error::Conflict(pending.change.id));
        }

        let before = Arc::clone(&inner.active);
        let mut config = before.config.clone();
        command.execute(&mut config);
        let rules = compile(&config, &self.layout)?;

        if rules == before.rules {
            if config != before.config {
                let snapshot = ConfigSnapshot { config, rules };
                self.store.commit_active(&snapshot)?;
                inner.active = Arc::new(snapshot);
                self.publish(&inner);
                info!(
                    description = %command.description(),
                    "Configuration updated without rule changes"
                );
                self.audit(AuditEvent::new(
                    EventType::DirectCommit,
                    true,
                    serde_json::json!({
                        "description": command.description(),
                        "rules": inner.active.rules.fingerprint(),
                    }),
                    None,
                ))
                .await;
            } else {
                debug!(description = %command.description(), "Change is a no-op");
            }
            return Ok(StageOutcome::Unchanged);
        }

        let change = PendingChange::new(
            command.description(),
            (*before).clone(),
            ConfigSnapshot { config, rules },
        );
        self.store.persist_pending(&change)?;

        if let Err(e) = self.applier.apply(&change.after.rules).await {
            error!(change_id = %change.id, "Failed to apply staged rules: {e}");
            self.audit(AuditEvent::failed(EventType::ApplyFailed, &change, &e))
                .await;
            if let Err(clear_err) = self.store.clear_pending() {
                warn!(change_id = %change.id, "Failed to clear pending record: {clear_err}");
            }
            return Err(e.into());
        }

        let outcome = StageOutcome::Staged {
            id: change.id,
            seconds_remaining: change.timeout_seconds,
        };
        info!(
            change_id = %change.id,
            description = %change.description,
            timeout_secs = change.timeout_seconds,
            "Change staged, awaiting confirmation"
        );
        self.audit(AuditEvent::for_change(EventType::Stage, &change))
            .await;

        let deadline = Instant::now() + Duration::from_secs(u64::from(change.timeout_seconds));
        self.arm(&mut inner, change, deadline);
        self.publish(&inner);
        Ok(outcome)
    }

    /// Keeps the pending change and makes it the active configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPendingChange`] when nothing is pending, or a store
    /// error if the change could not be committed (it then stays pending).
    pub async fn confirm(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = &inner.pending else {
            return Err(Error::NoPendingChange("confirm"));
        };

        let change = pending.change.with_state(ChangeState::Confirmed);
        self.store.persist_pending(&change)?;
        if let Err(e) = self.store.commit_active(&change.after) {
            error!(change_id = %change.id, "Failed to commit confirmed change: {e}");
            // a Confirmed record is committed on restart, so it must not outlive this failure
            if let Err(restore_err) = self.store.persist_pending(&pending.change) {
                warn!(change_id = %change.id, "Failed to restore staged record: {restore_err}");
            }
            return Err(e);
        }

        if let Some(pending) = inner.pending.take() {
            pending.cancel.cancel();
            inner.active = pending.live;
        }
        if let Err(e) = self.store.clear_pending() {
            warn!(change_id = %change.id, "Failed to clear confirmed record: {e}");
        }
        self.publish(&inner);

        info!(change_id = %change.id, description = %change.description, "Change confirmed");
        self.audit(AuditEvent::for_change(EventType::Confirm, &change))
            .await;
        Ok(())
    }

    /// Rolls the pending change back right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPendingChange`] when nothing is pending.
    pub async fn revert(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.take() else {
            return Err(Error::NoPendingChange("revert"));
        };
        info!(change_id = %pending.change.id, "Reverting change on request");
        pending.cancel.cancel();
        self.revert_change(&mut inner, pending.change, EventType::Revert)
            .await;
        Ok(())
    }

    /// Rolls back any pending change before the process exits. Does nothing
    /// when nothing is pending.
    ///
    /// # Errors
    ///
    /// Currently infallible; rollback and commit failures are retried until
    /// they succeed.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.take() else {
            debug!("No pending change at shutdown");
            return Ok(());
        };
        warn!(
            change_id = %pending.change.id,
            description = %pending.change.description,
            "Reverting unconfirmed change before exit"
        );
        pending.cancel.cancel();
        self.revert_change(&mut inner, pending.change, EventType::ShutdownRevert)
            .await;
        Ok(())
    }

    /// Countdown expiry for change `id`.
    ///
    /// Does nothing unless `id` is still the pending change, so a countdown
    /// racing a confirm or revert is harmless.
    pub async fn expire(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.pending.take() {
            Some(pending) if pending.change.id == id => {
                warn!(change_id = %id, "Change was not confirmed in time, reverting");
                self.revert_change(&mut inner, pending.change, EventType::AutoRevertTimedOut)
                    .await;
            }
            other => {
                inner.pending = other;
                debug!(change_id = %id, "Ignoring countdown for a settled change");
            }
        }
        Ok(())
    }

    async fn recover(self: &Arc<Self>, record: Option<PendingChange>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut installed = false;

        if let Some(change) = record {
            match change.state {
                ChangeState::Confirmed => {
                    info!(change_id = %change.id, "Finishing confirmation interrupted by restart");
                    self.store.commit_active(&change.after)?;
                    self.store.clear_pending()?;
                    inner.active = Arc::new(change.after);
                }
                ChangeState::Reverted => {
                    info!(change_id = %change.id, "Finishing revert interrupted by restart");
                    self.revert_change(&mut inner, change, EventType::RecoveryRevert)
                        .await;
                    installed = true;
                }
                ChangeState::Staged => {
                    let change = match self.options.recovery {
                        RecoveryPolicy::Resume => match self.try_resume(&mut inner, change).await {
                            None => {
                                self.publish(&inner);
                                return Ok(());
                            }
                            Some(change) => change,
                        },
                        RecoveryPolicy::Revert => change,
                    };
                    warn!(
                        change_id = %change.id,
                        description = %change.description,
                        "Reverting change left unconfirmed by previous run"
                    );
                    self.revert_change(&mut inner, change, EventType::RecoveryRevert)
                        .await;
                    installed = true;
                }
            }
        }

        let rules = compile(&inner.active.config, &self.layout)?;
        if rules != inner.active.rules {
            info!("Network layout changed, recompiled active rules");
            let snapshot = ConfigSnapshot {
                config: inner.active.config.clone(),
                rules,
            };
            self.store.commit_active(&snapshot)?;
            inner.active = Arc::new(snapshot);
            installed = false;
        }

        if self.options.apply_on_startup && !installed {
            self.applier.apply(&inner.active.rules).await?;
            info!(
                fingerprint = %inner.active.rules.fingerprint(),
                "Installed active rules"
            );
        }

        self.publish(&inner);
        Ok(())
    }

    /// Puts a recovered change back on its countdown. Hands the change back
    /// when it can't be resumed and has to be reverted instead.
    async fn try_resume(
        self: &Arc<Self>,
        inner: &mut Inner,
        change: PendingChange,
    ) -> Option<PendingChange> {
        let timeout = Duration::from_secs(u64::from(change.timeout_seconds));
        let Some(remaining) = change
            .remaining_at(chrono::Utc::now())
            .filter(|remaining| *remaining <= timeout)
        else {
            info!(change_id = %change.id, "Recovered change already expired");
            return Some(change);
        };

        if let Err(e) = self.applier.apply(&change.after.rules).await {
            error!(change_id = %change.id, "Failed to reinstall recovered change: {e}");
            return Some(change);
        }

        info!(
            change_id = %change.id,
            remaining_secs = remaining.as_secs(),
            "Resumed countdown for recovered change"
        );
        self.audit(AuditEvent::for_change(EventType::RecoveryResume, &change))
            .await;
        self.arm(inner, change, Instant::now() + remaining);
        None
    }

    fn arm(self: &Arc<Self>, inner: &mut Inner, change: PendingChange, deadline: Instant) {
        let cancel = CancellationToken::new();
        spawn_countdown(Arc::downgrade(self), change.id, deadline, cancel.clone());
        inner.pending = Some(Pending {
            live: Arc::new(change.after.clone()),
            change,
            deadline,
            cancel,
        });
    }

    /// Reinstalls `change.before` and commits it as active. Retries until
    /// both the kernel and the store agree again.
    async fn revert_change(&self, inner: &mut Inner, change: PendingChange, event: EventType) {
        let change = change.with_state(ChangeState::Reverted);
        if let Err(e) = self.store.persist_pending(&change) {
            warn!(change_id = %change.id, "Failed to mark change as reverted: {e}");
        }

        self.rollback_until_applied(&change).await;

        let mut backoff = self.backoff();
        let mut attempt: u32 = 1;
        while let Err(e) = self.store.commit_active(&change.before) {
            error!(change_id = %change.id, attempt, "Failed to commit reverted configuration: {e}");
            backoff.wait().await;
            attempt += 1;
        }
        if let Err(e) = self.store.clear_pending() {
            warn!(change_id = %change.id, "Failed to clear reverted record: {e}");
        }

        inner.active = Arc::new(change.before.clone());
        self.publish(inner);

        info!(change_id = %change.id, description = %change.description, "Change reverted");
        self.audit(AuditEvent::for_change(event, &change)).await;
    }

    async fn rollback_until_applied(&self, change: &PendingChange) {
        let mut backoff = self.backoff();
        let mut attempt: u32 = 1;

        loop {
            match self
                .applier
                .apply_emergency_rollback(&change.before.rules)
                .await
            {
                Ok(()) => {
                    if attempt > 1 {
                        info!(change_id = %change.id, attempt, "Rollback succeeded after retry");
                    }
                    return;
                }
                Err(e) => {
                    if attempt == 1 {
                        error!(
                            alert = true,
                            change_id = %change.id,
                            "Rollback failed, live rules differ from the committed configuration: {e}"
                        );
                    } else {
                        error!(
                            change_id = %change.id,
                            attempt,
                            retry_in_ms = u64::try_from(backoff.next.as_millis()).unwrap_or(u64::MAX),
                            "Rollback attempt failed: {e}"
                        );
                    }
                    self.audit(AuditEvent::failed(EventType::RollbackFailed, change, &e))
                        .await;
                    backoff.wait().await;
                    attempt += 1;
                }
            }
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            next: self.options.rollback_backoff,
            max: self.options.rollback_backoff_max,
        }
    }

    fn publish(&self, inner: &Inner) {
        let snapshot = match &inner.pending {
            Some(pending) => StatusSnapshot {
                active: Arc::clone(&inner.active),
                live: Arc::clone(&pending.live),
                pending: Some(PendingView::new(&pending.change, pending.deadline)),
            },
            None => StatusSnapshot::idle(Arc::clone(&inner.active)),
        };
        self.status_tx.send_replace(snapshot);
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(log) = &self.options.audit {
            log.record(event).await;
        }
    }
}

fn spawn_countdown(
    session: Weak<ChangeSession>,
    id: Uuid,
    deadline: Instant,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(change_id = %id, "Countdown cancelled");
            }
            () = tokio::time::sleep_until(deadline) => {
                if let Some(session) = session.upgrade()
                    && let Err(e) = session.expire(id).await
                {
                    error!(change_id = %id, "Auto-revert failed: {e}");
                }
            }
        }
    });
}

/// Exponential delay between retries
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    async fn wait(&mut self) {
        tokio::time::sleep(self.next).await;
        self.next = self.next.saturating_mul(2).min(self.max);
    }
}
