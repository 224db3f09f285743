//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::applier::RuleApplier;
use crate::core::compiler::compile;
use crate::core::error::ApplyError;
use crate::core::firewall::{
    ConfigSnapshot, FirewallConfig, ForwardProtocol, NetworkLayout, PendingChange, PortForward,
};
use crate::core::ruleset::RuleSet;
use crate::core::session::{ChangeSession, SessionOptions};
use crate::core::store::RuleStore;

/// Layout used across tests: WAN `eth0`, LAN `br-lan` with 192.168.1.0/24
pub fn test_layout() -> NetworkLayout {
    NetworkLayout {
        table: "routerfw".to_string(),
        wan_interface: "eth0".to_string(),
        lan_interfaces: vec!["br-lan".to_string()],
        lan_subnets: vec!["192.168.1.0/24".parse().unwrap()],
    }
}

/// A forward to 192.168.1.10 with no description
pub fn forward(protocol: ForwardProtocol, external_port: u16, internal_port: u16) -> PortForward {
    PortForward {
        protocol,
        external_port,
        internal_ip: Ipv4Addr::new(192, 168, 1, 10),
        internal_port,
        description: String::new(),
    }
}

/// Compiles `config` against [`test_layout`]
pub fn snapshot_of(config: &FirewallConfig) -> ConfigSnapshot {
    ConfigSnapshot {
        config: config.clone(),
        rules: compile(config, &test_layout()).unwrap(),
    }
}

#[derive(Debug, Default)]
struct Recorder {
    applied: Vec<RuleSet>,
    rollbacks: Vec<RuleSet>,
    /// Both paths, in call order
    installs: Vec<RuleSet>,
    fail_applies: usize,
    fail_rollbacks: usize,
}

/// In-memory applier that records what it was asked to install.
///
/// Failures are injected per call: `fail_next_applies(2)` makes the next two
/// `apply` calls fail, after which applies succeed again.
#[derive(Debug, Clone, Default)]
pub struct RecordingApplier {
    inner: Arc<Mutex<Recorder>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_applies(&self, count: usize) {
        self.inner.lock().unwrap().fail_applies = count;
    }

    pub fn fail_next_rollbacks(&self, count: usize) {
        self.inner.lock().unwrap().fail_rollbacks = count;
    }

    /// Every rule program successfully installed through `apply`
    pub fn applied(&self) -> Vec<RuleSet> {
        self.inner.lock().unwrap().applied.clone()
    }

    /// Every rule program successfully installed through the rollback path
    pub fn rollbacks(&self) -> Vec<RuleSet> {
        self.inner.lock().unwrap().rollbacks.clone()
    }

    /// The last program installed by either path
    pub fn live(&self) -> Option<RuleSet> {
        self.inner.lock().unwrap().installs.last().cloned()
    }
}

#[async_trait]
impl RuleApplier for RecordingApplier {
    async fn apply(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        let mut recorder = self.inner.lock().unwrap();
        if recorder.fail_applies > 0 {
            recorder.fail_applies -= 1;
            return Err(ApplyError::Busy {
                stderr: "Error: Could not process rule: Device or resource busy".to_string(),
            });
        }
        recorder.applied.push(rules.clone());
        recorder.installs.push(rules.clone());
        Ok(())
    }

    async fn apply_emergency_rollback(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        let mut recorder = self.inner.lock().unwrap();
        if recorder.fail_rollbacks > 0 {
            recorder.fail_rollbacks -= 1;
            return Err(ApplyError::Unavailable("nft went away".to_string()));
        }
        recorder.rollbacks.push(rules.clone());
        recorder.installs.push(rules.clone());
        Ok(())
    }
}

/// Options for session tests: no startup apply, fast backoff, no audit log
pub fn quiet_options() -> SessionOptions {
    SessionOptions {
        apply_on_startup: false,
        rollback_backoff: Duration::from_millis(10),
        rollback_backoff_max: Duration::from_millis(40),
        ..SessionOptions::default()
    }
}

/// Applier whose `apply` records the pending record on disk at the moment
/// new rules are installed
#[derive(Debug)]
pub struct StoreWatchingApplier {
    store: RuleStore,
    seen: Mutex<Vec<Option<PendingChange>>>,
}

impl StoreWatchingApplier {
    pub fn new(dir: &Path) -> Self {
        Self {
            store: RuleStore::open(dir).unwrap(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Option<PendingChange>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleApplier for StoreWatchingApplier {
    async fn apply(&self, _rules: &RuleSet) -> Result<(), ApplyError> {
        let record = self.store.load_pending().unwrap();
        self.seen.lock().unwrap().push(record);
        Ok(())
    }
}

/// Starts a session over a fresh state directory
pub async fn start_session(
    applier: &RecordingApplier,
    options: SessionOptions,
) -> (tempfile::TempDir, Arc<ChangeSession>) {
    let dir = tempfile::tempdir().unwrap();
    let store = RuleStore::open(dir.path().join("state")).unwrap();
    let session = ChangeSession::start(test_layout(), store, Arc::new(applier.clone()), options)
        .await
        .unwrap();
    (dir, session)
}
