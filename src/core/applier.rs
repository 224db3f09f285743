//! Atomic installation of a rule program into the kernel
//!
//! [`RuleApplier`] is the seam between the change session and the packet
//! filter. [`NftApplier`] is the production implementation: it pipes the JSON
//! batch from [`RuleSet::to_nftables_json`] into `nft --json -f -`, which the
//! kernel commits as a single transaction. Either the whole table is replaced
//! or nothing changes.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::core::error::ApplyError;
use crate::core::ruleset::RuleSet;
use crate::core::verify::{CheckOutcome, verify_ruleset};
use crate::elevation::{ElevationMethod, create_elevated_nft_command};

/// Installs rule programs. Implementations must be all-or-nothing.
#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Replaces the live table with `rules`.
    async fn apply(&self, rules: &RuleSet) -> Result<(), ApplyError>;

    /// Reinstalls a previously working program while rolling back.
    ///
    /// Defaults to [`apply`](Self::apply); implementations may skip
    /// pre-flight steps here since the program was already accepted once.
    async fn apply_emergency_rollback(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        self.apply(rules).await
    }
}

/// How [`NftApplier`] locates and runs `nft`
#[derive(Debug, Clone, Default)]
pub struct NftOptions {
    /// Replaces `nft` (program plus leading arguments), run without elevation
    pub command_override: Option<Vec<String>>,
    pub elevation: ElevationMethod,
    /// Run `nft --check` before every apply
    pub verify_first: bool,
}

/// Applies rule programs with the `nft` binary
#[derive(Debug, Clone)]
pub struct NftApplier {
    options: NftOptions,
}

impl NftApplier {
    pub fn new(options: NftOptions) -> Self {
        Self { options }
    }

    pub(crate) fn command(&self, args: &[&str]) -> Result<Command, ApplyError> {
        create_elevated_nft_command(
            self.options.command_override.as_deref(),
            self.options.elevation,
            args,
        )
        .map_err(|e| ApplyError::Unavailable(e.to_string()))
    }

    async fn install(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        let payload = rules.to_nftables_json().to_string();
        let output = run_nft(self.command(&["--json", "-f", "-"])?, &payload).await?;

        if output.status.success() {
            info!(
                table = %rules.table,
                rules = rules.rules.len(),
                "Rule program installed"
            );
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("nft apply failed: {}", stderr.trim());
            Err(ApplyError::from_nft_output(&stderr, output.status.code()))
        }
    }
}

#[async_trait]
impl RuleApplier for NftApplier {
    async fn apply(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        if self.options.verify_first {
            let check = self.command(&["--json", "--check", "-f", "-"])?;
            if let CheckOutcome::Rejected(errors) =
                verify_ruleset(check, &rules.to_nftables_json()).await?
            {
                return Err(ApplyError::Malformed { errors });
            }
        }
        self.install(rules).await
    }

    async fn apply_emergency_rollback(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        warn!(table = %rules.table, "Reinstalling previous rule program");
        self.install(rules).await
    }
}

/// Spawns `cmd`, feeds `payload` on stdin and collects its output.
pub(crate) async fn run_nft(mut cmd: Command, payload: &str) -> Result<Output, ApplyError> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn nft: {e}");
            ApplyError::Unavailable(format!("failed to spawn nft: {e}"))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| ApplyError::Unavailable(format!("failed to write to nft stdin: {e}")))?;
        // dropping stdin closes the pipe so nft sees EOF
    }

    child
        .wait_with_output()
        .await
        .map_err(|e| ApplyError::Unavailable(format!("failed to wait for nft: {e}")))
}
