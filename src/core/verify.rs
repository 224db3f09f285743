//! Pre-flight validation of rule programs
//!
//! Runs the JSON batch through `nft --check`, which parses and evaluates it
//! against the kernel without committing anything.

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::applier::run_nft;
use crate::core::error::ApplyError;

/// What `nft --check` thought of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Accepted,
    /// nft refused the batch; one message per reported problem
    Rejected(Vec<String>),
}

/// Checks a batch with an already-built `nft --json --check -f -` command.
///
/// A batch nft refuses is a [`CheckOutcome::Rejected`]; only problems running
/// nft at all (or lacking permission to) are errors.
///
/// # Errors
///
/// Returns `Err` if nft cannot be executed or refuses for lack of privileges.
pub async fn verify_ruleset(check: Command, payload: &Value) -> Result<CheckOutcome, ApplyError> {
    debug!("Checking rule program with nft --check");

    let output = run_nft(check, &payload.to_string()).await?;
    if output.status.success() {
        return Ok(CheckOutcome::Accepted);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!("nft --check rejected the rule program: {}", stderr.trim());

    match ApplyError::from_nft_output(&stderr, output.status.code()) {
        ApplyError::Malformed { .. } | ApplyError::Failed { .. } => {
            Ok(CheckOutcome::Rejected(rejection_messages(&stderr)))
        }
        other => Err(other),
    }
}

/// Splits nft's stderr into messages.
///
/// `nft --json` reports `{"errors": [{"message": ...}]}` on some versions and
/// plain `Error: ...` lines on others.
fn rejection_messages(stderr: &str) -> Vec<String> {
    if let Ok(Value::Object(report)) = serde_json::from_str::<Value>(stderr)
        && let Some(Value::Array(errors)) = report.get("errors")
    {
        return errors
            .iter()
            .filter_map(|entry| entry["message"].as_str())
            .map(str::to_string)
            .collect();
    }

    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            ["Error: ", "nft: "]
                .iter()
                .fold(line, |rest, prefix| rest.strip_prefix(prefix).unwrap_or(rest))
                .to_string()
        })
        .collect()
}
