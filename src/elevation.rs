//! Privileged `nft` invocation
//!
//! routerfw normally runs as root under its service manager, in which case
//! `nft` is executed directly. When it runs unprivileged it elevates only the
//! `nft` binary, non-interactively, since a daemon has no terminal to prompt on.
//!
//! # Elevation Strategy
//!
//! 1. **Command override**: `ROUTERFW_NFT_COMMAND` (or `nft_command` in the
//!    config file) replaces `nft` entirely and is run as-is. Used for wrappers
//!    and test doubles.
//! 2. **Root**: `nft` directly.
//! 3. **Explicit method**: `ROUTERFW_ELEVATION_METHOD` / `elevation_method`
//!    (`sudo`, `run0`, `none`).
//! 4. **Automatic**: `sudo -n` when available, otherwise `run0`.
//!
//! # Security
//!
//! - Only `nft` can be elevated
//! - Arguments are passed without shell interpolation
//! - `sudo` runs with `-n` so a missing NOPASSWD rule fails fast instead of hanging

use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `ROUTERFW_ELEVATION_METHOD`
    #[error("Invalid ROUTERFW_ELEVATION_METHOD '{0}'. Valid options: auto, sudo, run0, none")]
    InvalidMethod(String),

    /// Empty `ROUTERFW_NFT_COMMAND`
    #[error("nft command override is empty")]
    EmptyOverride,
}

/// How to gain privileges for `nft` when not running as root
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
pub enum ElevationMethod {
    #[default]
    Auto,
    Sudo,
    Run0,
    /// Run `nft` directly (capabilities granted some other way)
    None,
}

impl ElevationMethod {
    /// Parses a method name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`ElevationError::InvalidMethod`] for unknown names.
    pub fn parse(value: &str) -> Result<Self, ElevationError> {
        value
            .trim()
            .parse()
            .map_err(|_| ElevationError::InvalidMethod(value.to_string()))
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn via(elevator: &str, elevator_args: &[&str], program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.args(elevator_args).arg(program).args(args);
    cmd
}

/// Creates an `nft` command with the specified arguments, elevated if needed.
///
/// # Errors
///
/// Returns `Err` if the override is empty or the elevation method's binary is missing.
///
/// # Example
///
/// ```no_run
/// use routerfw::elevation::{ElevationMethod, create_elevated_nft_command};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_nft_command(None, ElevationMethod::Auto, &["list", "ruleset"])?;
/// let output = cmd.output().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_elevated_nft_command(
    override_cmd: Option<&[String]>,
    method: ElevationMethod,
    args: &[&str],
) -> Result<Command, ElevationError> {
    // 1. Command override (highest priority)
    if let Some(override_cmd) = override_cmd {
        let (program, leading) = override_cmd
            .split_first()
            .ok_or(ElevationError::EmptyOverride)?;
        let mut cmd = Command::new(program);
        cmd.args(leading).args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution
    if nix::unistd::getuid().is_root() {
        return Ok(direct("nft", args));
    }

    // 3. Explicit method, 4. automatic detection
    match method {
        ElevationMethod::None => Ok(direct("nft", args)),
        ElevationMethod::Sudo => {
            if !binary_exists("sudo") {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            Ok(via("sudo", &["-n"], "nft", args))
        }
        ElevationMethod::Run0 => {
            if !binary_exists("run0") {
                return Err(ElevationError::MethodNotAvailable("run0".into()));
            }
            Ok(via("run0", &[], "nft", args))
        }
        ElevationMethod::Auto => {
            if binary_exists("sudo") {
                Ok(via("sudo", &["-n"], "nft", args))
            } else if binary_exists("run0") {
                Ok(via("run0", &[], "nft", args))
            } else {
                Err(ElevationError::MethodNotAvailable("sudo or run0".into()))
            }
        }
    }
}
