use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

/// Core error types for routerfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested configuration cannot be turned into a rule program
    #[error("Invalid configuration: {0}")]
    Compile(#[from] CompileError),

    /// The kernel refused the rule program
    #[error("Rule installation failed: {0}")]
    Apply(#[from] ApplyError),

    /// Another change is still awaiting confirmation
    #[error("Change {0} is already pending confirmation")]
    Conflict(Uuid),

    /// Confirm or revert was requested with nothing pending
    #[error("No pending changes to {0}")]
    NoPendingChange(&'static str),

    /// A persisted record could not be trusted
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable category, used by the HTTP layer and audit trail.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Compile(_) => "invalid_config",
            Self::Apply(e) => e.kind(),
            Self::Conflict(_) => "conflict",
            Self::NoPendingChange(_) => "no_pending_change",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }
}

/// Reasons a [`FirewallConfig`](crate::core::firewall::FirewallConfig) is rejected
/// before anything reaches the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{field} must be between 1 and 65535")]
    InvalidPort { field: &'static str },

    #[error("{field} {addr} is not usable: {reason}")]
    UnusableAddress {
        field: &'static str,
        addr: IpAddr,
        reason: &'static str,
    },

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("DMZ is enabled but no target address is set")]
    DmzWithoutTarget,

    #[error("External port {port} is already forwarded for {existing}")]
    OverlappingForward { port: u16, existing: String },

    #[error("A WAN interface is required for port forwards and DMZ")]
    MissingWanInterface,
}

/// Failures reported by a [`RuleApplier`](crate::core::applier::RuleApplier).
///
/// The variants follow how nft fails in practice so callers can tell a
/// misconfigured daemon (permissions, missing binary) from a bad rule program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("permission denied: {stderr}")]
    PermissionDenied { stderr: String },

    #[error("malformed rule program: {}", errors.join("; "))]
    Malformed { errors: Vec<String> },

    #[error("firewall subsystem busy: {stderr}")]
    Busy { stderr: String },

    #[error("nft unavailable: {0}")]
    Unavailable(String),

    #[error("nft failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        stderr: String,
        exit_code: Option<i32>,
    },
}

impl ApplyError {
    /// Classifies a failed nft invocation by its stderr.
    pub fn from_nft_output(stderr: &str, exit_code: Option<i32>) -> Self {
        let lower = stderr.to_lowercase();
        let stderr = stderr.trim().to_string();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("cache initialization failed")
            || lower.contains("a password is required")
        {
            Self::PermissionDenied { stderr }
        } else if lower.contains("resource busy") || lower.contains("device or resource busy") {
            Self::Busy { stderr }
        } else if lower.contains("syntax error")
            || lower.contains("could not process rule")
            || lower.contains("invalid")
        {
            Self::Malformed {
                errors: vec![stderr],
            }
        } else {
            Self::Failed { stderr, exit_code }
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Malformed { .. } => "malformed",
            Self::Busy { .. } => "busy",
            Self::Unavailable(_) => "unavailable",
            Self::Failed { .. } => "apply_failed",
        }
    }

    /// Operator-facing explanation with remediation hints.
    pub fn translation(&self) -> ErrorTranslation {
        match self {
            Self::PermissionDenied { .. } => translate_nft_error("permission denied"),
            Self::Malformed { errors } => translate_nft_error(&errors.join("\n")),
            Self::Busy { .. } => translate_nft_error("resource busy"),
            Self::Unavailable(msg) => ErrorTranslation::new(format!("nft unavailable: {msg}"))
                .with_suggestion("Install nftables and make sure `nft` is in PATH")
                .with_suggestion("Or set ROUTERFW_NFT_COMMAND to the nft binary"),
            Self::Failed { stderr, .. } => translate_nft_error(stderr),
        }
    }
}

/// State directory ownership and record integrity errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another routerfw process is the writer for this state directory
    #[error(
        "state directory {} is in use by another routerfw process (pid {})",
        .path.display(),
        .holder.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
    )]
    Locked {
        path: std::path::PathBuf,
        holder: Option<u32>,
    },

    #[error("{record} record corrupted: {reason}")]
    Corrupted { record: &'static str, reason: String },

    #[error("{record} record checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        record: &'static str,
        expected: String,
        actual: String,
    },

    #[error("{record} record format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch {
        record: &'static str,
        found: u32,
        expected: u32,
    },
}

/// Operator-facing explanation of a failure
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known nft failure signatures: any matching needle selects the message and
/// suggestions. Checked in order; the first hit wins.
const NFT_ERROR_PATTERNS: &[(&[&str], &str, &[&str])] = &[
    (
        &["permission denied", "operation not permitted", "cache initialization failed"],
        "Insufficient permissions to modify firewall rules",
        &[
            "Run routerfw as root or grant it CAP_NET_ADMIN",
            "When using sudo, allow passwordless `nft` for the service user",
            "Set ROUTERFW_ELEVATION_METHOD=none if already privileged",
        ],
    ),
    (
        &["no such file", "command not found"],
        "nftables is not installed or not found in PATH",
        &[
            "Install the nftables package for your distribution (opkg install nftables on OpenWrt)",
            "Or set ROUTERFW_NFT_COMMAND to the full path of nft",
        ],
    ),
    (
        &["could not process rule", "syntax error"],
        "The generated rule program was rejected",
        &[
            "Check that the configured WAN and LAN interfaces exist: ip link show",
            "Inspect the program with `routerfw rules`",
        ],
    ),
    (
        &["resource busy"],
        "Another program is changing the firewall right now",
        &[
            "Retry the change in a few seconds",
            "Make sure no other firewall manager (fw4, firewalld, ufw) owns the ruleset",
        ],
    ),
    (
        &["netlink"],
        "The kernel's nf_tables netlink interface did not respond",
        &["Check that the nf_tables module is loaded: lsmod | grep nf_tables"],
    ),
];

/// Turns raw nft output into an operator-facing message with remediation hints.
pub fn translate_nft_error(msg: &str) -> ErrorTranslation {
    let lower = msg.to_lowercase();

    NFT_ERROR_PATTERNS
        .iter()
        .find(|(needles, _, _)| needles.iter().any(|n| lower.contains(n)))
        .map_or_else(
            || {
                ErrorTranslation::new(format!("nft failed: {}", msg.trim()))
                    .with_suggestion("Run `nft list ruleset` to check nftables is usable")
            },
            |(_, message, suggestions)| {
                suggestions
                    .iter()
                    .fold(ErrorTranslation::new(*message), |t, s| t.with_suggestion(*s))
            },
        )
}

pub type Result<T> = std::result::Result<T, Error>;
