//! routerfw - commit-confirm engine for router firewall changes
//!
//! Applies firewall enable/disable, port forwards, blocked IPs and a DMZ target
//! to a live nftables table, with a 120-second safety net that rolls the change
//! back unless an operator confirms it.
//!
//! # Architecture
//!
//! - [`core`] - Rule compilation, durable state, atomic application, and the
//!   staged/confirmed/reverted change session
//! - [`command`] - Configuration-mutating requests as values
//! - [`api`] - HTTP management surface consumed by the dashboard
//! - [`audit`] - Audit trail of every transition
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Daemon configuration
//! - [`elevation`] - Privileged `nft` invocation
//! - [`utils`] - Directory handling and atomic file writes
//!
//! # Safety Features
//!
//! - Whole-table replacement in a single nft transaction
//! - Pre-apply verification with `nft --check`
//! - 120-second dead-man switch for auto-rollback
//! - Pending records persisted before rules go live, reverted on restart
//! - SHA-256 checksums on every persisted record
//! - Rollback retried until it succeeds

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{FirewallConfig, NetworkLayout, PendingChange};
pub use core::ruleset::RuleSet;
pub use core::session::ChangeSession;
