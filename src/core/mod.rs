//! Core commit/rollback engine
//!
//! This module contains the types and logic for staging firewall changes with
//! an automatic rollback safety net. It provides:
//!
//! - [`firewall`]: Declarative configuration (policy, forwards, blocklist, DMZ)
//! - [`ruleset`]: The compiled rule program and its nftables renderings
//! - [`compiler`]: Pure, deterministic configuration → rule program compilation
//! - [`store`]: Durable active/pending records that survive restarts
//! - [`applier`]: Atomic installation of a rule program into the kernel
//! - [`verify`]: `nft --check` pre-flight validation
//! - [`session`]: The staged → confirmed/reverted state machine and countdown
//! - [`status`]: Read-only, lock-free status projection for polling clients
//! - [`error`]: Error types for all of the above

pub mod applier;
pub mod compiler;
pub mod error;
pub mod firewall;
pub mod ruleset;
pub mod session;
pub mod status;
pub mod store;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
