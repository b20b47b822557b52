//! Core port forwarding functionality
//!
//! This module contains the core types and logic for managing forwarding rules
//! and compiling them into kernel NAT entries. It provides:
//!
//! - [`ports`]: Port spec parsing and source/destination arity checks
//! - [`rule`]: The canonical forwarding rule
//! - [`schema`]: Rule file line formats (three generations) and the canonical encoder
//! - [`store`]: Locked, atomically-written rule file
//! - [`resolver`]: Direct DNS and DNS-over-HTTPS name resolution
//! - [`nat`]: NAT table compilation and application
//! - [`transaction`]: Stage, apply, commit-or-restore around rule changes
//! - [`watcher`]: Periodic re-resolution of domain destinations
//! - [`error`]: Error types for forwarding operations

pub mod error;
pub mod nat;
pub mod ports;
pub mod resolver;
pub mod rule;
pub mod schema;
pub mod store;
pub mod transaction;
pub mod watcher;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
