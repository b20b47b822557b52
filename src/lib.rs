//! portfwd - declarative port forwarding on top of the kernel NAT table
//!
//! A small rule engine that turns forwarding rules (listen IP, source port or
//! range, destination IPv4 or domain, destination port or range, protocol) into
//! `iptables -t nat` DNAT entries, and keeps domain destinations current by
//! periodically re-resolving them.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, rule file store, port specs, name resolution,
//!   NAT compilation, reconciliation watcher and apply transactions
//! - [`audit`] - Audit logging for all privileged operations
//! - [`validators`] - Input validation for hosts, listen addresses and intervals
//! - [`config`] - Settings persistence
//! - [`elevation`] - Privilege escalation for `iptables` and `sysctl`
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Safety Features
//!
//! - Atomic rule file writes (temp file, fsync, rename)
//! - Exclusive advisory lock on the rule file for every load-mutate-save cycle
//! - Stage, apply, commit-or-restore transactions with checksummed backups
//! - NAT is only re-applied by the watcher when a resolved address changed

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::ports::PortSpec;
pub use core::rule::{Protocol, Rule};
pub use core::store::RuleStore;
