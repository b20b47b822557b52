//! Shared test utilities for core module tests
//!
//! Mocks for the resolver and NAT seams plus rule builders. Only compiled in
//! test mode.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;

use crate::core::error::{Error, Result};
use crate::core::nat::{ApplyRules, ApplySummary, NatBackend, NatOp};
use crate::core::resolver::{Resolve, ResolveError};
use crate::core::rule::{Protocol, Rule};

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PORTFWD_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PORTFWD_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static TEST_ENV_INIT: Once = Once::new();

/// Makes elevated commands run directly.
///
/// Safe to call from every test; the variable is set once.
pub fn setup_test_env() {
    TEST_ENV_INIT.call_once(|| {
        // SAFETY: runs once, only in test code
        unsafe {
            std::env::set_var("PORTFWD_TEST_NO_ELEVATION", "1");
        }
    });
}

/// Resolver with canned answers that counts calls
pub struct MockResolver {
    label: String,
    answers: HashMap<String, Ipv4Addr>,
    default: Option<Ipv4Addr>,
    pub calls: Arc<AtomicUsize>,
}

impl MockResolver {
    /// Fails every lookup until answers are added.
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            answers: HashMap::new(),
            default: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_answer(mut self, domain: &str, addr: Ipv4Addr) -> Self {
        self.answers.insert(domain.to_string(), addr);
        self
    }

    /// Answer for any domain without a specific entry.
    pub fn with_default(mut self, addr: Ipv4Addr) -> Self {
        self.default = Some(addr);
        self
    }
}

#[async_trait]
impl Resolve for MockResolver {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn resolve(&self, domain: &str) -> std::result::Result<Ipv4Addr, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .get(domain)
            .copied()
            .or(self.default)
            .ok_or_else(|| ResolveError::NoAnswer {
                server: self.label.clone(),
                domain: domain.to_string(),
            })
    }
}

pub fn failing(label: &str) -> MockResolver {
    MockResolver::new(label)
}

pub fn fixed(label: &str, addr: Ipv4Addr) -> MockResolver {
    MockResolver::new(label).with_default(addr)
}

/// NAT backend that records operations, optionally failing at one of them
pub struct RecordingBackend {
    pub ops: Arc<Mutex<Vec<NatOp>>>,
    fail_at: Option<usize>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            fail_at: None,
        }
    }

    /// Fails on the operation with this 0-based position (after recording it).
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::new()
        }
    }
}

#[async_trait]
impl NatBackend for RecordingBackend {
    async fn execute(&self, op: &NatOp) -> Result<()> {
        let position = {
            let mut ops = self.ops.lock().unwrap();
            ops.push(op.clone());
            ops.len() - 1
        };

        if self.fail_at == Some(position) {
            return Err(Error::Nat {
                message: format!("iptables {op} failed"),
                stderr: Some("iptables: Bad argument `DNAT'".to_string()),
                exit_code: Some(2),
            });
        }
        Ok(())
    }
}

/// Applier that counts calls and remembers what it was given
pub struct CountingApplier {
    pub calls: Arc<AtomicUsize>,
    applied: Mutex<Vec<Vec<Rule>>>,
    fail_first: usize,
}

impl CountingApplier {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    /// Fails the first `n` calls.
    pub fn failing_first(n: usize) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            applied: Mutex::new(Vec::new()),
            fail_first: n,
        }
    }

    pub fn last_applied(&self) -> Vec<Rule> {
        self.applied
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApplyRules for CountingApplier {
    async fn apply(&self, rules: &[Rule]) -> Result<ApplySummary> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(Error::Nat {
                message: "simulated apply failure".to_string(),
                stderr: Some("iptables: Resource temporarily unavailable".to_string()),
                exit_code: Some(4),
            });
        }

        self.applied.lock().unwrap().push(rules.to_vec());
        let skipped = rules.iter().filter(|r| r.resolved_addr().is_none()).count();
        Ok(ApplySummary {
            rules_compiled: rules.len() - skipped,
            rules_skipped: skipped,
            operations: 0,
        })
    }
}

/// Wildcard-listen rule to an IPv4 destination, both protocols.
pub fn ip_rule(src: &str, dst_host: &str, dst: &str) -> Rule {
    Rule::new("0.0.0.0", src, dst_host, dst, Protocol::Both).unwrap()
}

/// Wildcard-listen TCP rule to a domain, never resolved, 60s interval.
pub fn domain_rule(src: &str, domain: &str, dst: &str) -> Rule {
    Rule::new("0.0.0.0", src, domain, dst, Protocol::Tcp)
        .unwrap()
        .with_check_interval(60)
        .unwrap()
}
