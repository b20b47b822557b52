//! Reconciliation of domain destinations
//!
//! Each tick walks the rule list once. For every domain rule whose check
//! interval has elapsed the name is resolved again:
//!
//! | outcome   | effect |
//! |-----------|--------|
//! | changed   | new `resolved_ip`, `last_checked_at = now`, tick is dirty |
//! | unchanged | `last_checked_at = now` |
//! | failed    | rule untouched, retried next tick |
//!
//! The rule file is saved after every tick. NAT is re-applied only when the
//! tick is dirty, and then exactly once no matter how many rules changed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, address_changed_event};
use crate::core::error::Result;
use crate::core::nat::ApplyRules;
use crate::core::resolver::Resolve;
use crate::core::rule::Rule;
use crate::core::store::RuleStore;
use crate::utils::unix_now;

/// One resolved address that differs from the cached one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressChange {
    /// 1-based rule position
    pub index: usize,
    pub domain: String,
    pub old: String,
    pub new: String,
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Domain rules whose interval had elapsed
    pub due: usize,
    pub changed: Vec<AddressChange>,
    /// Due rules whose resolution failed
    pub failed: usize,
    /// Whether NAT was re-applied
    pub applied: bool,
}

impl TickReport {
    pub fn is_dirty(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Re-resolves every due domain rule in place. Never applies anything.
pub async fn reconcile(rules: &mut [Rule], resolver: &dyn Resolve, now: i64) -> TickReport {
    let mut report = TickReport::default();

    for (i, rule) in rules.iter_mut().enumerate() {
        if !rule.is_due(now) {
            continue;
        }
        report.due += 1;

        match resolver.resolve(&rule.dst_host).await {
            Ok(addr) => {
                let old = rule.resolved_ip.clone();
                if rule.record_resolution(addr, now) {
                    info!("{} moved from {} to {}", rule.dst_host, old, addr);
                    report.changed.push(AddressChange {
                        index: i + 1,
                        domain: rule.dst_host.clone(),
                        old,
                        new: rule.resolved_ip.clone(),
                    });
                } else {
                    debug!("{} still resolves to {}", rule.dst_host, addr);
                }
            }
            Err(e) => {
                warn!(
                    "Re-resolving {} failed, keeping {}: {}",
                    rule.dst_host, rule.resolved_ip, e
                );
                report.failed += 1;
            }
        }
    }

    report
}

/// Periodic re-resolution plus conditional apply
pub struct Watcher {
    resolver: Arc<dyn Resolve>,
    applier: Arc<dyn ApplyRules>,
    audit: Option<AuditLog>,
}

impl Watcher {
    pub fn new(resolver: Arc<dyn Resolve>, applier: Arc<dyn ApplyRules>) -> Self {
        Self {
            resolver,
            applier,
            audit: None,
        }
    }

    /// Record address changes in an audit log.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Runs one tick against an open store.
    ///
    /// # Errors
    ///
    /// Returns `Err` if saving fails or the apply fails. After a failed apply
    /// the pre-tick rules are written back, so the same changes are detected
    /// and applied again on the next tick.
    pub async fn run_once(&self, store: &mut RuleStore, now: i64) -> Result<TickReport> {
        let before = store.rules().to_vec();
        let mut rules = before.clone();

        let mut report = reconcile(&mut rules, self.resolver.as_ref(), now).await;
        store.replace_all(rules).await?;

        if report.is_dirty() {
            info!(
                "{} address change(s), re-applying NAT rules",
                report.changed.len()
            );

            if let Err(e) = self.applier.apply(store.rules()).await {
                error!("Re-apply after address change failed: {}", e);
                if let Err(restore) = store.replace_all(before).await {
                    error!("Could not restore pre-tick rules: {}", restore);
                }
                return Err(e);
            }
            report.applied = true;

            if let Some(audit) = &self.audit {
                for change in &report.changed {
                    audit
                        .record(address_changed_event(&change.domain, &change.old, &change.new))
                        .await;
                }
            }
        }

        Ok(report)
    }

    /// Opens the store at `path` and runs one tick, releasing the lock after.
    ///
    /// Never-resolved domain rules are resolved by the tick itself, so a first
    /// successful answer counts as a change and gets applied.
    pub async fn tick(&self, path: &Path) -> Result<TickReport> {
        let (mut store, _) = RuleStore::open_unresolved(path).await?;
        self.run_once(&mut store, unix_now()).await
    }

    /// Ticks every `interval` until the task is dropped. Failed ticks are
    /// logged and the loop continues.
    pub async fn run_forever(&self, path: &Path, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Watching {} every {}s",
            path.display(),
            interval.as_secs()
        );

        loop {
            ticker.tick().await;
            match self.tick(path).await {
                Ok(report) => debug!(
                    "Tick: {} due, {} changed, {} failed, applied: {}",
                    report.due,
                    report.changed.len(),
                    report.failed,
                    report.applied
                ),
                Err(e) => error!("Watcher tick failed: {}", e),
            }
        }
    }
}
