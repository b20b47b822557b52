/// Audit logging for privileged and rule-changing operations
///
/// Every NAT apply, rollback, rule file mutation and watcher address change is
/// appended to `audit.log` in the state directory as one JSON object per line.
/// Audit failures are logged and never fail the operation itself.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyRules,
    RollbackRules,
    AddRule,
    EditRule,
    RemoveRule,
    ClearRules,
    AddressChanged,
    RecoverBackup,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        if let Some(parent) = self.log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Appends an event, downgrading failures to a warning.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events, newest first.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn record_default(event: AuditEvent) {
    if let Ok(audit) = AuditLog::new() {
        audit.record(event).await;
    }
}

/// Logs an apply
pub async fn log_apply(
    rule_count: usize,
    skipped_count: usize,
    operations: usize,
    success: bool,
    error: Option<String>,
) {
    record_default(AuditEvent::new(
        EventType::ApplyRules,
        success,
        serde_json::json!({
            "rule_count": rule_count,
            "skipped_count": skipped_count,
            "operations": operations,
        }),
        error,
    ))
    .await;
}

/// Logs a restore of the previous rules after a failed apply
pub async fn log_rollback(success: bool, error: Option<String>) {
    record_default(AuditEvent::new(
        EventType::RollbackRules,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}

/// Logs an add, edit, remove or clear
pub async fn log_rule_change(event_type: EventType, details: serde_json::Value) {
    record_default(AuditEvent::new(event_type, true, details, None)).await;
}

/// Builds the event for a watcher address change
pub fn address_changed_event(domain: &str, old: &str, new: &str) -> AuditEvent {
    AuditEvent::new(
        EventType::AddressChanged,
        true,
        serde_json::json!({
            "domain": domain,
            "old": old,
            "new": new,
        }),
        None,
    )
}
