/// Audit logging for privileged operations
///
/// One JSON-lines record per applied intent: what was asked for, how many
/// directives ran, how many failed and the fingerprint of the RuleSet, keyed
/// by the execution id that also appears in the tracing log.
use crate::core::executor::ExecutionReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Boot,
    Deactivate,
    ReleaseIpv6,
    AppRule,
    Service,
    CaptivePortal,
    Tether,
    Lan,
    Probe,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Execution the event describes, absent for non-executing events
    #[serde(default)]
    pub execution_id: Option<Uuid>,

    /// Whether every non-removal directive took effect
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
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
            execution_id: None,
            success,
            details,
            error,
        }
    }

    /// Event summarizing an apply; `details` is merged with the report counters
    pub fn from_report(
        event_type: EventType,
        report: &ExecutionReport,
        details: serde_json::Value,
    ) -> Self {
        let mut merged = serde_json::json!({
            "attempted": report.attempted(),
            "succeeded": report.succeeded(),
            "hard_failures": report.hard_failures(),
            "soft_failures": report.soft_failures(),
            "fingerprint": report.fingerprint,
            "duration_ms": (report.finished_at - report.started_at).num_milliseconds(),
        });
        if let (Some(target), serde_json::Value::Object(extra)) = (merged.as_object_mut(), details)
        {
            target.extend(extra);
        }

        let failures = report.failure_summary();
        let error = (!report.is_success()).then(|| failures.join("; "));

        Self {
            timestamp: report.finished_at,
            event_type,
            execution_id: Some(report.id),
            success: report.is_success(),
            details: merged,
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
    /// Audit log at `<state dir>/audit.log`
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        if let Some(parent) = self.log_path.parent() {
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

    /// Logs `event`, downgrading write failures to a warning
    pub async fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
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

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}
