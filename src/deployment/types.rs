//! Deployment data model and wire payloads.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::{id_string, opt_id_string};

/// Log line severity. Unknown severities decode as [`Severity::Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Error output.
    Error,
    /// A step succeeded.
    Success,
    /// Warning output.
    Warning,
    /// Informational output.
    #[default]
    #[serde(other)]
    Info,
}

/// Deployment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Queued.
    Pending,
    /// Fetching sources.
    Cloning,
    /// Installing dependencies.
    Installing,
    /// Building.
    Building,
    /// Starting the new release.
    Starting,
    /// Switching traffic.
    Deploying,
    /// Live.
    Running,
    /// Stopped by a user.
    Stopped,
    /// Failed.
    Failed,
}

impl DeploymentStatus {
    /// `running`, `failed` and `stopped` end a deployment.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Installing => "installing",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Line text.
    pub text: String,
    /// Severity.
    #[serde(default)]
    pub severity: Severity,
    /// ISO-8601 timestamp as sent by the server.
    pub timestamp: String,
    /// Id of the stream that produced the line, when the server says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_owner_id: Option<String>,
}

impl LogEntry {
    /// Create an entry.
    pub fn new(text: impl Into<String>, severity: Severity, timestamp: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity,
            timestamp: timestamp.into(),
            stream_owner_id: None,
        }
    }

    /// Identity used for deduplication: `"timestamp|text"`.
    ///
    /// The raw timestamp string is used so both channels agree byte for byte.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}", self.timestamp, self.text)
    }

    /// Parsed timestamp, if it is valid RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp).ok()
    }
}

/// `deployment:log` payload on the shared connection.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketLog {
    /// Target deployment; absent on legacy payloads.
    #[serde(default, rename = "deploymentId", deserialize_with = "opt_id_string")]
    pub deployment_id: Option<String>,
    /// The line.
    #[serde(flatten)]
    pub entry: LogEntry,
}

/// Status payload, shared by `deployment:status` and the push stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdate {
    /// Target deployment; absent on legacy payloads.
    #[serde(default, rename = "deploymentId", deserialize_with = "opt_id_string")]
    pub deployment_id: Option<String>,
    /// New status.
    pub status: DeploymentStatus,
}

/// Authoritative deployment record from the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Deployment id.
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// Git commit, if known.
    #[serde(default)]
    pub commit_sha: Option<String>,
    /// Branch, if known.
    #[serde(default)]
    pub branch: Option<String>,
    /// When the deployment was queued.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Which channel delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The server-sent-events push stream.
    PushStream,
    /// The shared realtime connection.
    Socket,
    /// The periodic reconciliation pass.
    Reconcile,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_severity_is_info() {
        let entry: LogEntry = serde_json::from_value(json!({
            "text": "x", "severity": "debug", "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(entry.severity, Severity::Info);

        let missing: LogEntry =
            serde_json::from_value(json!({ "text": "x", "timestamp": "t" })).unwrap();
        assert_eq!(missing.severity, Severity::Info);
    }

    #[test]
    fn test_dedup_key_uses_raw_timestamp() {
        let entry = LogEntry::new("Building", Severity::Info, "2024-05-01T10:00:00.120Z");
        assert_eq!(entry.dedup_key(), "2024-05-01T10:00:00.120Z|Building");
        assert!(entry.parsed_timestamp().is_some());
        assert!(LogEntry::new("x", Severity::Info, "yesterday").parsed_timestamp().is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        use DeploymentStatus::*;
        let terminal: Vec<_> = [Pending, Cloning, Installing, Building, Starting, Deploying, Running, Stopped, Failed]
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![Running, Stopped, Failed]);
    }

    #[test]
    fn test_socket_log_with_numeric_deployment_id() {
        let log: SocketLog = serde_json::from_value(json!({
            "deploymentId": 12,
            "text": "done",
            "severity": "success",
            "timestamp": "2024-01-01T00:00:01Z"
        }))
        .unwrap();
        assert_eq!(log.deployment_id.as_deref(), Some("12"));
        assert_eq!(log.entry.severity, Severity::Success);
    }

    #[test]
    fn test_deployment_record() {
        let record: DeploymentRecord = serde_json::from_value(json!({
            "id": 3,
            "status": "failed",
            "commitSha": "abc123",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(record.id, "3");
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert!(record.finished_at.is_none());
    }
}
