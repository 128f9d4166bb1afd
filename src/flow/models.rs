use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

use super::events::FlowEvent;

/// Reserved transport-only frame types. Clients drop these before any
/// application-level handling.
pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const CONNECTED_EVENT: &str = "connected";

const MAX_ID_LEN: usize = 128;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Check a flow/execution/run identifier.
pub fn validate_id(kind: &'static str, value: &str) -> Result<(), FlowError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.len() > MAX_ID_LEN {
        Some("must be at most 128 characters")
    } else if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        Some("may only contain letters, digits, '-', '_', '.' and ':'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(FlowError::InvalidId {
            kind,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether `next` keeps the pending → running → terminal ordering.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Success | Self::Failed)
                | (Self::Running, Self::Success | Self::Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    String,
}

/// Where the executed request/script/test came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSource {
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_name: Option<String>,
}

impl ExecutionSource {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::File,
            path: Some(path.into()),
            request_index: None,
            request_name: None,
        }
    }

    pub fn inline() -> Self {
        Self {
            kind: SourceKind::String,
            path: None,
            request_index: None,
            request_name: None,
        }
    }
}

impl Default for ExecutionSource {
    fn default() -> Self {
        Self::inline()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<f64>,
}

impl Timing {
    pub fn started_at(start_time: u64) -> Self {
        Self {
            start_time,
            ..Self::default()
        }
    }

    /// Close the timing window. `duration_ms` saturates at zero for clocks
    /// that went backwards.
    pub fn finish(&mut self, end_time: u64) {
        self.end_time = Some(end_time);
        self.duration_ms = Some(end_time.saturating_sub(self.start_time));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub encoding: BodyEncoding,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub body_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginHookInfo {
    pub plugin_name: String,
    pub hook: String,
    pub duration_ms: f64,
    pub modified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginReport {
    pub plugin_name: String,
    pub ts: u64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionError {
    pub stage: String,
    pub message: String,
}

/// One tracked attempt of a request, script or test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub req_exec_id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_label: Option<String>,
    #[serde(default)]
    pub source: ExecutionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_hooks: Vec<PluginHookInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_reports: Vec<PluginReport>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionRecord {
    pub fn pending(
        flow_id: impl Into<String>,
        req_exec_id: impl Into<String>,
        start_time: u64,
    ) -> Self {
        Self {
            req_exec_id: req_exec_id.into(),
            flow_id: flow_id.into(),
            session_id: None,
            req_label: None,
            source: ExecutionSource::default(),
            method: None,
            url_template: None,
            url_resolved: None,
            headers: None,
            body_preview: None,
            timing: Timing::started_at(start_time),
            response: None,
            plugin_hooks: Vec::new(),
            plugin_reports: Vec::new(),
            status: ExecutionStatus::Pending,
            error: None,
        }
    }

    /// Move to `next` if the transition is allowed. Returns whether it applied.
    pub fn advance(&mut self, next: ExecutionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Record the first failure. Later failures, and failures after success,
    /// leave the record untouched.
    pub fn fail(&mut self, stage: &str, message: &str, end_time: u64) -> bool {
        if self.error.is_some() || !self.advance(ExecutionStatus::Failed) {
            return false;
        }
        self.error = Some(ExecutionError {
            stage: stage.to_string(),
            message: message.to_string(),
        });
        self.timing.finish(end_time);
        true
    }

    pub fn complete(&mut self, end_time: u64, response: Option<ResponseSummary>) -> bool {
        if !self.advance(ExecutionStatus::Success) {
            return false;
        }
        self.timing.finish(end_time);
        if response.is_some() {
            self.response = response;
        }
        true
    }

    /// Persist the fields an emitted lifecycle event carries.
    pub fn apply_event(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::FetchStarted { url, method } => {
                self.url_resolved = Some(url.clone());
                if self.method.is_none() {
                    self.method = Some(method.clone());
                }
                self.advance(ExecutionStatus::Running);
            }
            FlowEvent::FetchFinished { ttfb, .. } => {
                if ttfb.is_some() {
                    self.timing.ttfb = *ttfb;
                }
            }
            FlowEvent::PluginHookFinished {
                name,
                hook,
                duration_ms,
                modified,
            } => self.plugin_hooks.push(PluginHookInfo {
                plugin_name: name.clone(),
                hook: hook.clone(),
                duration_ms: *duration_ms,
                modified: *modified,
            }),
            FlowEvent::PluginReport { name, data } => self.plugin_reports.push(PluginReport {
                plugin_name: name.clone(),
                ts: now_ms(),
                data: data.clone(),
            }),
            FlowEvent::ScriptStarted { .. } | FlowEvent::TestStarted { .. } => {
                self.advance(ExecutionStatus::Running);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl FlowSummary {
    /// Tally `executions`; `duration_ms` runs from `created_at` to the latest
    /// recorded end time, or 0 when nothing finished.
    pub fn compute<'a>(
        created_at: u64,
        executions: impl IntoIterator<Item = &'a ExecutionRecord>,
    ) -> Self {
        let mut summary = FlowSummary::default();
        let mut latest_end: Option<u64> = None;
        for record in executions {
            summary.total += 1;
            match record.status {
                ExecutionStatus::Success => summary.succeeded += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                _ => {}
            }
            if let Some(end) = record.timing.end_time {
                latest_end = Some(latest_end.map_or(end, |l| l.max(end)));
            }
        }
        summary.duration_ms = latest_end.map_or(0, |end| end.saturating_sub(created_at));
        summary
    }
}

/// Serializable copy of a flow, without its runtime subscriber set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<FlowSummary>,
    pub seq: u64,
    pub subscriber_count: usize,
    pub executions: Vec<ExecutionRecord>,
}

/// The wire unit of the event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: u64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_exec_id: Option<String>,
    pub seq: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// `heartbeat` and `connected` frames belong to the transport.
    pub fn is_transport_frame(&self) -> bool {
        is_transport_type(&self.event_type)
    }

    /// Whether this envelope ends the execution identified by `run_id`.
    pub fn is_terminal(&self) -> bool {
        FlowEvent::is_terminal_type(&self.event_type)
    }

    /// Rebuild the typed event. `None` for transport frames and types this
    /// build does not know.
    pub fn event(&self) -> Option<FlowEvent> {
        let mut body = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert(
            "type".to_string(),
            serde_json::Value::String(self.event_type.clone()),
        );
        serde_json::from_value(serde_json::Value::Object(body)).ok()
    }
}

pub fn is_transport_type(event_type: &str) -> bool {
    event_type == HEARTBEAT_EVENT || event_type == CONNECTED_EVENT
}
