//! Lifecycle events flowing from execution engines into flows.
//!
//! Engines (fetch, script, test runners) produce the low-level variants; the
//! tracker and manager add `requestQueued`, `executionSucceeded`,
//! `executionFailed` and `flowFinished`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::FlowSummary;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum FlowEvent {
    CompileStarted,
    FetchStarted {
        url: String,
        method: String,
    },
    FetchFinished {
        #[serde(default)]
        ttfb: Option<f64>,
        status: u16,
    },
    PluginHookFinished {
        name: String,
        hook: String,
        duration_ms: f64,
        modified: bool,
    },
    PluginReport {
        name: String,
        data: Value,
    },
    Error {
        stage: String,
        message: String,
    },
    ScriptStarted {
        file_path: String,
        runner: String,
    },
    ScriptOutput {
        stream: OutputStream,
        data: String,
    },
    ScriptFinished {
        exit_code: Option<i32>,
    },
    TestStarted {
        file_path: String,
        framework: String,
    },
    TestOutput {
        stream: OutputStream,
        data: String,
    },
    TestFinished {
        exit_code: Option<i32>,
    },
    RequestQueued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url_template: Option<String>,
    },
    ExecutionSucceeded {
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    ExecutionFailed {
        stage: String,
        message: String,
    },
    FlowFinished {
        summary: FlowSummary,
    },
}

pub const EXECUTION_SUCCEEDED: &str = "executionSucceeded";
pub const EXECUTION_FAILED: &str = "executionFailed";

impl FlowEvent {
    /// The `type` tag this event carries on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CompileStarted => "compileStarted",
            Self::FetchStarted { .. } => "fetchStarted",
            Self::FetchFinished { .. } => "fetchFinished",
            Self::PluginHookFinished { .. } => "pluginHookFinished",
            Self::PluginReport { .. } => "pluginReport",
            Self::Error { .. } => "error",
            Self::ScriptStarted { .. } => "scriptStarted",
            Self::ScriptOutput { .. } => "scriptOutput",
            Self::ScriptFinished { .. } => "scriptFinished",
            Self::TestStarted { .. } => "testStarted",
            Self::TestOutput { .. } => "testOutput",
            Self::TestFinished { .. } => "testFinished",
            Self::RequestQueued { .. } => "requestQueued",
            Self::ExecutionSucceeded { .. } => EXECUTION_SUCCEEDED,
            Self::ExecutionFailed { .. } => EXECUTION_FAILED,
            Self::FlowFinished { .. } => "flowFinished",
        }
    }

    /// The event body without its `type` tag, as carried in an envelope's
    /// `payload`.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("type");
                Value::Object(map)
            }
            _ => Value::Object(Default::default()),
        }
    }

    pub fn is_terminal_type(event_type: &str) -> bool {
        event_type == EXECUTION_SUCCEEDED || event_type == EXECUTION_FAILED
    }
}
