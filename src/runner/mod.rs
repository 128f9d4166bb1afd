//! Execution backends: the seam between the flow core and whatever actually
//! runs a script, a test file or an HTTP request.

pub mod detect;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;
use crate::flow::FlowTracker;

pub use detect::{RunnerDetector, RunnerSpec};
pub use process::ProcessBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Script,
    Test,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Script => "script",
            RunKind::Test => "test",
        }
    }

    /// Path segment listing the runners for this kind.
    pub fn runners_segment(&self) -> &'static str {
        match self {
            RunKind::Script => "runners",
            RunKind::Test => "frameworks",
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerOption {
    pub id: String,
    pub label: String,
}

/// A script or test run to start. The tracker is already bound to its flow
/// and has its pending record stored.
pub struct StartRequest {
    pub kind: RunKind,
    pub file_path: String,
    pub runner_id: Option<String>,
    pub tracker: FlowTracker,
    pub session_id: Option<String>,
}

/// An HTTP request to execute from request-file content.
pub struct ExecuteRequest {
    pub content: String,
    pub request_name: Option<String>,
    pub request_index: Option<usize>,
    pub tracker: FlowTracker,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished,
}

impl CancelOutcome {
    pub fn cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled)
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Runners able to handle `file_path`, best first.
    fn detect_runners(&self, kind: RunKind, file_path: &str) -> Vec<RunnerOption>;

    /// Start a run. Returns once the run is underway; its lifecycle is
    /// reported through the request's tracker.
    async fn start(&self, request: StartRequest) -> Result<(), RunnerError>;

    async fn execute(&self, _request: ExecuteRequest) -> Result<(), RunnerError> {
        Err(RunnerError::Unsupported {
            operation: "HTTP execution",
        })
    }

    async fn cancel(&self, run_id: &str) -> CancelOutcome;

    /// Stop everything still running.
    async fn shutdown(&self) {}
}
