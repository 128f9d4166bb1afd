//! Typed error hierarchy for treq.
//!
//! Three top-level enums cover the three subsystems:
//! - `FlowError`: flow registry and execution record failures
//! - `RunnerError`: execution backend (runner detection, start, cancel) failures
//! - `ClientError`: failures seen by a client talking to a treq server
//!
//! A tracked request/script/test that fails is *not* an error here: it is
//! recorded as `status = failed` on its `ExecutionRecord`.

use thiserror::Error;

/// Errors from the flow registry.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidId {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Flow {flow_id} not found")]
    FlowNotFound { flow_id: String },

    #[error("Execution {req_exec_id} not found in flow {flow_id}")]
    ExecutionNotFound {
        flow_id: String,
        req_exec_id: String,
    },

    #[error("Flow {flow_id} is finished and accepts no new executions")]
    FlowFinished { flow_id: String },

    #[error("Execution {req_exec_id} already exists in flow {flow_id}")]
    ExecutionExists {
        flow_id: String,
        req_exec_id: String,
    },

    #[error("Flow {flow_id} lock poisoned")]
    LockPoisoned { flow_id: String },
}

impl FlowError {
    /// True for the 404-equivalent variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FlowError::FlowNotFound { .. } | FlowError::ExecutionNotFound { .. }
        )
    }
}

/// Errors from an execution backend.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{operation} is not supported by this backend")]
    Unsupported { operation: &'static str },

    #[error("No runner available for {path}")]
    NoRunner { path: String },

    #[error("Unknown runner '{runner_id}' for {path}")]
    UnknownRunner { runner_id: String, path: String },

    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the client side of the event stream and control API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected to the treq server")]
    Disconnected,

    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode server response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Cancelling a run that already ended is reported as 404/409 by servers;
    /// clients treat both as success.
    pub fn is_already_finished(&self) -> bool {
        matches!(self, ClientError::Http { status: 404 | 409, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_error_not_found_carries_ids() {
        let err = FlowError::ExecutionNotFound {
            flow_id: "flow-1".to_string(),
            req_exec_id: "req-9".to_string(),
        };
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("flow-1"));
        assert!(msg.contains("req-9"));
    }

    #[test]
    fn flow_error_variants_are_distinct() {
        let finished = FlowError::FlowFinished {
            flow_id: "f".into(),
        };
        let invalid = FlowError::InvalidId {
            kind: "flow id",
            value: "".into(),
            reason: "must not be empty",
        };
        assert!(!finished.is_not_found());
        assert!(!invalid.is_not_found());
        assert!(matches!(invalid, FlowError::InvalidId { kind: "flow id", .. }));
    }

    #[test]
    fn runner_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "bun not found");
        let err = RunnerError::SpawnFailed {
            command: "bun".into(),
            source: io_err,
        };
        match &err {
            RunnerError::SpawnFailed { command, source } => {
                assert_eq!(command, "bun");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn client_error_already_finished_detection() {
        let gone = ClientError::Http {
            status: 404,
            message: "run not found".into(),
        };
        let boom = ClientError::Http {
            status: 500,
            message: "boom".into(),
        };
        assert!(gone.is_already_finished());
        assert!(!boom.is_already_finished());
        assert!(!ClientError::Disconnected.is_already_finished());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&FlowError::LockPoisoned {
            flow_id: "x".into(),
        });
        assert_std_error(&RunnerError::NoRunner { path: "a.ts".into() });
        assert_std_error(&ClientError::Disconnected);
    }
}
