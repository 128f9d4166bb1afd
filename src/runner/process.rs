use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;
use crate::flow::{EventHandler, FinalizeExecution, FlowEvent, FlowTracker, OutputStream};

use super::{CancelOutcome, ExecutionBackend, RunKind, RunnerDetector, RunnerOption, StartRequest};

type RunningMap = Arc<tokio::sync::Mutex<HashMap<String, CancellationToken>>>;

/// Runs scripts and test files as child processes.
///
/// Each child is supervised by its own task, which forwards output lines as
/// events and reports the exit through the run's tracker. Running children
/// are tracked by run id so they can be cancelled.
pub struct ProcessBackend {
    detector: RunnerDetector,
    working_dir: Option<PathBuf>,
    running: RunningMap,
}

impl ProcessBackend {
    pub fn new(detector: RunnerDetector) -> Self {
        Self {
            detector,
            working_dir: None,
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(RunnerDetector::default())
    }
}

fn started_event(kind: RunKind, file_path: &str, runner: &str) -> FlowEvent {
    match kind {
        RunKind::Script => FlowEvent::ScriptStarted {
            file_path: file_path.to_string(),
            runner: runner.to_string(),
        },
        RunKind::Test => FlowEvent::TestStarted {
            file_path: file_path.to_string(),
            framework: runner.to_string(),
        },
    }
}

fn output_event(kind: RunKind, stream: OutputStream, data: String) -> FlowEvent {
    match kind {
        RunKind::Script => FlowEvent::ScriptOutput { stream, data },
        RunKind::Test => FlowEvent::TestOutput { stream, data },
    }
}

fn finished_event(kind: RunKind, exit_code: Option<i32>) -> FlowEvent {
    match kind {
        RunKind::Script => FlowEvent::ScriptFinished { exit_code },
        RunKind::Test => FlowEvent::TestFinished { exit_code },
    }
}

fn forward_lines<R>(
    reader: R,
    kind: RunKind,
    stream: OutputStream,
    handler: EventHandler,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(mut line)) => {
                    line.push('\n');
                    handler.handle(output_event(kind, stream, line));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "stopped reading child output");
                    break;
                }
            }
        }
    })
}

struct Supervised {
    run_id: String,
    kind: RunKind,
    label: &'static str,
    child: Child,
    tracker: FlowTracker,
    handler: EventHandler,
    token: CancellationToken,
    running: RunningMap,
}

async fn supervise(mut run: Supervised) {
    let forwarders: Vec<JoinHandle<()>> = [
        run.child
            .stdout
            .take()
            .map(|out| forward_lines(out, run.kind, OutputStream::Stdout, run.handler.clone())),
        run.child
            .stderr
            .take()
            .map(|err| forward_lines(err, run.kind, OutputStream::Stderr, run.handler.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let exit = tokio::select! {
        status = run.child.wait() => Some(status),
        _ = run.token.cancelled() => None,
    };

    if exit.is_some() {
        // Output emitted before the exit is forwarded before the exit event.
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
    } else {
        if let Err(e) = run.child.kill().await {
            tracing::warn!(run_id = %run.run_id, error = %e, "failed to kill child process");
        }
        for forwarder in &forwarders {
            forwarder.abort();
        }
    }
    run.running.lock().await.remove(&run.run_id);

    let stage = run.kind.as_str();
    match exit {
        None => {
            tracing::info!(run_id = %run.run_id, "run cancelled");
            run.tracker.fail_execution("cancelled", "run cancelled");
        }
        Some(Ok(status)) => {
            run.handler.handle(finished_event(run.kind, status.code()));
            if status.success() {
                run.tracker.finalize_execution(FinalizeExecution::default());
            } else {
                let message = match status.code() {
                    Some(code) => format!("{} exited with code {code}", run.label),
                    None => format!("{} terminated by signal", run.label),
                };
                run.tracker.fail_execution(stage, &message);
            }
        }
        Some(Err(e)) => {
            run.tracker
                .fail_execution(stage, &format!("failed to wait for {}: {e}", run.label));
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn detect_runners(&self, kind: RunKind, file_path: &str) -> Vec<RunnerOption> {
        self.detector.detect(kind, file_path)
    }

    async fn start(&self, request: StartRequest) -> Result<(), RunnerError> {
        let StartRequest {
            kind,
            file_path,
            runner_id,
            tracker,
            session_id,
        } = request;
        let spec = self
            .detector
            .resolve(kind, &file_path, runner_id.as_deref())?;

        let mut cmd = tokio::process::Command::new(spec.program);
        cmd.args(spec.args)
            .arg(&file_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|source| RunnerError::SpawnFailed {
            command: spec.program.to_string(),
            source,
        })?;

        let run_id = tracker.run_id().to_string();
        tracing::info!(run_id = %run_id, kind = %kind, runner = spec.id, file = %file_path, "run started");

        let handler = tracker.create_event_handler(session_id);
        handler.handle(started_event(kind, &file_path, spec.id));

        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(run_id.clone(), token.clone());

        tokio::spawn(supervise(Supervised {
            run_id,
            kind,
            label: spec.label,
            child,
            tracker,
            handler,
            token,
            running: Arc::clone(&self.running),
        }));
        Ok(())
    }

    async fn cancel(&self, run_id: &str) -> CancelOutcome {
        match self.running.lock().await.remove(run_id) {
            Some(token) => {
                token.cancel();
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::AlreadyFinished,
        }
    }

    async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (run_id, token) in running.drain() {
            tracing::info!(run_id = %run_id, "stopping run on shutdown");
            token.cancel();
        }
    }
}
