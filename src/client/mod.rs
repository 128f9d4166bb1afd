//! Consumer side of the event stream: launching a script or test run and
//! following it to completion.
//!
//! [`RunnerClient`] drives one run at a time through
//! `idle → connecting → open → closed | error`. It always opens the event
//! subscription before asking the server to start anything, so no early
//! event is lost. Every time it resumes after an `.await` it re-checks
//! [`RunnerApi::is_connected`]: losing the connection while detecting or
//! starting lands in `idle`, while `error` is kept for a stream that broke
//! with the connection still up.

pub mod http;
pub mod sse;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::flow::EventEnvelope;
use crate::runner::{RunKind, RunnerOption};

pub use crate::server::api::StartedRun;
pub use http::HttpRunnerApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl SubscriptionStatus {
    /// A run is being set up or is streaming.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// What a subscription's channel carries.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Event(EventEnvelope),
    /// The stream ended and could not be reopened.
    Broken(String),
}

/// An open event subscription. Cancelling `abort` stops the stream.
pub struct Subscription {
    pub events: mpsc::Receiver<StreamMessage>,
    pub abort: CancellationToken,
}

/// Server operations the client needs.
#[async_trait]
pub trait RunnerApi: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    async fn detect_runners(
        &self,
        kind: RunKind,
        file_path: &str,
    ) -> Result<Vec<RunnerOption>, ClientError>;

    async fn create_flow(&self, label: Option<String>) -> Result<String, ClientError>;

    async fn subscribe(&self, flow_id: &str) -> Result<Subscription, ClientError>;

    async fn start(
        &self,
        kind: RunKind,
        file_path: &str,
        runner_id: Option<&str>,
        flow_id: &str,
    ) -> Result<StartedRun, ClientError>;

    async fn cancel(&self, kind: RunKind, run_id: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A run was already starting, active or awaiting a selection.
    Ignored,
    Started { run_id: String },
    /// Several runners fit; call `select_runner` or `close_selection`.
    AwaitingSelection(Vec<RunnerOption>),
    NoRunner,
    /// The connection dropped; the client is idle.
    Disconnected,
    /// The client was cancelled while the run was being set up.
    Cancelled,
    Failed(String),
}

struct PendingSelection {
    file_path: String,
    options: Vec<RunnerOption>,
}

#[derive(Default)]
struct ClientState {
    generation: u64,
    starting: bool,
    flow_id: Option<String>,
    run_id: Option<String>,
    abort: Option<CancellationToken>,
    pending: Option<PendingSelection>,
    /// Runs that reached a terminal event before their start call returned.
    finished_runs: Vec<String>,
}

struct ClientInner<A> {
    api: Arc<A>,
    kind: RunKind,
    status: watch::Sender<SubscriptionStatus>,
    events: mpsc::UnboundedSender<EventEnvelope>,
    state: Mutex<ClientState>,
}

pub struct RunnerClient<A: RunnerApi> {
    inner: Arc<ClientInner<A>>,
}

impl<A: RunnerApi> Clone for RunnerClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: RunnerApi> RunnerClient<A> {
    /// Returns the client and the channel of application envelopes it
    /// receives (transport frames removed).
    pub fn new(api: Arc<A>, kind: RunKind) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SubscriptionStatus::Idle);
        let client = Self {
            inner: Arc::new(ClientInner {
                api,
                kind,
                status,
                events,
                state: Mutex::new(ClientState::default()),
            }),
        };
        (client, rx)
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.inner.status.subscribe()
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock().run_id.clone()
    }

    pub fn flow_id(&self) -> Option<String> {
        self.lock().flow_id.clone()
    }

    pub fn pending_selection(&self) -> Option<Vec<RunnerOption>> {
        self.lock().pending.as_ref().map(|p| p.options.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: SubscriptionStatus) {
        self.inner.status.send_replace(status);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Abandon the setup for `generation`: idle when the connection is gone,
    /// error otherwise.
    fn abandon(&self, generation: u64, error: Option<&ClientError>) -> RunOutcome {
        let connected = self.inner.api.is_connected();
        {
            let mut state = self.lock();
            if state.generation != generation {
                return RunOutcome::Cancelled;
            }
            state.starting = false;
            if let Some(abort) = state.abort.take() {
                abort.cancel();
            }
            let status = if connected && error.is_some() {
                SubscriptionStatus::Error
            } else {
                SubscriptionStatus::Idle
            };
            self.set_status(status);
        }
        match error {
            Some(e) if connected => {
                tracing::warn!(kind = %self.inner.kind, error = %e, "run failed to start");
                RunOutcome::Failed(e.to_string())
            }
            _ => RunOutcome::Disconnected,
        }
    }

    /// Claim the client for a new run. `None` while another run is starting,
    /// active or awaiting a selection.
    fn begin(&self) -> Option<u64> {
        let mut state = self.lock();
        if state.starting || state.pending.is_some() || self.status().is_active() {
            return None;
        }
        state.starting = true;
        state.run_id = None;
        state.finished_runs.clear();
        self.set_status(SubscriptionStatus::Connecting);
        Some(state.generation)
    }

    /// Detect runners for `file_path` and start it, or offer a choice.
    pub async fn run(&self, file_path: &str) -> RunOutcome {
        let Some(generation) = self.begin() else {
            return RunOutcome::Ignored;
        };

        let detected = self
            .inner
            .api
            .detect_runners(self.inner.kind, file_path)
            .await;
        if !self.is_current(generation) {
            return RunOutcome::Cancelled;
        }
        if !self.inner.api.is_connected() {
            return self.abandon(generation, None);
        }
        let options = match detected {
            Ok(options) => options,
            Err(e) => return self.abandon(generation, Some(&e)),
        };

        match options.len() {
            0 => {
                let mut state = self.lock();
                state.starting = false;
                self.set_status(SubscriptionStatus::Idle);
                RunOutcome::NoRunner
            }
            1 => {
                let runner_id = options[0].id.clone();
                self.launch(generation, file_path, Some(&runner_id)).await
            }
            _ => {
                let mut state = self.lock();
                state.starting = false;
                state.pending = Some(PendingSelection {
                    file_path: file_path.to_string(),
                    options: options.clone(),
                });
                self.set_status(SubscriptionStatus::Idle);
                RunOutcome::AwaitingSelection(options)
            }
        }
    }

    /// Start `file_path` with `runner_id` without asking the server which
    /// runners fit. The server still rejects a runner it does not know.
    pub async fn run_with(&self, file_path: &str, runner_id: &str) -> RunOutcome {
        let Some(generation) = self.begin() else {
            return RunOutcome::Ignored;
        };
        self.launch(generation, file_path, Some(runner_id)).await
    }

    /// Start the pending run with the chosen runner. Consumes the selection.
    pub async fn select_runner(&self, runner_id: &str) -> RunOutcome {
        let (generation, file_path) = {
            let mut state = self.lock();
            let pending = match state.pending.take() {
                Some(pending) if pending.options.iter().any(|o| o.id == runner_id) => pending,
                Some(pending) => {
                    state.pending = Some(pending);
                    return RunOutcome::Failed(format!("unknown runner '{runner_id}'"));
                }
                None => return RunOutcome::Ignored,
            };
            state.starting = true;
            self.set_status(SubscriptionStatus::Connecting);
            (state.generation, pending.file_path)
        };
        self.launch(generation, &file_path, Some(runner_id)).await
    }

    /// Drop the pending selection without starting anything.
    pub fn close_selection(&self) {
        let mut state = self.lock();
        if state.pending.take().is_some() && !state.starting {
            self.set_status(SubscriptionStatus::Idle);
        }
    }

    async fn open_subscription(
        &self,
        generation: u64,
        label: &str,
    ) -> Result<Option<(String, Subscription)>, ClientError> {
        let api = &self.inner.api;
        let reused = self.lock().flow_id.clone();
        if let Some(flow_id) = reused {
            match api.subscribe(&flow_id).await {
                Ok(sub) => return Ok(Some((flow_id, sub))),
                // The flow expired or was finished; start a new one.
                Err(e) if e.is_already_finished() => {
                    tracing::debug!(flow_id = %flow_id, "client flow gone, creating a new one");
                    self.lock().flow_id = None;
                }
                Err(e) => return Err(e),
            }
            if !self.is_current(generation) || !api.is_connected() {
                return Ok(None);
            }
        }

        let flow_id = api.create_flow(Some(label.to_string())).await?;
        if !self.is_current(generation) || !api.is_connected() {
            return Ok(None);
        }
        self.lock().flow_id = Some(flow_id.clone());
        let sub = api.subscribe(&flow_id).await?;
        Ok(Some((flow_id, sub)))
    }

    async fn launch(&self, generation: u64, file_path: &str, runner_id: Option<&str>) -> RunOutcome {
        let api = Arc::clone(&self.inner.api);
        let label = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.to_string());

        let opened = self.open_subscription(generation, &label).await;
        let (flow_id, subscription) = match opened {
            Ok(Some(opened)) => opened,
            Ok(None) => return self.stale_or_disconnected(generation),
            Err(e) => return self.abandon(generation, Some(&e)),
        };
        {
            let mut state = self.lock();
            if state.generation != generation {
                subscription.abort.cancel();
                return RunOutcome::Cancelled;
            }
            state.abort = Some(subscription.abort.clone());
        }
        if !api.is_connected() {
            return self.abandon(generation, None);
        }
        self.spawn_pump(generation, subscription);

        let started = api
            .start(self.inner.kind, file_path, runner_id, &flow_id)
            .await;

        if !self.is_current(generation) {
            // Cancelled while the start call was in flight.
            if let Ok(run) = &started
                && let Err(e) = api.cancel(self.inner.kind, &run.run_id).await
            {
                tracing::debug!(run_id = %run.run_id, error = %e, "late cancel failed");
            }
            return RunOutcome::Cancelled;
        }
        if !api.is_connected() {
            return self.abandon(generation, None);
        }
        let run = match started {
            Ok(run) => run,
            Err(e) => {
                if e.is_already_finished() {
                    self.lock().flow_id = None;
                }
                return self.abandon(generation, Some(&e));
            }
        };

        let mut state = self.lock();
        if state.generation != generation {
            return RunOutcome::Cancelled;
        }
        state.starting = false;
        state.run_id = Some(run.run_id.clone());
        if state.finished_runs.contains(&run.run_id) {
            if let Some(abort) = state.abort.take() {
                abort.cancel();
            }
            self.set_status(SubscriptionStatus::Closed);
        } else if self.status() == SubscriptionStatus::Connecting {
            self.set_status(SubscriptionStatus::Open);
        } else {
            // The stream broke while the start call was in flight. The run id
            // is kept so `cancel` can still stop the remote run.
            tracing::warn!(
                run_id = %run.run_id,
                status = ?self.status(),
                "run started without an event stream"
            );
        }
        tracing::info!(run_id = %run.run_id, flow_id = %flow_id, "run started");
        RunOutcome::Started { run_id: run.run_id }
    }

    fn stale_or_disconnected(&self, generation: u64) -> RunOutcome {
        if self.is_current(generation) {
            self.abandon(generation, None)
        } else {
            RunOutcome::Cancelled
        }
    }

    fn spawn_pump(&self, generation: u64, subscription: Subscription) {
        let client = self.clone();
        let Subscription { mut events, abort } = subscription;
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = abort.cancelled() => break,
                    message = events.recv() => message,
                };
                match message {
                    Some(StreamMessage::Event(envelope)) => {
                        if envelope.is_transport_frame() {
                            continue;
                        }
                        let terminal = envelope.is_terminal().then(|| envelope.run_id.clone());
                        let _ = client.inner.events.send(envelope);
                        if let Some(run_id) = terminal {
                            client.on_terminal(generation, run_id);
                        }
                    }
                    Some(StreamMessage::Broken(reason)) => {
                        client.on_broken(generation, &reason);
                        break;
                    }
                    None => {
                        client.on_broken(generation, "event stream closed");
                        break;
                    }
                }
            }
        });
    }

    fn on_terminal(&self, generation: u64, run_id: String) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        match &state.run_id {
            Some(current) if *current == run_id => {
                if let Some(abort) = state.abort.take() {
                    abort.cancel();
                }
                self.set_status(SubscriptionStatus::Closed);
            }
            Some(_) => {}
            None => state.finished_runs.push(run_id),
        }
    }

    fn on_broken(&self, generation: u64, reason: &str) {
        let connected = self.inner.api.is_connected();
        let mut state = self.lock();
        if state.generation != generation || self.status() == SubscriptionStatus::Closed {
            return;
        }
        // A start call still in flight keeps `starting` set, so `run` stays
        // ignored until `launch` resolves it.
        state.abort = None;
        let status = if connected {
            tracing::warn!(reason, "event stream broke");
            SubscriptionStatus::Error
        } else {
            SubscriptionStatus::Idle
        };
        self.set_status(status);
    }

    /// Tear down local state. Bumping the generation makes every in-flight
    /// setup step a no-op when it resumes.
    fn teardown(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.starting = false;
        state.run_id = None;
        state.pending = None;
        state.finished_runs.clear();
        if let Some(abort) = state.abort.take() {
            abort.cancel();
        }
        self.set_status(SubscriptionStatus::Idle);
    }

    /// Ask the server to stop the current run, then tear down locally
    /// whatever the answer.
    pub async fn cancel(&self) {
        let run_id = self.lock().run_id.clone();
        if let Some(run_id) = run_id {
            match self.inner.api.cancel(self.inner.kind, &run_id).await {
                Ok(()) => tracing::debug!(run_id = %run_id, "run cancelled"),
                Err(e) if e.is_already_finished() => {
                    tracing::debug!(run_id = %run_id, "run already finished")
                }
                Err(e) => tracing::debug!(run_id = %run_id, error = %e, "cancel request failed"),
            }
        }
        self.teardown();
    }

    /// Return from `closed` or `error` to `idle`.
    pub fn reset(&self) {
        if matches!(
            self.status(),
            SubscriptionStatus::Closed | SubscriptionStatus::Error
        ) {
            self.teardown();
        }
    }

    /// Same teardown as [`cancel`](Self::cancel), without waiting for it.
    pub fn dispose(&self) {
        let client = self.clone();
        tokio::spawn(async move { client.cancel().await });
    }
}
