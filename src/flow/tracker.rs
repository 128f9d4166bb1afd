//! Per-execution adapter between an execution engine and the flow registry.
//!
//! A [`FlowTracker`] is bound to one `(flow?, context, run_id, req_exec_id?,
//! start_time)` tuple. Engine events go through the tracker, which keeps a
//! local projection of the execution's state and either hands the event to
//! the [`FlowManager`] (bound) or to the [`ExecutionContext`] fallback
//! (one-off executions without a flow).
//!
//! Nothing on the tracker's public surface returns an error: registry
//! failures are logged and the local projection keeps working.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::FlowError;

use super::events::FlowEvent;
use super::manager::FlowManager;
use super::models::{
    ExecutionError, ExecutionRecord, ExecutionSource, ExecutionStatus, ResponseSummary, Timing,
    now_ms,
};

/// Receives events for executions that have no flow.
pub trait ExecutionContext: Send + Sync {
    fn on_event(&self, session_id: Option<&str>, run_id: &str, event: &FlowEvent);
}

/// Context that drops every event.
pub struct NoopContext;

impl ExecutionContext for NoopContext {
    fn on_event(&self, _session_id: Option<&str>, _run_id: &str, _event: &FlowEvent) {}
}

/// The flow a tracker writes into.
#[derive(Clone)]
pub struct FlowBinding {
    pub manager: Arc<FlowManager>,
    pub flow_id: String,
}

impl FlowBinding {
    pub fn new(manager: Arc<FlowManager>, flow_id: impl Into<String>) -> Self {
        Self {
            manager,
            flow_id: flow_id.into(),
        }
    }
}

/// Local view of the tracked execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerState {
    pub status: ExecutionStatus,
    pub url_resolved: Option<String>,
    pub error: Option<ExecutionError>,
    pub timing: Timing,
    pub session_id: Option<String>,
}

impl TrackerState {
    fn apply(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::FetchStarted { url, .. } => {
                self.url_resolved = Some(url.clone());
                self.advance(ExecutionStatus::Running);
            }
            FlowEvent::FetchFinished { ttfb, .. } => {
                if ttfb.is_some() {
                    self.timing.ttfb = *ttfb;
                }
            }
            FlowEvent::ScriptStarted { .. } | FlowEvent::TestStarted { .. } => {
                self.advance(ExecutionStatus::Running);
            }
            _ => {}
        }
    }

    fn advance(&mut self, next: ExecutionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Fields known when an execution is queued.
#[derive(Debug, Clone, Default)]
pub struct PendingExecution {
    pub session_id: Option<String>,
    pub req_label: Option<String>,
    pub source: ExecutionSource,
    pub method: Option<String>,
    pub url_template: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body_preview: Option<String>,
}

/// Fields known when an execution completes.
#[derive(Debug, Clone, Default)]
pub struct FinalizeExecution {
    /// Defaults to now.
    pub end_time: Option<u64>,
    pub response: Option<ResponseSummary>,
}

struct TrackerInner {
    flow: Option<FlowBinding>,
    context: Arc<dyn ExecutionContext>,
    run_id: String,
    req_exec_id: Option<String>,
    state: Mutex<TrackerState>,
}

#[derive(Clone)]
pub struct FlowTracker {
    inner: Arc<TrackerInner>,
}

impl FlowTracker {
    pub fn new(
        flow: Option<FlowBinding>,
        context: Arc<dyn ExecutionContext>,
        run_id: impl Into<String>,
        req_exec_id: Option<String>,
        start_time: u64,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                flow,
                context,
                run_id: run_id.into(),
                req_exec_id,
                state: Mutex::new(TrackerState {
                    timing: Timing::started_at(start_time),
                    ..TrackerState::default()
                }),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn req_exec_id(&self) -> Option<&str> {
        self.inner.req_exec_id.as_deref()
    }

    pub fn flow_id(&self) -> Option<&str> {
        self.inner.flow.as_ref().map(|b| b.flow_id.as_str())
    }

    pub fn state(&self) -> TrackerState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flow and execution id, when both are bound.
    fn record_target(&self) -> Option<(&FlowBinding, &str)> {
        match (&self.inner.flow, &self.inner.req_exec_id) {
            (Some(binding), Some(id)) => Some((binding, id.as_str())),
            _ => None,
        }
    }

    /// Store a pending record and announce it with `requestQueued`.
    pub fn init_pending_execution(&self, params: PendingExecution) {
        if let Err(e) = self.try_init_pending_execution(params) {
            tracing::warn!(
                flow_id = ?self.flow_id(),
                req_exec_id = ?self.req_exec_id(),
                error = %e,
                "failed to store pending execution"
            );
        }
    }

    /// Like [`init_pending_execution`](Self::init_pending_execution), but
    /// reports why the record was not stored: the flow is finished or
    /// gone, or the `req_exec_id` is already taken. Nothing is emitted then.
    pub fn try_init_pending_execution(&self, params: PendingExecution) -> Result<(), FlowError> {
        let start_time = {
            let mut state = self.lock_state();
            if params.session_id.is_some() {
                state.session_id = params.session_id.clone();
            }
            state.timing.start_time
        };

        let Some((binding, req_exec_id)) = self.record_target() else {
            return Ok(());
        };

        let record = ExecutionRecord {
            session_id: params.session_id.clone(),
            req_label: params.req_label.clone(),
            source: params.source,
            method: params.method.clone(),
            url_template: params.url_template.clone(),
            headers: params.headers,
            body_preview: params.body_preview,
            ..ExecutionRecord::pending(&binding.flow_id, req_exec_id, start_time)
        };
        binding.manager.insert_execution(&binding.flow_id, record)?;

        self.route(
            params.session_id.as_deref(),
            &FlowEvent::RequestQueued {
                req_label: params.req_label,
                method: params.method,
                url_template: params.url_template,
            },
        );
        Ok(())
    }

    pub fn create_event_handler(&self, session_id: Option<String>) -> EventHandler {
        if session_id.is_some() {
            self.lock_state().session_id = session_id.clone();
        }
        EventHandler {
            tracker: self.clone(),
            session_id,
        }
    }

    /// Record the first failure and emit `executionFailed` for it. Every
    /// later call is ignored, as is a failure the stored record refuses
    /// because it already finished.
    pub fn fail_execution(&self, stage: &str, message: &str) {
        let session_id = {
            let mut state = self.lock_state();
            if state.error.is_some() || !state.status.can_transition_to(ExecutionStatus::Failed) {
                return;
            }
            let end_time = now_ms();
            // The stored record decides first; the tracker lock is always
            // taken before a flow lock.
            if let Some((binding, req_exec_id)) = self.record_target() {
                match binding.manager.update_execution(&binding.flow_id, req_exec_id, |r| {
                    r.fail(stage, message, end_time)
                }) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => tracing::debug!(req_exec_id, error = %e, "failure not persisted"),
                }
            }
            state.advance(ExecutionStatus::Failed);
            state.error = Some(ExecutionError {
                stage: stage.to_string(),
                message: message.to_string(),
            });
            state.timing.finish(end_time);
            state.session_id.clone()
        };

        self.route(
            session_id.as_deref(),
            &FlowEvent::ExecutionFailed {
                stage: stage.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Mark success, close the timing window and attach the response.
    ///
    /// Bound trackers only move once the stored record accepts the
    /// completion; `executionSucceeded` is emitted only when it was stored.
    pub fn finalize_execution(&self, params: FinalizeExecution) {
        let end_time = params.end_time.unwrap_or_else(now_ms);
        let status = params.response.as_ref().map(|r| r.status);
        let (session_id, duration_ms) = {
            let mut state = self.lock_state();
            if !state.status.can_transition_to(ExecutionStatus::Success) {
                return;
            }
            let stored = match self.record_target() {
                Some((binding, req_exec_id)) => {
                    match binding.manager.update_execution(&binding.flow_id, req_exec_id, |r| {
                        r.complete(end_time, params.response)
                    }) {
                        Ok(true) => true,
                        Ok(false) => return,
                        Err(e) => {
                            tracing::warn!(
                                req_exec_id,
                                error = %e,
                                "failed to persist completed execution"
                            );
                            false
                        }
                    }
                }
                None => false,
            };
            state.advance(ExecutionStatus::Success);
            state.timing.finish(end_time);
            if !stored {
                return;
            }
            (
                state.session_id.clone(),
                state.timing.duration_ms.unwrap_or(0),
            )
        };

        self.route(
            session_id.as_deref(),
            &FlowEvent::ExecutionSucceeded {
                duration_ms,
                status,
            },
        );
    }

    fn handle(&self, session_id: Option<&str>, event: FlowEvent) {
        if let FlowEvent::Error { stage, message } = &event {
            self.fail_execution(stage, message);
            return;
        }
        self.lock_state().apply(&event);
        self.route(session_id, &event);
    }

    /// Bound trackers emit through the registry; unbound ones fall back to
    /// the context.
    fn route(&self, session_id: Option<&str>, event: &FlowEvent) {
        let inner = &self.inner;
        match &inner.flow {
            Some(binding) => {
                if let Err(e) = binding.manager.emit_event(
                    &binding.flow_id,
                    &inner.run_id,
                    inner.req_exec_id.as_deref(),
                    session_id,
                    event,
                ) {
                    tracing::debug!(
                        flow_id = %binding.flow_id,
                        event = event.event_type(),
                        error = %e,
                        "event not emitted"
                    );
                }
            }
            None => inner.context.on_event(session_id, &inner.run_id, event),
        }
    }
}

/// Consumes engine events for one tracker.
#[derive(Clone)]
pub struct EventHandler {
    tracker: FlowTracker,
    session_id: Option<String>,
}

impl EventHandler {
    pub fn handle(&self, event: FlowEvent) {
        self.tracker.handle(self.session_id.as_deref(), event);
    }

    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::models::EventEnvelope;

    #[derive(Default)]
    struct RecordingContext {
        calls: Mutex<Vec<(Option<String>, String, FlowEvent)>>,
    }

    impl RecordingContext {
        fn calls(&self) -> Vec<(Option<String>, String, FlowEvent)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ExecutionContext for RecordingContext {
        fn on_event(&self, session_id: Option<&str>, run_id: &str, event: &FlowEvent) {
            self.calls.lock().unwrap().push((
                session_id.map(str::to_string),
                run_id.to_string(),
                event.clone(),
            ));
        }
    }

    struct Fixture {
        manager: Arc<FlowManager>,
        flow_id: String,
        context: Arc<RecordingContext>,
        tracker: FlowTracker,
        events: tokio::sync::mpsc::Receiver<EventEnvelope>,
    }

    fn bound(start_time: u64) -> Fixture {
        let manager = Arc::new(FlowManager::default());
        let flow_id = manager.create(None).flow_id;
        let events = manager.subscribe(&flow_id).unwrap().receiver;
        let context = Arc::new(RecordingContext::default());
        let tracker = FlowTracker::new(
            Some(FlowBinding::new(Arc::clone(&manager), &flow_id)),
            context.clone(),
            "run-1",
            Some("req-1".to_string()),
            start_time,
        );
        Fixture {
            manager,
            flow_id,
            context,
            tracker,
            events,
        }
    }

    fn unbound() -> (Arc<RecordingContext>, FlowTracker) {
        let context = Arc::new(RecordingContext::default());
        let tracker = FlowTracker::new(None, context.clone(), "run-1", None, 1000);
        (context, tracker)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_init_pending_emits_one_request_queued() {
        let mut fx = bound(1000);
        fx.tracker.init_pending_execution(PendingExecution {
            req_label: Some("Get users".into()),
            method: Some("GET".into()),
            url_template: Some("{{base}}/users".into()),
            ..PendingExecution::default()
        });

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "requestQueued");
        assert_eq!(events[0].req_exec_id.as_deref(), Some("req-1"));
        assert_eq!(events[0].payload["reqLabel"], "Get users");

        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.timing.start_time, 1000);
        assert!(fx.context.calls().is_empty());
    }

    #[test]
    fn test_fail_execution_only_first_counts() {
        let mut fx = bound(1000);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);

        fx.tracker.fail_execution("fetch", "first error");
        fx.tracker.fail_execution("fetch", "second error");

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "executionFailed");
        assert_eq!(events[0].payload["stage"], "fetch");
        assert_eq!(events[0].payload["message"], "first error");

        let state = fx.tracker.state();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error.unwrap().message, "first error");

        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.error.unwrap().message, "first error");
    }

    #[test]
    fn test_error_event_delegates_to_fail_execution() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);

        let handler = fx.tracker.create_event_handler(Some("sess-1".into()));
        handler.handle(FlowEvent::Error {
            stage: "compile".into(),
            message: "unresolved variable".into(),
        });
        handler.handle(FlowEvent::Error {
            stage: "fetch".into(),
            message: "again".into(),
        });

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "executionFailed");
        assert_eq!(events[0].session_id.as_deref(), Some("sess-1"));
        assert_eq!(fx.tracker.state().error.unwrap().stage, "compile");
    }

    #[test]
    fn test_concurrent_failures_emit_once() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let tracker = fx.tracker.clone();
                std::thread::spawn(move || tracker.fail_execution("fetch", &format!("error {i}")))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(
            record.error.unwrap().message,
            events[0].payload["message"].as_str().unwrap()
        );
    }

    #[test]
    fn test_finalize_computes_duration() {
        let mut fx = bound(1000);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);

        fx.tracker.finalize_execution(FinalizeExecution {
            end_time: Some(1500),
            response: Some(ResponseSummary {
                status: 201,
                status_text: "Created".into(),
                headers: BTreeMap::new(),
                body: Some("{}".into()),
                encoding: Default::default(),
                truncated: false,
                body_bytes: 2,
            }),
        });

        let state = fx.tracker.state();
        assert_eq!(state.status, ExecutionStatus::Success);
        assert_eq!(state.timing.duration_ms, Some(500));

        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.timing.end_time, Some(1500));
        assert_eq!(record.timing.duration_ms, Some(500));
        assert_eq!(record.response.unwrap().status, 201);

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "executionSucceeded");
        assert_eq!(events[0].payload["durationMs"], 500);
        assert_eq!(events[0].payload["status"], 201);
    }

    #[test]
    fn test_init_pending_refuses_taken_id_and_finished_flow() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        fx.tracker.finalize_execution(FinalizeExecution::default());
        drain(&mut fx.events);

        let again = FlowTracker::new(
            Some(FlowBinding::new(Arc::clone(&fx.manager), &fx.flow_id)),
            fx.context.clone(),
            "run-2",
            Some("req-1".to_string()),
            50,
        );
        let err = again
            .try_init_pending_execution(PendingExecution::default())
            .unwrap_err();
        assert!(matches!(err, FlowError::ExecutionExists { .. }));
        assert!(drain(&mut fx.events).is_empty(), "no second requestQueued");
        assert_eq!(
            fx.manager.get_execution(&fx.flow_id, "req-1").unwrap().status,
            ExecutionStatus::Success
        );

        fx.manager.finish(&fx.flow_id).unwrap();
        drain(&mut fx.events);
        let late = FlowTracker::new(
            Some(FlowBinding::new(Arc::clone(&fx.manager), &fx.flow_id)),
            fx.context.clone(),
            "run-3",
            Some("req-2".to_string()),
            60,
        );
        let err = late
            .try_init_pending_execution(PendingExecution::default())
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowFinished { .. }));
        assert!(drain(&mut fx.events).is_empty());
    }

    #[test]
    fn test_terminal_record_holds_back_local_transition() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);
        fx.manager
            .update_execution(&fx.flow_id, "req-1", |r| r.fail("runner", "killed", 5))
            .unwrap();

        fx.tracker.finalize_execution(FinalizeExecution::default());
        assert_eq!(fx.tracker.state().status, ExecutionStatus::Pending);
        assert!(fx.tracker.state().timing.end_time.is_none());

        fx.tracker.fail_execution("fetch", "late");
        assert_eq!(fx.tracker.state().status, ExecutionStatus::Pending);
        assert!(fx.tracker.state().error.is_none());

        assert!(drain(&mut fx.events).is_empty());
        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.unwrap().message, "killed");
    }

    #[test]
    fn test_fail_after_success_is_ignored() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        fx.tracker.finalize_execution(FinalizeExecution {
            end_time: Some(10),
            response: None,
        });
        drain(&mut fx.events);

        fx.tracker.fail_execution("fetch", "late");
        assert!(drain(&mut fx.events).is_empty());
        assert_eq!(fx.tracker.state().status, ExecutionStatus::Success);
    }

    #[test]
    fn test_fetch_started_projects_locally_and_onto_record() {
        let mut fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        drain(&mut fx.events);

        let handler = fx.tracker.create_event_handler(None);
        handler.handle(FlowEvent::FetchStarted {
            url: "https://api.example.com".into(),
            method: "GET".into(),
        });

        let state = fx.tracker.state();
        assert_eq!(state.status, ExecutionStatus::Running);
        assert_eq!(state.url_resolved.as_deref(), Some("https://api.example.com"));

        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.url_resolved.as_deref(), Some("https://api.example.com"));

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "fetchStarted");
        assert_eq!(events[0].run_id, "run-1");
    }

    #[test]
    fn test_fetch_finished_and_plugin_hooks_persist() {
        let fx = bound(0);
        fx.tracker.init_pending_execution(PendingExecution::default());
        let handler = fx.tracker.create_event_handler(None);
        handler.handle(FlowEvent::FetchFinished {
            ttfb: Some(42.0),
            status: 200,
        });
        handler.handle(FlowEvent::PluginHookFinished {
            name: "retry".into(),
            hook: "response.after".into(),
            duration_ms: 0.7,
            modified: false,
        });

        assert_eq!(fx.tracker.state().timing.ttfb, Some(42.0));
        let record = fx.manager.get_execution(&fx.flow_id, "req-1").unwrap();
        assert_eq!(record.timing.ttfb, Some(42.0));
        assert_eq!(record.plugin_hooks.len(), 1);
        assert_eq!(record.plugin_hooks[0].plugin_name, "retry");
    }

    #[test]
    fn test_unbound_tracker_never_touches_a_flow() {
        let (context, tracker) = unbound();
        tracker.init_pending_execution(PendingExecution::default());
        tracker.finalize_execution(FinalizeExecution {
            end_time: Some(1500),
            response: None,
        });
        tracker.fail_execution("fetch", "ignored after success");

        let state = tracker.state();
        assert_eq!(state.status, ExecutionStatus::Success);
        assert_eq!(state.timing.duration_ms, Some(500));
        assert!(context.calls().is_empty());
    }

    #[test]
    fn test_unbound_fail_updates_state_and_uses_fallback_once() {
        let (context, tracker) = unbound();
        tracker.init_pending_execution(PendingExecution::default());
        tracker.fail_execution("fetch", "first error");
        tracker.fail_execution("fetch", "second error");

        let state = tracker.state();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error.unwrap().message, "first error");

        let calls = context.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0].2, FlowEvent::ExecutionFailed { .. }));
    }

    #[test]
    fn test_unbound_handler_calls_context_once_per_event() {
        let (context, tracker) = unbound();
        let handler = tracker.create_event_handler(Some("sess-9".into()));
        handler.handle(FlowEvent::CompileStarted);
        handler.handle(FlowEvent::FetchStarted {
            url: "https://api.example.com".into(),
            method: "GET".into(),
        });
        handler.handle(FlowEvent::FetchFinished {
            ttfb: None,
            status: 204,
        });

        let calls = context.calls();
        assert_eq!(calls.len(), 3);
        for (session, run, _) in &calls {
            assert_eq!(session.as_deref(), Some("sess-9"));
            assert_eq!(run, "run-1");
        }
        assert_eq!(tracker.state().status, ExecutionStatus::Running);
        assert_eq!(
            tracker.state().url_resolved.as_deref(),
            Some("https://api.example.com")
        );
    }

    #[test]
    fn test_tracker_survives_disposed_flow() {
        let fx = bound(0);
        fx.manager.dispose(&fx.flow_id);
        fx.tracker.init_pending_execution(PendingExecution::default());
        let handler = fx.tracker.create_event_handler(None);
        handler.handle(FlowEvent::CompileStarted);
        fx.tracker.fail_execution("fetch", "gone");
        assert_eq!(fx.tracker.state().status, ExecutionStatus::Failed);
    }
}
