use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::FlowError;

use super::events::FlowEvent;
use super::fanout::{SubscriberId, Subscribers};
use super::models::{
    EventEnvelope, ExecutionRecord, FlowSnapshot, FlowSummary, now_ms, validate_id,
};

/// How long flows are kept around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Finished flows stay queryable this long after `finish`.
    pub finished_ttl: Duration,
    /// Unfinished flows with no subscribers are evicted after this much inactivity.
    pub idle_ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            finished_ttl: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlowManagerConfig {
    pub retention: RetentionPolicy,
    /// Capacity of each subscriber channel.
    pub subscriber_buffer: usize,
    /// Recent envelopes kept per flow for resuming subscribers.
    pub replay_window: usize,
}

impl Default for FlowManagerConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            subscriber_buffer: 256,
            replay_window: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedFlow {
    pub flow_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedFlow {
    pub flow_id: String,
    pub summary: FlowSummary,
}

/// A live subscription to one flow's event stream.
pub struct FlowSubscription {
    pub id: SubscriberId,
    /// Retained envelopes newer than the resume point, oldest first. They
    /// precede everything the receiver delivers.
    pub backlog: Vec<EventEnvelope>,
    pub receiver: mpsc::Receiver<EventEnvelope>,
}

struct Flow {
    id: String,
    label: Option<String>,
    created_at: u64,
    last_activity_at: u64,
    finished_at: Option<u64>,
    summary: Option<FlowSummary>,
    executions: HashMap<String, ExecutionRecord>,
    seq: u64,
    subscribers: Subscribers,
    recent: VecDeque<EventEnvelope>,
    replay_window: usize,
}

impl Flow {
    fn new(id: String, label: Option<String>, now: u64, replay_window: usize) -> Self {
        Self {
            id,
            label,
            created_at: now,
            last_activity_at: now,
            finished_at: None,
            summary: None,
            executions: HashMap::new(),
            seq: 0,
            subscribers: Subscribers::new(),
            recent: VecDeque::with_capacity(replay_window.min(64)),
            replay_window,
        }
    }

    fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    fn touch(&mut self) {
        self.last_activity_at = now_ms();
    }

    /// Assign the next sequence number and fan the envelope out.
    fn emit(
        &mut self,
        run_id: &str,
        req_exec_id: Option<&str>,
        session_id: Option<&str>,
        event: &FlowEvent,
    ) -> EventEnvelope {
        let seq = self.seq;
        self.seq += 1;

        if let Some(record) = req_exec_id.and_then(|id| self.executions.get_mut(id)) {
            record.apply_event(event);
        }

        let envelope = EventEnvelope {
            event_type: event.event_type().to_string(),
            ts: now_ms(),
            run_id: run_id.to_string(),
            session_id: session_id.map(str::to_string),
            flow_id: Some(self.id.clone()),
            req_exec_id: req_exec_id.map(str::to_string),
            seq,
            payload: event.payload(),
        };
        self.subscribers.broadcast(&envelope);
        if self.replay_window > 0 {
            if self.recent.len() == self.replay_window {
                self.recent.pop_front();
            }
            self.recent.push_back(envelope.clone());
        }
        self.touch();
        envelope
    }

    fn snapshot(&self) -> FlowSnapshot {
        let mut executions: Vec<ExecutionRecord> = self.executions.values().cloned().collect();
        executions.sort_by(|a, b| {
            a.timing
                .start_time
                .cmp(&b.timing.start_time)
                .then_with(|| a.req_exec_id.cmp(&b.req_exec_id))
        });
        FlowSnapshot {
            id: self.id.clone(),
            label: self.label.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            finished: self.finished(),
            finished_at: self.finished_at,
            summary: self.summary,
            seq: self.seq,
            subscriber_count: self.subscribers.len(),
            executions,
        }
    }

    fn expired(&self, now: u64, retention: &RetentionPolicy) -> bool {
        match self.finished_at {
            Some(finished_at) => {
                now.saturating_sub(finished_at) >= retention.finished_ttl.as_millis() as u64
            }
            None => {
                self.subscribers.is_empty()
                    && now.saturating_sub(self.last_activity_at)
                        >= retention.idle_ttl.as_millis() as u64
            }
        }
    }
}

/// Registry of all flows.
///
/// The flow map is private: every read and write goes through a method here,
/// and each method holds exactly one flow's lock for a short synchronous
/// section, so per-flow operations are atomic and never await while locked.
pub struct FlowManager {
    flows: DashMap<String, Arc<Mutex<Flow>>>,
    config: FlowManagerConfig,
}

impl FlowManager {
    pub fn new(config: FlowManagerConfig) -> Self {
        Self {
            flows: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &FlowManagerConfig {
        &self.config
    }

    pub fn create(&self, label: Option<String>) -> CreatedFlow {
        let flow_id = Uuid::new_v4().to_string();
        let flow = Flow::new(
            flow_id.clone(),
            label.clone(),
            now_ms(),
            self.config.replay_window,
        );
        self.flows
            .insert(flow_id.clone(), Arc::new(Mutex::new(flow)));
        tracing::info!(flow_id = %flow_id, label = ?label, "flow created");
        CreatedFlow { flow_id }
    }

    fn flow(&self, flow_id: &str) -> Result<Arc<Mutex<Flow>>, FlowError> {
        validate_id("flow id", flow_id)?;
        self.flows
            .get(flow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FlowError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    fn with_flow<R>(
        &self,
        flow_id: &str,
        f: impl FnOnce(&mut Flow) -> Result<R, FlowError>,
    ) -> Result<R, FlowError> {
        let flow = self.flow(flow_id)?;
        let mut guard = flow.lock().map_err(|_| FlowError::LockPoisoned {
            flow_id: flow_id.to_string(),
        })?;
        f(&mut guard)
    }

    pub fn contains(&self, flow_id: &str) -> bool {
        self.flows.contains_key(flow_id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, flow_id: &str) -> Option<FlowSnapshot> {
        self.with_flow(flow_id, |flow| Ok(flow.snapshot())).ok()
    }

    pub fn is_finished(&self, flow_id: &str) -> Result<bool, FlowError> {
        self.with_flow(flow_id, |flow| Ok(flow.finished()))
    }

    /// Mark the flow finished and summarize it. Repeated calls return the
    /// summary computed the first time.
    pub fn finish(&self, flow_id: &str) -> Result<FinishedFlow, FlowError> {
        let summary = self.with_flow(flow_id, |flow| {
            if let Some(summary) = flow.summary {
                return Ok(summary);
            }
            let summary = FlowSummary::compute(flow.created_at, flow.executions.values());
            flow.summary = Some(summary);
            flow.finished_at = Some(now_ms());
            let id = flow.id.clone();
            flow.emit(&id, None, None, &FlowEvent::FlowFinished { summary });
            tracing::info!(
                flow_id = %id,
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                duration_ms = summary.duration_ms,
                "flow finished"
            );
            Ok(summary)
        })?;
        Ok(FinishedFlow {
            flow_id: flow_id.to_string(),
            summary,
        })
    }

    /// Add a new record. Fails when the flow is finished or already holds
    /// an execution with the same `req_exec_id`; both checks and the insert
    /// happen under one lock.
    pub fn insert_execution(&self, flow_id: &str, record: ExecutionRecord) -> Result<(), FlowError> {
        validate_id("execution id", &record.req_exec_id)?;
        self.with_flow(flow_id, |flow| {
            if flow.finished() {
                return Err(FlowError::FlowFinished {
                    flow_id: flow.id.clone(),
                });
            }
            if flow.executions.contains_key(&record.req_exec_id) {
                return Err(FlowError::ExecutionExists {
                    flow_id: flow.id.clone(),
                    req_exec_id: record.req_exec_id,
                });
            }
            flow.executions.insert(record.req_exec_id.clone(), record);
            flow.touch();
            Ok(())
        })
    }

    /// Upsert a record by its `req_exec_id`. New records are refused once the
    /// flow is finished, and a terminal record is never replaced.
    pub fn store_execution(&self, flow_id: &str, record: ExecutionRecord) -> Result<(), FlowError> {
        validate_id("execution id", &record.req_exec_id)?;
        self.with_flow(flow_id, |flow| {
            match flow.executions.get(&record.req_exec_id) {
                Some(existing) if existing.status.is_terminal() => {
                    return Err(FlowError::ExecutionExists {
                        flow_id: flow.id.clone(),
                        req_exec_id: record.req_exec_id,
                    });
                }
                None if flow.finished() => {
                    return Err(FlowError::FlowFinished {
                        flow_id: flow.id.clone(),
                    });
                }
                _ => {}
            }
            flow.executions.insert(record.req_exec_id.clone(), record);
            flow.touch();
            Ok(())
        })
    }

    /// Mutate a stored record in place.
    pub fn update_execution<R>(
        &self,
        flow_id: &str,
        req_exec_id: &str,
        f: impl FnOnce(&mut ExecutionRecord) -> R,
    ) -> Result<R, FlowError> {
        validate_id("execution id", req_exec_id)?;
        self.with_flow(flow_id, |flow| {
            let record =
                flow.executions
                    .get_mut(req_exec_id)
                    .ok_or_else(|| FlowError::ExecutionNotFound {
                        flow_id: flow_id.to_string(),
                        req_exec_id: req_exec_id.to_string(),
                    })?;
            let result = f(record);
            flow.touch();
            Ok(result)
        })
    }

    pub fn get_execution(
        &self,
        flow_id: &str,
        req_exec_id: &str,
    ) -> Result<ExecutionRecord, FlowError> {
        validate_id("execution id", req_exec_id)?;
        self.with_flow(flow_id, |flow| {
            flow.executions
                .get(req_exec_id)
                .cloned()
                .ok_or_else(|| FlowError::ExecutionNotFound {
                    flow_id: flow_id.to_string(),
                    req_exec_id: req_exec_id.to_string(),
                })
        })
    }

    /// Sequence, persist and broadcast one event.
    ///
    /// The stored record named by `req_exec_id` picks up the event's fields
    /// whether or not anyone is subscribed, so polling reads stay correct.
    pub fn emit_event(
        &self,
        flow_id: &str,
        run_id: &str,
        req_exec_id: Option<&str>,
        session_id: Option<&str>,
        event: &FlowEvent,
    ) -> Result<EventEnvelope, FlowError> {
        self.with_flow(flow_id, |flow| {
            Ok(flow.emit(run_id, req_exec_id, session_id, event))
        })
    }

    pub fn subscribe(&self, flow_id: &str) -> Result<FlowSubscription, FlowError> {
        self.subscribe_after(flow_id, None)
    }

    /// Subscribe, resuming after `last_seq`: retained envelopes with a
    /// greater `seq` come back as the backlog. Envelopes older than the
    /// replay window are gone.
    pub fn subscribe_after(
        &self,
        flow_id: &str,
        last_seq: Option<u64>,
    ) -> Result<FlowSubscription, FlowError> {
        let capacity = self.config.subscriber_buffer;
        self.with_flow(flow_id, |flow| {
            let backlog: Vec<EventEnvelope> = match last_seq {
                Some(last) => flow
                    .recent
                    .iter()
                    .filter(|envelope| envelope.seq > last)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            let (id, receiver) = flow.subscribers.add(capacity, None);
            flow.touch();
            tracing::debug!(
                flow_id = %flow.id,
                subscriber = id,
                resumed_after = ?last_seq,
                replayed = backlog.len(),
                "subscriber added"
            );
            Ok(FlowSubscription {
                id,
                backlog,
                receiver,
            })
        })
    }

    pub fn unsubscribe(&self, flow_id: &str, id: SubscriberId) -> bool {
        self.with_flow(flow_id, |flow| Ok(flow.subscribers.remove(id)))
            .unwrap_or(false)
    }

    /// Close the flow's subscribers and forget it. Unknown ids are ignored.
    pub fn dispose(&self, flow_id: &str) -> bool {
        match self.flows.remove(flow_id) {
            Some((_, flow)) => {
                if let Ok(mut flow) = flow.lock() {
                    flow.subscribers.clear();
                }
                tracing::info!(flow_id = %flow_id, "flow disposed");
                true
            }
            None => false,
        }
    }

    /// Drop flows the retention policy no longer covers. Returns their ids.
    pub fn evict_expired(&self, now: u64) -> Vec<String> {
        let retention = self.config.retention;
        let expired: Vec<String> = self
            .flows
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .map(|flow| flow.expired(now, &retention))
                    .unwrap_or(true)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for flow_id in &expired {
            self.dispose(flow_id);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "evicted expired flows");
        }
        expired
    }

    /// Run `evict_expired` every `interval` until the handle is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.evict_expired(now_ms());
            }
        })
    }
}

impl Default for FlowManager {
    fn default() -> Self {
        Self::new(FlowManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::models::ExecutionStatus;

    fn manager() -> FlowManager {
        FlowManager::default()
    }

    #[test]
    fn test_create_starts_empty() {
        let mgr = manager();
        let CreatedFlow { flow_id } = mgr.create(Some("smoke".into()));
        let snap = mgr.get(&flow_id).unwrap();
        assert_eq!(snap.label.as_deref(), Some("smoke"));
        assert_eq!(snap.seq, 0);
        assert!(!snap.finished);
        assert!(snap.executions.is_empty());
        assert_eq!(snap.created_at, snap.last_activity_at);
    }

    #[test]
    fn test_get_unknown_flow_is_none() {
        assert!(manager().get("missing").is_none());
    }

    #[test]
    fn test_get_execution_errors() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;

        let err = mgr.get_execution(&flow_id, "req-1").unwrap_err();
        assert!(matches!(err, FlowError::ExecutionNotFound { .. }));

        let err = mgr.get_execution("nope", "req-1").unwrap_err();
        assert!(matches!(err, FlowError::FlowNotFound { .. }));

        let err = mgr.get_execution(&flow_id, "bad id").unwrap_err();
        assert!(matches!(err, FlowError::InvalidId { .. }));
    }

    #[test]
    fn test_insert_execution_refuses_duplicates() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let mut done = ExecutionRecord::pending(&flow_id, "req-1", 0);
        done.complete(5, None);
        mgr.insert_execution(&flow_id, done).unwrap();

        let err = mgr
            .insert_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-1", 10))
            .unwrap_err();
        assert!(matches!(err, FlowError::ExecutionExists { .. }));
        assert_eq!(
            mgr.get_execution(&flow_id, "req-1").unwrap().status,
            ExecutionStatus::Success
        );

        mgr.finish(&flow_id).unwrap();
        let err = mgr
            .insert_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-2", 10))
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowFinished { .. }));
    }

    #[test]
    fn test_store_execution_keeps_terminal_records() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let mut failed = ExecutionRecord::pending(&flow_id, "req-1", 0);
        failed.fail("script", "boom", 5);
        mgr.store_execution(&flow_id, failed).unwrap();

        let err = mgr
            .store_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-1", 10))
            .unwrap_err();
        assert!(matches!(err, FlowError::ExecutionExists { .. }));
        assert_eq!(
            mgr.get_execution(&flow_id, "req-1").unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn test_store_execution_upserts() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let mut record = ExecutionRecord::pending(&flow_id, "req-1", 10);
        mgr.store_execution(&flow_id, record.clone()).unwrap();

        record.method = Some("POST".into());
        mgr.store_execution(&flow_id, record).unwrap();

        let snap = mgr.get(&flow_id).unwrap();
        assert_eq!(snap.executions.len(), 1);
        assert_eq!(snap.executions[0].method.as_deref(), Some("POST"));
    }

    #[test]
    fn test_finished_flow_refuses_new_executions() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        mgr.store_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-1", 0))
            .unwrap();
        mgr.finish(&flow_id).unwrap();

        let err = mgr
            .store_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-2", 0))
            .unwrap_err();
        assert!(matches!(err, FlowError::FlowFinished { .. }));

        // Existing executions may still be updated.
        mgr.update_execution(&flow_id, "req-1", |r| r.complete(5, None))
            .unwrap();
        assert_eq!(
            mgr.get_execution(&flow_id, "req-1").unwrap().status,
            ExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let mut sub = mgr.subscribe(&flow_id).unwrap();

        let mut ok = ExecutionRecord::pending(&flow_id, "req-1", 0);
        ok.complete(now_ms(), None);
        mgr.store_execution(&flow_id, ok).unwrap();

        let first = mgr.finish(&flow_id).unwrap();
        let second = mgr.finish(&flow_id).unwrap();
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.summary.total, 1);
        assert_eq!(first.summary.succeeded, 1);

        let envelope = sub.receiver.recv().await.unwrap();
        assert_eq!(envelope.event_type, "flowFinished");
        assert_eq!(envelope.payload["summary"]["total"], 1);
        assert!(sub.receiver.try_recv().is_err(), "only one flowFinished");
        assert!(mgr.is_finished(&flow_id).unwrap());
    }

    #[tokio::test]
    async fn test_emit_assigns_increasing_seq_and_persists() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        mgr.store_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-1", 0))
            .unwrap();
        let mut sub = mgr.subscribe(&flow_id).unwrap();

        let first = mgr
            .emit_event(&flow_id, "run-1", Some("req-1"), Some("s1"), &FlowEvent::CompileStarted)
            .unwrap();
        let second = mgr
            .emit_event(
                &flow_id,
                "run-1",
                Some("req-1"),
                Some("s1"),
                &FlowEvent::FetchStarted {
                    url: "https://api.example.com".into(),
                    method: "GET".into(),
                },
            )
            .unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.flow_id.as_deref(), Some(flow_id.as_str()));
        assert_eq!(second.session_id.as_deref(), Some("s1"));

        assert_eq!(sub.receiver.recv().await.unwrap().seq, 0);
        assert_eq!(sub.receiver.recv().await.unwrap().seq, 1);

        let record = mgr.get_execution(&flow_id, "req-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.url_resolved.as_deref(), Some("https://api.example.com"));
    }

    #[test]
    fn test_emit_persists_without_subscribers() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        mgr.store_execution(&flow_id, ExecutionRecord::pending(&flow_id, "req-1", 0))
            .unwrap();
        mgr.emit_event(
            &flow_id,
            "run-1",
            Some("req-1"),
            None,
            &FlowEvent::FetchFinished {
                ttfb: Some(12.5),
                status: 200,
            },
        )
        .unwrap();
        let record = mgr.get_execution(&flow_id, "req-1").unwrap();
        assert_eq!(record.timing.ttfb, Some(12.5));
    }

    #[test]
    fn test_emit_unknown_flow_fails() {
        let err = manager()
            .emit_event("ghost", "run-1", None, None, &FlowEvent::CompileStarted)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_emitters_keep_seq_order() {
        let mgr = Arc::new(manager());
        let flow_id = mgr.create(None).flow_id;
        let mut sub = mgr.subscribe(&flow_id).unwrap();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let mgr = Arc::clone(&mgr);
            let flow_id = flow_id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    mgr.emit_event(
                        &flow_id,
                        &format!("run-{worker}"),
                        None,
                        None,
                        &FlowEvent::CompileStarted,
                    )
                    .unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = None;
        for _ in 0..100 {
            let envelope = sub.receiver.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(envelope.seq > prev);
            }
            last = Some(envelope.seq);
        }
        assert_eq!(last, Some(99));
    }

    #[tokio::test]
    async fn test_dispose_closes_subscribers() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let mut sub = mgr.subscribe(&flow_id).unwrap();
        assert!(mgr.dispose(&flow_id));
        assert!(sub.receiver.recv().await.is_none());
        assert!(mgr.get(&flow_id).is_none());
        assert!(!mgr.dispose(&flow_id), "second dispose is a no-op");
    }

    #[test]
    fn test_subscribe_after_replays_retained_envelopes() {
        let mgr = FlowManager::new(FlowManagerConfig {
            replay_window: 3,
            ..FlowManagerConfig::default()
        });
        let flow_id = mgr.create(None).flow_id;
        for _ in 0..5 {
            mgr.emit_event(&flow_id, "run-1", None, None, &FlowEvent::CompileStarted)
                .unwrap();
        }

        let fresh = mgr.subscribe(&flow_id).unwrap();
        assert!(fresh.backlog.is_empty());

        let resumed = mgr.subscribe_after(&flow_id, Some(2)).unwrap();
        let seqs: Vec<u64> = resumed.backlog.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);

        // Only the last three envelopes are retained.
        let behind = mgr.subscribe_after(&flow_id, Some(0)).unwrap();
        let seqs: Vec<u64> = behind.backlog.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let current = mgr.subscribe_after(&flow_id, Some(4)).unwrap();
        assert!(current.backlog.is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let mgr = manager();
        let flow_id = mgr.create(None).flow_id;
        let sub = mgr.subscribe(&flow_id).unwrap();
        assert_eq!(mgr.get(&flow_id).unwrap().subscriber_count, 1);
        assert!(mgr.unsubscribe(&flow_id, sub.id));
        assert_eq!(mgr.get(&flow_id).unwrap().subscriber_count, 0);
    }

    #[test]
    fn test_retention_evicts_finished_and_idle_flows() {
        let mgr = FlowManager::new(FlowManagerConfig {
            retention: RetentionPolicy {
                finished_ttl: Duration::from_secs(60),
                idle_ttl: Duration::from_secs(600),
            },
            subscriber_buffer: 8,
            replay_window: 0,
        });
        let finished = mgr.create(None).flow_id;
        let idle = mgr.create(None).flow_id;
        let watched = mgr.create(None).flow_id;
        let _sub = mgr.subscribe(&watched).unwrap();
        mgr.finish(&finished).unwrap();

        let now = now_ms();
        assert!(mgr.evict_expired(now).is_empty());

        let evicted = mgr.evict_expired(now + 61_000);
        assert_eq!(evicted, vec![finished.clone()]);
        assert!(mgr.get(&finished).is_none());

        let evicted = mgr.evict_expired(now + 601_000);
        assert_eq!(evicted, vec![idle.clone()]);
        assert!(mgr.get(&watched).is_some(), "flows with subscribers are kept");
    }
}
