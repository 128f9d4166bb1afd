//! Flow tracking and event distribution.
//!
//! Writes go one way: engine events enter a [`FlowTracker`], which persists
//! them through the [`FlowManager`], which sequences each event and fans it
//! out to the flow's subscribers.

pub mod events;
pub mod fanout;
pub mod manager;
pub mod models;
pub mod tracker;

pub use events::{FlowEvent, OutputStream};
pub use fanout::{EventHub, SubscriberId};
pub use manager::{
    CreatedFlow, FinishedFlow, FlowManager, FlowManagerConfig, FlowSubscription, RetentionPolicy,
};
pub use models::{
    EventEnvelope, ExecutionRecord, ExecutionSource, ExecutionStatus, FlowSnapshot, FlowSummary,
    ResponseSummary, now_ms,
};
pub use tracker::{
    EventHandler, ExecutionContext, FinalizeExecution, FlowBinding, FlowTracker, NoopContext,
    PendingExecution, TrackerState,
};
