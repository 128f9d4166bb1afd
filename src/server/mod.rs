//! HTTP control API and SSE event stream.

pub mod api;
#[allow(clippy::module_inception)]
pub mod server;
pub mod sse;

pub use api::{AppState, HubContext, SharedState, StartedRun};
pub use server::{ServerConfig, app_state, build_router, serve, start_server};
