use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::flow::{EventHub, FlowManager, FlowManagerConfig};
use crate::runner::ExecutionBackend;

use super::api::{self, AppState, SharedState};
use super::sse::DEFAULT_HEARTBEAT;

/// Configuration for the treq server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub heartbeat: Duration,
    pub sweep_interval: Duration,
    pub flows: FlowManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4097,
            dev_mode: false,
            heartbeat: DEFAULT_HEARTBEAT,
            sweep_interval: Duration::from_secs(30),
            flows: FlowManagerConfig::default(),
        }
    }
}

/// Fresh registry, session hub and `backend` wired into one state.
pub fn app_state(config: &ServerConfig, backend: Arc<dyn ExecutionBackend>) -> SharedState {
    Arc::new(AppState::new(
        Arc::new(FlowManager::new(config.flows)),
        Arc::new(EventHub::new(config.flows.subscriber_buffer)),
        backend,
        config.heartbeat,
    ))
}

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let reaper = state.flows.spawn_reaper(config.sweep_interval);
    let app = build_router(Arc::clone(&state), config.dev_mode);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    reaper.abort();
    state.backend.shutdown().await;
    served
}

/// Bind and run the server until Ctrl+C.
pub async fn start_server(config: ServerConfig, backend: Arc<dyn ExecutionBackend>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, dev_mode = config.dev_mode, "treq server listening");
    println!("treq server running at http://{}", local_addr);

    let state = app_state(&config, backend);
    serve(listener, state, &config, shutdown_signal()).await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let config = ServerConfig::default();
        let state = app_state(&config, Arc::new(ProcessBackend::default()));
        let app = build_router(state, true);

        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig::default();
        let state = app_state(&config, Arc::new(ProcessBackend::default()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            serve(listener, state, &config, async {
                let _ = rx.await;
            })
            .await
        });
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
