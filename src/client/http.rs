use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;
use crate::flow::EventEnvelope;
use crate::runner::{RunKind, RunnerOption};
use crate::server::api::{CancelResult, RunnerList};

use super::sse::SseDecoder;
use super::{RunnerApi, StartedRun, StreamMessage, Subscription};

const HEALTH_PATH: &str = "/health";
const HEALTH_RETRIES: usize = 30;
const HEALTH_BASE_BACKOFF_MS: u64 = 100;
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_BUFFER: usize = 256;

/// [`RunnerApi`] over the treq HTTP API.
#[derive(Clone)]
pub struct HttpRunnerApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
    connected: Arc<AtomicBool>,
}

impl HttpRunnerApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            // Local servers must not be routed through an HTTP proxy.
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a client and wait for the server to answer its health check.
    pub async fn connect(base_url: impl Into<String>, token: Option<String>) -> Result<Self, ClientError> {
        let api = Self::new(base_url, token);
        api.check_health().await?;
        Ok(api)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Poll `/health` with linear backoff until it answers 2xx.
    pub async fn check_health(&self) -> Result<(), ClientError> {
        let url = self.url(HEALTH_PATH);
        let mut last_error = "health check failed".to_string();

        for attempt in 0..HEALTH_RETRIES {
            let request = self.authorize(self.client.get(&url).timeout(HEALTH_REQUEST_TIMEOUT));
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    self.connected.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!(
                        "health check returned unexpected status {} at {}",
                        response.status(),
                        url
                    );
                }
                Err(e) => {
                    last_error = format!("health check request failed at {url}: {e}");
                }
            }
            tracing::debug!(attempt, error = %last_error, "server not ready");

            if attempt + 1 < HEALTH_RETRIES {
                let delay_ms = HEALTH_BASE_BACKOFF_MS * (attempt as u64 + 1);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Err(ClientError::Transport(last_error))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.authorize(
            self.client
                .request(method, self.url(path))
                .timeout(REQUEST_TIMEOUT),
        )
    }

    /// Send, marking the client disconnected when the server is unreachable.
    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                self.connected.store(false, Ordering::SeqCst);
            }
            ClientError::Transport(e.to_string())
        })?;
        check_status(response).await
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Open `/event` for the flow, resuming after `last_seq` when set.
    async fn open_stream(&self, flow_id: &str, last_seq: Option<u64>) -> Result<Response, ClientError> {
        let mut request = self
            .client
            .get(self.url("/event"))
            .query(&[("flowId", flow_id)])
            .header("accept", "text/event-stream");
        if let Some(seq) = last_seq {
            request = request.header("last-event-id", seq.to_string());
        }
        self.send(self.authorize(request)).await
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(ClientError::Http {
        status: status.as_u16(),
        message,
    })
}

enum StreamEnd {
    Aborted,
    ReceiverGone,
    Broke(String),
}

/// Forward one response body into `tx`, skipping envelopes at or below
/// `last_seq`.
async fn pump_body(
    response: Response,
    tx: &mpsc::Sender<StreamMessage>,
    abort: &CancellationToken,
    last_seq: &mut Option<u64>,
) -> StreamEnd {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            _ = abort.cancelled() => return StreamEnd::Aborted,
            chunk = body.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return StreamEnd::Broke(e.to_string()),
            None => return StreamEnd::Broke("event stream ended".to_string()),
        };
        for frame in decoder.push(&bytes) {
            let envelope: EventEnvelope = match serde_json::from_str(&frame.data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping undecodable frame");
                    continue;
                }
            };
            if !envelope.is_transport_frame() {
                if last_seq.is_some_and(|last| envelope.seq <= last) {
                    continue;
                }
                *last_seq = Some(envelope.seq);
            }
            if tx.send(StreamMessage::Event(envelope)).await.is_err() {
                return StreamEnd::ReceiverGone;
            }
        }
    }
}

#[async_trait]
impl RunnerApi for HttpRunnerApi {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn detect_runners(
        &self,
        kind: RunKind,
        file_path: &str,
    ) -> Result<Vec<RunnerOption>, ClientError> {
        let path = format!("/{}/{}", kind.as_str(), kind.runners_segment());
        let request = self
            .request(Method::GET, &path)
            .query(&[("filePath", file_path)]);
        let list: RunnerList = self.json(request).await?;
        Ok(list.options)
    }

    async fn create_flow(&self, label: Option<String>) -> Result<String, ClientError> {
        let request = self
            .request(Method::POST, "/flows")
            .json(&serde_json::json!({ "label": label }));
        let created: serde_json::Value = self.json(request).await?;
        created["flowId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("response has no flowId".to_string()))
    }

    /// Open the flow's event stream. The stream is reopened once, silently,
    /// if it drops, resuming after the last `seq` seen; a second drop is
    /// reported as [`StreamMessage::Broken`].
    async fn subscribe(&self, flow_id: &str) -> Result<Subscription, ClientError> {
        let first = self.open_stream(flow_id, None).await?;
        let (tx, events) = mpsc::channel(STREAM_BUFFER);
        let abort = CancellationToken::new();

        let api = self.clone();
        let flow_id = flow_id.to_string();
        let token = abort.clone();
        tokio::spawn(async move {
            let mut last_seq = None;
            let mut response = Some(first);
            let mut reconnected = false;
            loop {
                let current = match response.take() {
                    Some(current) => current,
                    None => match api.open_stream(&flow_id, last_seq).await {
                        Ok(current) => current,
                        Err(e) => {
                            let _ = tx.send(StreamMessage::Broken(e.to_string())).await;
                            return;
                        }
                    },
                };
                let reason = match pump_body(current, &tx, &token, &mut last_seq).await {
                    StreamEnd::Aborted | StreamEnd::ReceiverGone => return,
                    StreamEnd::Broke(reason) => reason,
                };
                if reconnected || token.is_cancelled() {
                    let _ = tx.send(StreamMessage::Broken(reason)).await;
                    return;
                }
                tracing::debug!(flow_id = %flow_id, reason = %reason, "event stream dropped, reconnecting");
                reconnected = true;
            }
        });

        Ok(Subscription { events, abort })
    }

    async fn start(
        &self,
        kind: RunKind,
        file_path: &str,
        runner_id: Option<&str>,
        flow_id: &str,
    ) -> Result<StartedRun, ClientError> {
        let request = self
            .request(Method::POST, &format!("/{}", kind.as_str()))
            .json(&serde_json::json!({
                "filePath": file_path,
                "runnerId": runner_id,
                "flowId": flow_id,
            }));
        self.json(request).await
    }

    async fn cancel(&self, kind: RunKind, run_id: &str) -> Result<(), ClientError> {
        let request = self.request(Method::DELETE, &format!("/{}/{}", kind.as_str(), run_id));
        let result: CancelResult = self.json(request).await?;
        if !result.cancelled {
            tracing::debug!(run_id, "run had already finished");
        }
        Ok(())
    }
}
