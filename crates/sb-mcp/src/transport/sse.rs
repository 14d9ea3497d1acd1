//! SSE transport
//!
//! Connects with a GET event stream, learns the message-POST endpoint from
//! the server's `endpoint` event, and correlates `message` events back to
//! pending requests. Outbound POSTs carry the injected headers; a 401
//! triggers one token refresh and a single retry.

use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use futures_util::StreamExt;
use parking_lot::RwLock;
use sb_oauth::HeaderSource;
use sb_types::{BrokerError, BrokerResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type PendingMap = Arc<RwLock<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Hook consulted once after an outbound 401
pub(crate) struct UnauthorizedHook {
    pub source: Arc<dyn HeaderSource>,
    pub server_id: String,
}

pub struct SseTransport {
    http: reqwest::Client,

    /// POST endpoint announced by the server
    message_endpoint: Arc<RwLock<Option<String>>>,

    headers: Arc<RwLock<Vec<(String, String)>>>,

    pending: PendingMap,

    next_id: Arc<RwLock<u64>>,

    connected: Arc<RwLock<bool>>,

    unauthorized_hook: Option<UnauthorizedHook>,

    reader_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the endpoint announcement
    pub async fn connect(
        url: &str,
        headers: Vec<(String, String)>,
        oauth: Option<(Arc<dyn HeaderSource>, String)>,
    ) -> BrokerResult<Self> {
        info!("connecting SSE transport to {}", url);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        let mut request = http.get(url).header("Accept", "text/event-stream");
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        // The stream itself must not be cut off by the request timeout
        let request = request.timeout(std::time::Duration::from_secs(24 * 3600));

        let response = tokio::time::timeout(CONNECT_TIMEOUT, request.send())
            .await
            .map_err(|_| BrokerError::Upstream("SSE connect timed out".to_string()))?
            .map_err(|e| BrokerError::Upstream(format!("SSE connect failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BrokerError::Upstream(format!(
                "SSE connect failed with status {}",
                response.status()
            )));
        }

        let base_url = url.to_string();
        let message_endpoint: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let connected = Arc::new(RwLock::new(true));

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let reader_task = Self::start_event_reader(
            response,
            base_url,
            message_endpoint.clone(),
            pending.clone(),
            connected.clone(),
            endpoint_tx,
        );

        // The server announces where to POST before anything else
        tokio::time::timeout(CONNECT_TIMEOUT, endpoint_rx)
            .await
            .map_err(|_| BrokerError::Upstream("timed out waiting for SSE endpoint event".to_string()))?
            .map_err(|_| BrokerError::Upstream("SSE stream closed before endpoint event".to_string()))?;

        Ok(Self {
            http,
            message_endpoint,
            headers: Arc::new(RwLock::new(headers)),
            pending,
            next_id: Arc::new(RwLock::new(1)),
            connected,
            unauthorized_hook: oauth.map(|(source, server_id)| UnauthorizedHook {
                source,
                server_id,
            }),
            reader_task: Arc::new(RwLock::new(Some(reader_task))),
        })
    }

    fn start_event_reader(
        response: reqwest::Response,
        base_url: String,
        message_endpoint: Arc<RwLock<Option<String>>>,
        pending: PendingMap,
        connected: Arc<RwLock<bool>>,
        endpoint_tx: oneshot::Sender<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("SSE stream error: {}", e);
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Events are separated by a blank line
                while let Some(split) = buffer.find("\n\n") {
                    let event_text = buffer[..split].to_string();
                    buffer.drain(..split + 2);

                    let mut event_name = "message".to_string();
                    let mut data = String::new();
                    for line in event_text.lines() {
                        if let Some(rest) = line.strip_prefix("event:") {
                            event_name = rest.trim().to_string();
                        } else if let Some(rest) = line.strip_prefix("data:") {
                            if !data.is_empty() {
                                data.push('\n');
                            }
                            data.push_str(rest.trim_start());
                        }
                    }

                    match event_name.as_str() {
                        "endpoint" => {
                            let endpoint = resolve_endpoint(&base_url, data.trim());
                            debug!("SSE message endpoint: {}", endpoint);
                            *message_endpoint.write() = Some(endpoint.clone());
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(endpoint);
                            }
                        }
                        "message" => match serde_json::from_str::<JsonRpcMessage>(data.trim()) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                let id = response.id.to_string();
                                if let Some(sender) = pending.write().remove(&id) {
                                    let _ = sender.send(response);
                                } else {
                                    warn!("SSE response for unknown request id {}", id);
                                }
                            }
                            Ok(JsonRpcMessage::Notification(notification)) => {
                                debug!("SSE notification: {}", notification.method);
                            }
                            Ok(JsonRpcMessage::Request(_)) => {
                                warn!("ignoring server-initiated request over SSE");
                            }
                            Err(e) => warn!("unparseable SSE message: {}", e),
                        },
                        other => debug!("ignoring SSE event '{}'", other),
                    }
                }
            }

            *connected.write() = false;
            for (id, _) in pending.write().drain() {
                warn!("request {} terminated with the SSE stream", id);
            }
        })
    }

    pub fn is_healthy(&self) -> bool {
        *self.connected.read()
    }

    pub async fn send_request(&self, mut request: JsonRpcRequest) -> BrokerResult<JsonRpcResponse> {
        if !self.is_healthy() {
            return Err(BrokerError::ServerNotRunning("SSE stream closed".to_string()));
        }

        let request_id = {
            let mut next_id = self.next_id.write();
            let id = *next_id;
            *next_id += 1;
            request.id = Some(Value::Number(id.into()));
            id.to_string()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(request_id.clone(), tx);

        if let Err(e) = self.post_json(&request).await {
            self.pending.write().remove(&request_id);
            return Err(e);
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.write().remove(&request_id);
                BrokerError::Upstream(format!("request timeout for id {}", request_id))
            })?
            .map_err(|_| {
                BrokerError::Upstream(format!("response channel closed for id {}", request_id))
            })?;

        Ok(response)
    }

    pub async fn send_notification(&self, notification: JsonRpcNotification) -> BrokerResult<()> {
        self.post_json(&notification).await
    }

    /// POST a JSON-RPC payload; on 401, refresh the token once and retry
    async fn post_json<T: serde::Serialize>(&self, payload: &T) -> BrokerResult<()> {
        let endpoint = self
            .message_endpoint
            .read()
            .clone()
            .ok_or_else(|| BrokerError::Upstream("no SSE message endpoint".to_string()))?;

        let response = self.post_once(&endpoint, payload).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return check_post_status(response).await;
        }

        let Some(hook) = &self.unauthorized_hook else {
            return Err(BrokerError::Upstream("upstream returned 401".to_string()));
        };

        debug!("401 from upstream, attempting one token refresh");
        let refreshed = hook
            .source
            .refresh_after_unauthorized(&hook.server_id)
            .await?;
        let Some(token) = refreshed else {
            return Err(BrokerError::Upstream("upstream returned 401".to_string()));
        };

        {
            let mut headers = self.headers.write();
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        let response = self.post_once(&endpoint, payload).await?;
        check_post_status(response).await
    }

    async fn post_once<T: serde::Serialize>(
        &self,
        endpoint: &str,
        payload: &T,
    ) -> BrokerResult<reqwest::Response> {
        let mut request = self.http.post(endpoint).json(payload);
        for (name, value) in self.headers.read().iter() {
            request = request.header(name.as_str(), value.as_str());
        }
        request
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("POST to SSE endpoint failed: {}", e)))
    }

    pub async fn close(&self) -> BrokerResult<()> {
        *self.connected.write() = false;
        if let Some(task) = self.reader_task.write().take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        // The reader task owns the HTTP stream; a dropped transport must not
        // keep it alive.
        if let Some(task) = self.reader_task.write().take() {
            task.abort();
        }
    }
}

async fn check_post_status(response: reqwest::Response) -> BrokerResult<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Upstream(format!(
        "SSE endpoint returned {}: {}",
        status, body
    )))
}

/// Resolve the endpoint event's value against the SSE URL's origin
fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }

    // Keep scheme://host[:port], replace the path
    let origin_end = base_url
        .find("://")
        .map(|i| i + 3)
        .and_then(|start| base_url[start..].find('/').map(|i| start + i))
        .unwrap_or(base_url.len());
    format!("{}{}", &base_url[..origin_end], endpoint)
}
