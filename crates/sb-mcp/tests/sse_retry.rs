//! 401 handling on the SSE transport: one refresh, one retry

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use sb_mcp::protocol::JsonRpcRequest;
use sb_mcp::transport::SseTransport;
use sb_oauth::HeaderSource;
use sb_types::{BrokerError, BrokerResult, OAuthTokenErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Header source that hands out a fixed fresh token
struct FakeRefresher {
    refreshes: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl HeaderSource for FakeRefresher {
    async fn headers_for(&self, _server_id: &str) -> BrokerResult<Vec<(String, String)>> {
        Ok(vec![])
    }

    async fn refresh_after_unauthorized(&self, _server_id: &str) -> BrokerResult<Option<String>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BrokerError::OAuthToken {
                kind: OAuthTokenErrorKind::RefreshFailed,
                message: "refresh failed after 3 attempts".to_string(),
            });
        }
        Ok(Some("fresh-token".to_string()))
    }
}

struct Upstream {
    /// Pushes SSE event text to the connected stream
    events: mpsc::UnboundedSender<String>,
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    post_count: AtomicUsize,
    seen_auth: Mutex<Vec<String>>,
}

async fn sse_handler(State(upstream): State<Arc<Upstream>>) -> Response {
    let rx = upstream.stream_rx.lock().take().expect("single SSE client");
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, std::convert::Infallible>(Bytes::from(event)), rx))
    });

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn message_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    upstream.seen_auth.lock().push(auth.clone());
    upstream.post_count.fetch_add(1, Ordering::SeqCst);

    if auth != "Bearer fresh-token" {
        return StatusCode::UNAUTHORIZED;
    }

    // Answer the request over the event stream
    let request: JsonRpcRequest = serde_json::from_str(&body).unwrap();
    let id = request.id.unwrap();
    let response = format!(
        "event: message\ndata: {{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":{{\"ok\":true}}}}\n\n",
        id
    );
    upstream.events.send(response).unwrap();
    StatusCode::ACCEPTED
}

async fn spawn_upstream() -> (Arc<Upstream>, String) {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    // The endpoint announcement is the first thing on the stream
    tx.send("event: endpoint\ndata: /messages\n\n".to_string())
        .unwrap();

    let upstream = Arc::new(Upstream {
        events: tx,
        stream_rx: Mutex::new(Some(rx)),
        post_count: AtomicUsize::new(0),
        seen_auth: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(message_handler))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (upstream, format!("http://{}/sse", addr))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthorized_post_refreshes_once_and_retries() {
    let (upstream, url) = spawn_upstream().await;
    let refresher = Arc::new(FakeRefresher {
        refreshes: AtomicUsize::new(0),
        fail: false,
    });

    let transport = SseTransport::connect(
        &url,
        vec![("Authorization".to_string(), "Bearer stale-token".to_string())],
        Some((refresher.clone() as Arc<dyn HeaderSource>, "srv-1".to_string())),
    )
    .await
    .unwrap();

    let response = transport
        .send_request(JsonRpcRequest::new(None, "tools/list".to_string(), None))
        .await
        .unwrap();
    assert!(response.error.is_none());

    // Exactly one refresh; the retried request used the new header
    assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.post_count.load(Ordering::SeqCst), 2);
    let seen = upstream.seen_auth.lock();
    assert_eq!(seen[0], "Bearer stale-token");
    assert_eq!(seen[1], "Bearer fresh-token");

    transport.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_refresh_surfaces_token_error() {
    let (upstream, url) = spawn_upstream().await;
    let refresher = Arc::new(FakeRefresher {
        refreshes: AtomicUsize::new(0),
        fail: true,
    });

    let transport = SseTransport::connect(
        &url,
        vec![("Authorization".to_string(), "Bearer stale-token".to_string())],
        Some((refresher.clone() as Arc<dyn HeaderSource>, "srv-1".to_string())),
    )
    .await
    .unwrap();

    let err = transport
        .send_request(JsonRpcRequest::new(None, "tools/list".to_string(), None))
        .await
        .unwrap_err();
    match err {
        BrokerError::OAuthToken { kind, .. } => {
            assert_eq!(kind, OAuthTokenErrorKind::RefreshFailed)
        }
        other => panic!("expected OAuthToken error, got {other}"),
    }

    assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.post_count.load(Ordering::SeqCst), 1);

    transport.close().await.unwrap();
}
