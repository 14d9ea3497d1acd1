//! End-to-end OAuth behavior against in-process fake providers

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use sb_config::ServerConfig;
use sb_crypto::CryptoService;
use sb_oauth::{
    AuditLog, Browser, ConfigOverrides, HeaderSource, OAuthService, RateLimiter, RecordingBrowser,
};
use sb_store::{OAuthTokenRow, Store};
use sb_types::{BrokerError, OAuthTokenErrorKind};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    service: OAuthService,
    store: Store,
    server_id: String,
    browser: Arc<RecordingBrowser>,
    _dir: tempfile::TempDir,
}

fn fixture(callback_port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let crypto = Arc::new(
        CryptoService::load_or_create(
            &dir.path().join(".oauth-key"),
            &dir.path().join("oauth-keys.json"),
        )
        .unwrap(),
    );
    let store = Store::open_in_memory(crypto.clone()).unwrap();
    let audit = Arc::new(AuditLog::new(store.clone(), &dir.path().join("oauth-audit.log")).unwrap());
    let browser = Arc::new(RecordingBrowser::default());

    let service = OAuthService::with_browser(
        store.clone(),
        crypto,
        audit,
        Arc::new(RateLimiter::new()),
        browser.clone() as Arc<dyn Browser>,
        callback_port,
    );

    let server = ServerConfig::remote("upstream", "https://mcp.example.com");
    store.insert_server(&server).unwrap();

    Fixture {
        service,
        store,
        server_id: server.id,
        browser,
        _dir: dir,
    }
}

/// Fake token endpoint counting exchanges; returns rotating tokens
async fn spawn_token_endpoint(counter: Arc<AtomicUsize>, delay: Duration) -> String {
    let app = Router::new().route(
        "/token",
        post(move |State(counter): State<Arc<AtomicUsize>>| async move {
            tokio::time::sleep(delay).await;
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "access_token": format!("access-{n}"),
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": format!("refresh-{n}"),
            }))
        })
        .with_state(counter),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/token", addr)
}

fn seed_token(fixture: &Fixture, expires_in_ms: i64, refresh_token: Option<&str>) {
    fixture
        .store
        .upsert_oauth_token(&OAuthTokenRow {
            server_id: fixture.server_id.clone(),
            access_token: "stale-access".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_at: Some(Utc::now().timestamp_millis() + expires_in_ms),
            scopes: None,
            refresh_count: 0,
            last_used: 0,
        })
        .unwrap();
}

async fn configure_custom(fixture: &Fixture, token_endpoint: &str) {
    fixture
        .service
        .configure(
            &fixture.server_id,
            "custom",
            ConfigOverrides {
                client_id: Some("client-1".to_string()),
                auth_endpoint: Some("https://idp.example.com/authorize".to_string()),
                token_endpoint: Some(token_endpoint.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_coalesce_to_one_exchange() {
    let fixture = fixture(43311);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter.clone(), Duration::from_millis(200)).await;

    configure_custom(&fixture, &token_endpoint).await;
    // Expires in 30 s, well inside the 5-minute refresh window
    seed_token(&fixture, 30_000, Some("refresh-seed"));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let service = fixture.service.clone();
        let server_id = fixture.server_id.clone();
        handles.push(tokio::spawn(async move {
            service.get_access_token(&server_id).await.unwrap().unwrap()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1, "expected one exchange");
    assert!(results.iter().all(|token| token == &results[0]));
    assert_eq!(results[0], "access-1");

    let row = fixture.store.get_oauth_token(&fixture.server_id).unwrap().unwrap();
    assert_eq!(row.refresh_count, 1);

    fixture.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_without_expiry_never_refreshes() {
    let fixture = fixture(43312);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter.clone(), Duration::ZERO).await;

    configure_custom(&fixture, &token_endpoint).await;
    fixture
        .store
        .upsert_oauth_token(&OAuthTokenRow {
            server_id: fixture.server_id.clone(),
            access_token: "forever".to_string(),
            refresh_token: Some("unused".to_string()),
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scopes: None,
            refresh_count: 0,
            last_used: 0,
        })
        .unwrap();

    let token = fixture
        .service
        .get_access_token(&fixture.server_id)
        .await
        .unwrap();
    assert_eq!(token.as_deref(), Some("forever"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_grant_deletes_the_token_row() {
    let fixture = fixture(43313);

    let app = Router::new().route(
        "/token",
        post(|| async {
            (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_grant" })),
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    configure_custom(&fixture, &format!("http://{}/token", addr)).await;
    seed_token(&fixture, 10_000, Some("revoked-upstream"));

    let err = fixture.service.refresh(&fixture.server_id).await.unwrap_err();
    match err {
        BrokerError::OAuthToken { kind, .. } => {
            assert_eq!(kind, OAuthTokenErrorKind::InvalidGrant)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.store.get_oauth_token(&fixture.server_id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn browser_flow_stores_a_token() {
    let fixture = fixture(43314);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter.clone(), Duration::ZERO).await;
    configure_custom(&fixture, &token_endpoint).await;

    let service = fixture.service.clone();
    let server_id = fixture.server_id.clone();
    let flow = tokio::spawn(async move { service.authenticate(&server_id, None).await });

    // Wait for the browser to be "opened", then play the provider redirect
    let auth_url = {
        let mut url = None;
        for _ in 0..100 {
            if let Some(u) = fixture.browser.opened.lock().first().cloned() {
                url = Some(u);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        url.expect("browser was never opened")
    };

    assert!(auth_url.contains("code_challenge="));
    let state = auth_url
        .split("state=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .to_string();

    // Auth state row exists while the flow is in flight
    assert_eq!(fixture.store.count_auth_states().unwrap(), 1);

    let callback = format!(
        "http://127.0.0.1:43314/oauth/callback?code=auth-code-1&state={}",
        state
    );
    let response = reqwest::get(&callback).await.unwrap();
    assert!(response.status().is_success());

    flow.await.unwrap().unwrap();

    let row = fixture.store.get_oauth_token(&fixture.server_id).unwrap().unwrap();
    assert_eq!(row.access_token, "access-1");
    assert!(row.expires_at.is_some());
    // The auth-state row is one-shot
    assert_eq!(fixture.store.count_auth_states().unwrap(), 0);

    fixture.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bound_callback_port_fails_the_flow() {
    let fixture = fixture(43315);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter, Duration::ZERO).await;
    configure_custom(&fixture, &token_endpoint).await;

    // Occupy the callback port first
    let _blocker = tokio::net::TcpListener::bind("127.0.0.1:43315").await.unwrap();

    let err = fixture
        .service
        .authenticate(&fixture.server_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::OAuthFlow { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_falls_through_invalid_json() {
    let fixture = fixture(43316);

    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                // 200 with a body that is not metadata
                "this is not json"
            }),
        )
        .route(
            "/.well-known/openid-configuration",
            get(|| async {
                Json(json!({
                    "issuer": "http://idp.test",
                    "authorization_endpoint": "http://idp.test/authorize",
                    "token_endpoint": "http://idp.test/token",
                }))
            }),
        )
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{}", addr);
    let document = fixture.service.discover(&base).await.unwrap();
    assert_eq!(
        document.token_endpoint.as_deref(),
        Some("http://idp.test/token")
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Second call is served from the 24 h cache
    fixture.service.discover(&base).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn headers_for_injects_bearer() {
    let fixture = fixture(43317);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter, Duration::ZERO).await;
    configure_custom(&fixture, &token_endpoint).await;

    // No token yet: nothing to inject
    let headers = fixture.service.headers_for(&fixture.server_id).await.unwrap();
    assert!(headers.is_empty());

    seed_token(&fixture, 3_600_000, None);
    let headers = fixture.service.headers_for(&fixture.server_id).await.unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].0, "Authorization");
    assert_eq!(headers[0].1, "Bearer stale-access");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoke_deletes_row_and_survives_missing_endpoint() {
    let fixture = fixture(43318);
    let counter = Arc::new(AtomicUsize::new(0));
    let token_endpoint = spawn_token_endpoint(counter, Duration::ZERO).await;
    configure_custom(&fixture, &token_endpoint).await;
    seed_token(&fixture, 3_600_000, Some("r"));

    fixture.service.revoke(&fixture.server_id).await.unwrap();
    assert!(fixture.store.get_oauth_token(&fixture.server_id).unwrap().is_none());

    // Revoking again is a no-op
    fixture.service.revoke(&fixture.server_id).await.unwrap();
}
