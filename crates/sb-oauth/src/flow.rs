//! Browser-driven authorization-code flow with PKCE
//!
//! `authenticate` persists an auth-state row, opens the browser at the
//! authorization URL, and waits on a loopback HTTP listener for the single
//! redirect whose `state` matches. The listener and port are released on
//! completion, cancellation, or the 10-minute hard timeout.

use crate::governance::audit::{AuditEventType, AuditSeverity};
use crate::governance::rate_limit::RateLimitKind;
use crate::tokens::TokenResponse;
use crate::{OAuthService, RuntimeState};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use sb_store::AuthStateRow;
use sb_types::{BrokerError, BrokerResult, OAuthFlowErrorKind};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Hard limit on the whole browser round-trip
const FLOW_TIMEOUT: Duration = Duration::from_secs(600);

/// Redirect query parameters
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// What the listener hands back to the waiting flow
#[derive(Debug)]
enum CallbackOutcome {
    Code(String),
    Denied { error: String, description: String },
}

struct ListenerState {
    expected_state: String,
    result_tx: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

impl OAuthService {
    /// Run the full browser authorization for a server
    ///
    /// Returns once a token is stored, or with `OAuthFlowError` on
    /// cancellation, state mismatch, provider error, timeout, or when the
    /// loopback port cannot be bound.
    pub async fn authenticate(
        &self,
        server_id: &str,
        scopes: Option<Vec<String>>,
    ) -> BrokerResult<()> {
        let config = self
            .store
            .get_oauth_config(server_id)?
            .ok_or_else(|| {
                BrokerError::OAuthConfiguration(format!("server {} is not configured", server_id))
            })?;
        let auth_endpoint = config.auth_endpoint.clone().ok_or_else(|| {
            BrokerError::OAuthConfiguration(format!("no authorization endpoint for {}", server_id))
        })?;
        let token_endpoint = config.token_endpoint.clone().ok_or_else(|| {
            BrokerError::OAuthConfiguration(format!("no token endpoint for {}", server_id))
        })?;

        if let Err(e) = self.limiter.check(RateLimitKind::Auth, server_id) {
            self.audit.log(
                AuditEventType::RateLimitExceeded,
                AuditSeverity::Warning,
                Some(server_id),
                json!({ "operation": "auth" }),
            );
            return Err(e);
        }

        let scopes = scopes.unwrap_or_else(|| config.scopes.clone());
        let state = sb_crypto::random_token(32);
        let verifier = sb_crypto::random_token(64);
        let challenge = config.use_pkce.then(|| sb_crypto::pkce_challenge(&verifier));
        let redirect_uri = format!("http://localhost:{}/oauth/callback", self.callback_port);

        self.store.insert_auth_state(&AuthStateRow {
            state: state.clone(),
            server_id: server_id.to_string(),
            code_verifier: verifier.clone(),
            code_challenge: challenge.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes: scopes.clone(),
            created_at: Utc::now().timestamp_millis(),
        })?;

        self.audit.log(
            AuditEventType::AuthenticationStarted,
            AuditSeverity::Info,
            Some(server_id),
            json!({ "provider": config.provider }),
        );
        self.set_overlay(server_id, RuntimeState::Authorizing);

        let result = self
            .run_flow(
                server_id,
                &config.provider,
                &auth_endpoint,
                &token_endpoint,
                config.client_id.as_deref().unwrap_or_default(),
                config.client_secret.as_deref(),
                &config.additional_params,
                config.audience.as_deref(),
                &scopes,
                &state,
                &verifier,
                challenge.as_deref(),
                &redirect_uri,
            )
            .await;

        // The auth-state row is one-shot regardless of the outcome
        let _ = self.store.take_auth_state(&state);

        match &result {
            Ok(()) => {
                self.clear_overlay(server_id);
                self.audit.log(
                    AuditEventType::AuthenticationCompleted,
                    AuditSeverity::Info,
                    Some(server_id),
                    json!({ "provider": config.provider }),
                );
            }
            Err(e) => {
                self.set_overlay(server_id, RuntimeState::Failed);
                self.audit.log(
                    AuditEventType::AuthenticationFailed,
                    AuditSeverity::Error,
                    Some(server_id),
                    json!({ "error": e.to_string() }),
                );
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_flow(
        &self,
        server_id: &str,
        provider: &str,
        auth_endpoint: &str,
        token_endpoint: &str,
        client_id: &str,
        client_secret: Option<&str>,
        additional_params: &std::collections::HashMap<String, String>,
        audience: Option<&str>,
        scopes: &[String],
        state: &str,
        verifier: &str,
        challenge: Option<&str>,
        redirect_uri: &str,
    ) -> BrokerResult<()> {
        let (result_rx, shutdown_tx) = self.start_callback_listener(state).await?;

        let auth_url = build_authorization_url(
            auth_endpoint,
            client_id,
            redirect_uri,
            scopes,
            state,
            challenge,
            audience,
            additional_params,
        );

        if let Err(e) = self.browser.open(&auth_url) {
            let _ = shutdown_tx.send(());
            return Err(e);
        }
        info!("waiting for OAuth redirect for {} ({})", server_id, provider);

        let outcome = match tokio::time::timeout(FLOW_TIMEOUT, result_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                let _ = shutdown_tx.send(());
                return Err(BrokerError::OAuthFlow {
                    kind: OAuthFlowErrorKind::Cancelled,
                    message: "callback listener closed before a redirect arrived".to_string(),
                });
            }
            Err(_) => {
                let _ = shutdown_tx.send(());
                return Err(BrokerError::OAuthFlow {
                    kind: OAuthFlowErrorKind::Timeout,
                    message: "authorization timed out after 10 minutes".to_string(),
                });
            }
        };
        let _ = shutdown_tx.send(());

        let code = match outcome {
            CallbackOutcome::Code(code) => code,
            CallbackOutcome::Denied { error, description } => {
                let kind = if error == "access_denied" {
                    OAuthFlowErrorKind::Cancelled
                } else {
                    OAuthFlowErrorKind::ProviderError
                };
                return Err(BrokerError::OAuthFlow {
                    kind,
                    message: format!("{}: {}", error, description),
                });
            }
        };

        // Exchange the code (and verifier) at the token endpoint
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", client_id.to_string()),
        ];
        if let Some(secret) = client_secret {
            params.push(("client_secret", secret.to_string()));
        }
        if challenge.is_some() {
            params.push(("code_verifier", verifier.to_string()));
        }

        let response = self
            .http
            .post(token_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::OAuthFlow {
                kind: OAuthFlowErrorKind::ProviderError,
                message: format!("token request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("token exchange failed for {}: {} {}", server_id, status, body);
            return Err(BrokerError::OAuthFlow {
                kind: OAuthFlowErrorKind::ProviderError,
                message: format!("token exchange failed with status {}: {}", status, body),
            });
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| BrokerError::OAuthFlow {
            kind: OAuthFlowErrorKind::ProviderError,
            message: format!("invalid token response: {}", e),
        })?;

        self.store_token_response(server_id, parsed, None, 0)?;
        self.audit.log(
            AuditEventType::TokenCreated,
            AuditSeverity::Info,
            Some(server_id),
            json!({ "provider": provider }),
        );
        info!("OAuth authorization completed for {}", server_id);
        Ok(())
    }

    /// Bind the loopback listener for one authorization
    ///
    /// The port is held only for this flow; the returned sender tears the
    /// listener down.
    async fn start_callback_listener(
        &self,
        expected_state: &str,
    ) -> BrokerResult<(oneshot::Receiver<CallbackOutcome>, oneshot::Sender<()>)> {
        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let listener_state = Arc::new(ListenerState {
            expected_state: expected_state.to_string(),
            result_tx: Mutex::new(Some(result_tx)),
        });

        let app = Router::new()
            .route("/oauth/callback", axum::routing::get(handle_callback))
            .with_state(listener_state);

        let addr = format!("127.0.0.1:{}", self.callback_port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            BrokerError::OAuthFlow {
                kind: OAuthFlowErrorKind::ProviderError,
                message: format!("failed to bind callback listener on {}: {}", addr, e),
            }
        })?;
        info!("OAuth callback listener bound at http://{}/oauth/callback", addr);

        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("OAuth callback listener error: {}", e);
            }
        });

        Ok((result_rx, shutdown_tx))
    }
}

async fn handle_callback(
    State(listener): State<Arc<ListenerState>>,
    Query(params): Query<CallbackQuery>,
) -> impl IntoResponse {
    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "unknown error".to_string());
        warn!("authorization failed: {} - {}", error, description);

        if let Some(sender) = listener.result_tx.lock().take() {
            let _ = sender.send(CallbackOutcome::Denied {
                error: error.clone(),
                description: description.clone(),
            });
        }
        return (
            StatusCode::BAD_REQUEST,
            Html(format!(
                r#"<html><body style="font-family: sans-serif; text-align: center; padding: 50px;">
                    <h1>Authorization Failed</h1>
                    <p>Error: {}</p><p>{}</p>
                    <p>You can close this window and return to Switchboard.</p>
                </body></html>"#,
                error, description
            )),
        );
    }

    let (Some(code), Some(state)) = (params.code, params.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(
                r#"<html><body style="font-family: sans-serif; text-align: center; padding: 50px;">
                    <h1>Error</h1><p>Missing code or state parameter</p>
                </body></html>"#
                    .to_string(),
            ),
        );
    };

    // Redirects with a foreign state are rejected; the flow keeps waiting
    // for the one it issued.
    if state != listener.expected_state {
        warn!("received callback with mismatched state");
        return (
            StatusCode::BAD_REQUEST,
            Html(
                r#"<html><body style="font-family: sans-serif; text-align: center; padding: 50px;">
                    <h1>Error</h1><p>Invalid state parameter (CSRF protection)</p>
                </body></html>"#
                    .to_string(),
            ),
        );
    }

    if let Some(sender) = listener.result_tx.lock().take() {
        let _ = sender.send(CallbackOutcome::Code(code));
    }

    (
        StatusCode::OK,
        Html(
            r#"<html><head><title>Authorization Successful</title></head>
            <body style="font-family: sans-serif; text-align: center; padding: 50px;">
                <h1>Authorization Successful</h1>
                <p>You can close this window and return to Switchboard.</p>
                <script>setTimeout(function() { window.close(); }, 3000);</script>
            </body></html>"#
                .to_string(),
        ),
    )
}

#[allow(clippy::too_many_arguments)]
fn build_authorization_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    challenge: Option<&str>,
    audience: Option<&str>,
    additional_params: &std::collections::HashMap<String, String>,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes.join(" ")),
        urlencoding::encode(state),
    );

    if let Some(challenge) = challenge {
        url.push_str(&format!(
            "&code_challenge={}&code_challenge_method=S256",
            urlencoding::encode(challenge)
        ));
    }
    if let Some(audience) = audience {
        url.push_str(&format!("&audience={}", urlencoding::encode(audience)));
    }
    for (key, value) in additional_params {
        url.push_str(&format!(
            "&{}={}",
            urlencoding::encode(key),
            urlencoding::encode(value)
        ));
    }

    url
}
