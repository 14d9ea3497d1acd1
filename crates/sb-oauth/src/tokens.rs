//! Token lifecycle: live access, coalesced refresh, revocation
//!
//! Refreshes for one server are at-most-one concurrent: the first caller
//! installs a shared future, later callers join it and receive the same
//! outcome. The refresh itself retries up to three times with exponential
//! backoff before surfacing.

use crate::governance::audit::{AuditEventType, AuditSeverity};
use crate::governance::rate_limit::RateLimitKind;
use crate::{OAuthService, RuntimeState};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use sb_store::OAuthTokenRow;
use sb_types::{BrokerError, BrokerResult, OAuthTokenErrorKind};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Refresh when the token expires within this window
const REFRESH_WINDOW_MS: i64 = 300 * 1000;

/// Retry schedule for a refresh exchange (capped at 10 s)
const REFRESH_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Cloneable refresh failure carried through the shared future
#[derive(Debug, Clone)]
pub(crate) struct RefreshFailure {
    pub kind: OAuthTokenErrorKind,
    pub message: String,
}

pub(crate) type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

/// Token endpoint response (RFC 6749 §5.1)
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,

    #[serde(default)]
    pub token_type: Option<String>,

    #[serde(default)]
    pub expires_in: Option<i64>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub id_token: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthService {
    /// Return a live access token, refreshing first when it expires within
    /// five minutes. `None` when the server has no stored token.
    ///
    /// A token without `expires_at` never auto-refreshes.
    pub async fn get_access_token(&self, server_id: &str) -> BrokerResult<Option<String>> {
        if let Err(e) = self.limiter.check(RateLimitKind::General, server_id) {
            self.audit.log(
                AuditEventType::RateLimitExceeded,
                AuditSeverity::Warning,
                Some(server_id),
                json!({ "operation": "general" }),
            );
            return Err(e);
        }

        let Some(row) = self.store.get_oauth_token(server_id)? else {
            return Ok(None);
        };

        let needs_refresh = match row.expires_at {
            None => false,
            Some(expires_at) => expires_at - Utc::now().timestamp_millis() <= REFRESH_WINDOW_MS,
        };

        if !needs_refresh {
            self.store.touch_oauth_token(server_id)?;
            return Ok(Some(row.access_token));
        }

        let refreshed = self.refresh(server_id).await?;
        Ok(Some(refreshed))
    }

    /// Explicit refresh; concurrent callers coalesce onto one exchange
    pub async fn refresh(&self, server_id: &str) -> BrokerResult<String> {
        let fut = {
            let mut inflight = self.inflight_refresh.lock();
            if let Some(existing) = inflight.get(server_id) {
                existing.clone()
            } else {
                // Only a newly-installed refresh counts against the limit;
                // joining callers cause no additional exchange.
                if let Err(e) = self.limiter.check(RateLimitKind::Refresh, server_id) {
                    drop(inflight);
                    self.audit.log(
                        AuditEventType::RateLimitExceeded,
                        AuditSeverity::Warning,
                        Some(server_id),
                        json!({ "operation": "refresh" }),
                    );
                    return Err(e);
                }

                let service = self.clone();
                let sid = server_id.to_string();
                let fut: SharedRefresh = async move {
                    let result = service.do_refresh(&sid).await;
                    service.inflight_refresh.lock().remove(&sid);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(server_id.to_string(), fut.clone());
                fut
            }
        };

        fut.await.map_err(|failure| BrokerError::OAuthToken {
            kind: failure.kind,
            message: failure.message,
        })
    }

    /// Ask the provider whether the stored access token is still active
    ///
    /// Requires an introspection endpoint (RFC 7662). Returns the raw
    /// introspection document.
    pub async fn introspect(&self, server_id: &str) -> BrokerResult<serde_json::Value> {
        let row = self
            .store
            .get_oauth_token(server_id)?
            .ok_or_else(|| BrokerError::NotFound(format!("no token for server {}", server_id)))?;
        let config = self
            .store
            .get_oauth_config(server_id)?
            .ok_or_else(|| BrokerError::NotFound(format!("no OAuth config for {}", server_id)))?;
        let endpoint = config.introspect_endpoint.clone().ok_or_else(|| {
            BrokerError::OAuthConfiguration(format!("no introspection endpoint for {}", server_id))
        })?;

        let mut params = vec![("token", row.access_token)];
        if let Some(client_id) = config.client_id.clone() {
            params.push(("client_id", client_id));
        }
        if let Some(secret) = config.client_secret.clone() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::Upstream(format!("introspection failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BrokerError::Upstream(format!(
                "introspection returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Upstream(format!("invalid introspection response: {}", e)))
    }

    /// Revoke the stored token: cancel the timer, best-effort revocation
    /// endpoint call, delete the row
    pub async fn revoke(&self, server_id: &str) -> BrokerResult<()> {
        self.cancel_refresh_timer(server_id);

        let Some(row) = self.store.get_oauth_token(server_id)? else {
            return Ok(());
        };

        if let Ok(Some(config)) = self.store.get_oauth_config(server_id) {
            if let Some(revoke_endpoint) = config.revoke_endpoint.as_deref() {
                let mut params = vec![("token", row.access_token.clone())];
                if let Some(client_id) = config.client_id.clone() {
                    params.push(("client_id", client_id));
                }
                if let Some(secret) = config.client_secret.clone() {
                    params.push(("client_secret", secret));
                }

                match self.http.post(revoke_endpoint).form(&params).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("revocation endpoint accepted token for {}", server_id);
                    }
                    Ok(response) => {
                        warn!(
                            "revocation endpoint returned {} for {}",
                            response.status(),
                            server_id
                        );
                    }
                    Err(e) => warn!("revocation call failed for {}: {}", server_id, e),
                }
            }
        }

        self.store.delete_oauth_token(server_id)?;
        self.clear_overlay(server_id);
        self.audit.log(
            AuditEventType::TokenRevoked,
            AuditSeverity::Info,
            Some(server_id),
            json!({}),
        );
        info!("OAuth token revoked for {}", server_id);
        Ok(())
    }

    /// Store a fresh token response and re-arm the refresh timer
    pub(crate) fn store_token_response(
        &self,
        server_id: &str,
        response: TokenResponse,
        previous_refresh_token: Option<String>,
        refresh_count: i64,
    ) -> BrokerResult<OAuthTokenRow> {
        let now = Utc::now().timestamp_millis();
        let expires_at = response.expires_in.map(|secs| now + secs * 1000);

        let row = OAuthTokenRow {
            server_id: server_id.to_string(),
            access_token: response.access_token,
            // Providers may omit the refresh token on rotation; keep the old one
            refresh_token: response.refresh_token.or(previous_refresh_token),
            id_token: response.id_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scopes: response
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
            refresh_count,
            last_used: now,
        };
        self.store.upsert_oauth_token(&row)?;

        if let Some(expires_at) = expires_at {
            self.arm_refresh_timer(server_id, expires_at);
        }
        Ok(row)
    }

    /// Schedule a refresh five minutes before expiry, replacing any timer
    pub(crate) fn arm_refresh_timer(&self, server_id: &str, expires_at: i64) {
        self.cancel_refresh_timer(server_id);

        let delay_ms = (expires_at - REFRESH_WINDOW_MS - Utc::now().timestamp_millis()).max(0);
        let service = self.clone();
        let sid = server_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            debug!("refresh timer fired for {}", sid);
            if let Err(e) = service.refresh(&sid).await {
                warn!("scheduled refresh failed for {}: {}", sid, e);
            }
        });

        self.refresh_timers.lock().insert(server_id.to_string(), handle);
    }

    pub(crate) fn cancel_refresh_timer(&self, server_id: &str) {
        if let Some(handle) = self.refresh_timers.lock().remove(server_id) {
            handle.abort();
        }
    }

    /// The single in-flight refresh body
    async fn do_refresh(&self, server_id: &str) -> Result<String, RefreshFailure> {
        self.set_overlay(server_id, RuntimeState::Refreshing);
        let result = self.do_refresh_inner(server_id).await;
        match &result {
            Ok(_) => self.clear_overlay(server_id),
            Err(_) => self.set_overlay(server_id, RuntimeState::Failed),
        }
        result
    }

    async fn do_refresh_inner(&self, server_id: &str) -> Result<String, RefreshFailure> {
        let row = self
            .store
            .get_oauth_token(server_id)
            .map_err(|e| internal_failure(e.to_string()))?
            .ok_or_else(|| internal_failure(format!("no token stored for {}", server_id)))?;

        let Some(refresh_token) = row.refresh_token.clone() else {
            // Nothing to refresh with; the token is unusable once expired
            self.store.delete_oauth_token(server_id).ok();
            self.audit.log(
                AuditEventType::TokenExpired,
                AuditSeverity::Warning,
                Some(server_id),
                json!({ "reason": "no refresh token" }),
            );
            return Err(RefreshFailure {
                kind: OAuthTokenErrorKind::Expired,
                message: format!("no refresh token for {}", server_id),
            });
        };

        let config = self
            .store
            .get_oauth_config(server_id)
            .map_err(|e| internal_failure(e.to_string()))?
            .ok_or_else(|| internal_failure(format!("no OAuth config for {}", server_id)))?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| internal_failure(format!("no token endpoint for {}", server_id)))?;

        let mut last_error = String::new();
        for (attempt, backoff) in REFRESH_BACKOFF.iter().enumerate() {
            let mut params: Vec<(&str, String)> = vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.clone()),
            ];
            if let Some(client_id) = config.client_id.clone() {
                params.push(("client_id", client_id));
            }
            if let Some(secret) = config.client_secret.clone() {
                params.push(("client_secret", secret));
            }

            let response = match self.http.post(&token_endpoint).form(&params).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep((*backoff).min(REFRESH_BACKOFF_CAP)).await;
                    continue;
                }
            };

            if response.status().is_success() {
                let parsed: TokenResponse = match response.json().await {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        last_error = format!("invalid token response: {}", e);
                        tokio::time::sleep((*backoff).min(REFRESH_BACKOFF_CAP)).await;
                        continue;
                    }
                };

                let stored = self
                    .store_token_response(
                        server_id,
                        parsed,
                        Some(refresh_token),
                        row.refresh_count + 1,
                    )
                    .map_err(|e| internal_failure(e.to_string()))?;

                self.audit.log(
                    AuditEventType::TokenRefreshed,
                    AuditSeverity::Info,
                    Some(server_id),
                    json!({ "refresh_count": stored.refresh_count }),
                );
                debug!(
                    "refreshed token for {} (attempt {})",
                    server_id,
                    attempt + 1
                );
                return Ok(stored.access_token);
            }

            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            // invalid_grant is terminal: the grant is gone upstream
            if body.contains("invalid_grant") {
                self.cancel_refresh_timer(server_id);
                self.store.delete_oauth_token(server_id).ok();
                self.audit.log(
                    AuditEventType::TokenValidationFailed,
                    AuditSeverity::Error,
                    Some(server_id),
                    json!({ "status": status.as_u16(), "error": "invalid_grant" }),
                );
                return Err(RefreshFailure {
                    kind: OAuthTokenErrorKind::InvalidGrant,
                    message: format!("refresh rejected with invalid_grant ({})", status),
                });
            }

            last_error = format!("HTTP {}: {}", status, body);
            tokio::time::sleep((*backoff).min(REFRESH_BACKOFF_CAP)).await;
        }

        self.audit.log(
            AuditEventType::AuthenticationFailed,
            AuditSeverity::Error,
            Some(server_id),
            json!({ "stage": "refresh", "error": last_error }),
        );
        Err(RefreshFailure {
            kind: OAuthTokenErrorKind::RefreshFailed,
            message: format!("refresh failed after 3 attempts: {}", last_error),
        })
    }
}

fn internal_failure(message: String) -> RefreshFailure {
    RefreshFailure {
        kind: OAuthTokenErrorKind::RefreshFailed,
        message,
    }
}
