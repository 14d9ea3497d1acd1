//! Dynamic client registration (RFC 7591)
//!
//! Used during configure when registration is enabled and no client id has
//! been supplied. The loopback callback URIs and the OOB value are always
//! registered so either redirect style works with the provider.

use crate::OAuthService;
use sb_types::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Out-of-band redirect value registered alongside the loopback URIs
pub const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

#[derive(Debug, Serialize)]
struct RegistrationRequest {
    client_name: String,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    token_endpoint_auth_method: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,

    #[serde(default)]
    client_secret: Option<String>,

    #[serde(default)]
    registration_client_uri: Option<String>,

    #[serde(default)]
    registration_access_token: Option<String>,
}

/// Credentials minted by the authorization server
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client_id: String,
    /// Absent for public clients
    pub client_secret: Option<String>,
    pub registration_client_uri: Option<String>,
    pub registration_access_token: Option<String>,
}

impl OAuthService {
    /// The redirect URIs registered with every provider
    pub fn redirect_uris(&self) -> Vec<String> {
        vec![
            format!("http://localhost:{}/oauth/callback", self.callback_port),
            format!("http://127.0.0.1:{}/oauth/callback", self.callback_port),
            OOB_REDIRECT_URI.to_string(),
        ]
    }

    /// Register a client at `registration_endpoint`
    pub(crate) async fn register_client(
        &self,
        registration_endpoint: &str,
        server_name: &str,
    ) -> BrokerResult<RegisteredClient> {
        let request = RegistrationRequest {
            client_name: format!("Switchboard ({})", server_name),
            redirect_uris: self.redirect_uris(),
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "client_secret_post".to_string(),
        };

        let response = self
            .http
            .post(registration_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                BrokerError::OAuthConfiguration(format!("registration request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::OAuthConfiguration(format!(
                "registration failed with status {}: {}",
                status, body
            )));
        }

        let registered: RegistrationResponse = response.json().await.map_err(|e| {
            BrokerError::OAuthConfiguration(format!("invalid registration response: {}", e))
        })?;

        info!(
            "registered OAuth client {} ({} client)",
            registered.client_id,
            if registered.client_secret.is_some() {
                "confidential"
            } else {
                "public"
            }
        );

        Ok(RegisteredClient {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            registration_client_uri: registered.registration_client_uri,
            registration_access_token: registered.registration_access_token,
        })
    }
}
