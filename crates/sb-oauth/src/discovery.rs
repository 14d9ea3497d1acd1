//! OAuth server metadata discovery
//!
//! Tries the well-known URLs in order, falling through on any HTTP error or
//! unparseable body. Results are cached in memory for 24 hours.

use crate::OAuthService;
use sb_types::{BrokerError, BrokerResult};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Well-known metadata paths, tried in order
pub const WELL_KNOWN_PATHS: [&str; 3] = [
    ".well-known/oauth-authorization-server",
    ".well-known/openid-configuration",
    ".well-known/oauth2-metadata",
];

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Authorization-server metadata (RFC 8414 / OIDC discovery subset)
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    #[serde(default)]
    pub token_endpoint: Option<String>,

    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    #[serde(default)]
    pub introspection_endpoint: Option<String>,

    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    #[serde(default)]
    pub registration_endpoint: Option<String>,

    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

pub(crate) struct CachedDiscovery {
    pub document: DiscoveryDocument,
    pub fetched_at: Instant,
}

impl OAuthService {
    /// Discover authorization-server metadata for a base URL
    ///
    /// A 200 with invalid JSON counts as a miss and the next URL is tried.
    pub async fn discover(&self, base_url: &str) -> BrokerResult<DiscoveryDocument> {
        let base = base_url.trim_end_matches('/').to_string();

        if let Some(cached) = self.discovery_cache.lock().get(&base) {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                debug!("discovery cache hit for {}", base);
                return Ok(cached.document.clone());
            }
        }

        let mut last_error = String::new();
        for path in WELL_KNOWN_PATHS {
            let url = format!("{}/{}", base, path);
            debug!("trying discovery URL {}", url);

            let response = match self.http.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                    continue;
                }
            };

            if !response.status().is_success() {
                last_error = format!("{}: HTTP {}", url, response.status());
                continue;
            }

            let document: DiscoveryDocument = match response.json().await {
                Ok(document) => document,
                Err(e) => {
                    last_error = format!("{}: invalid metadata: {}", url, e);
                    continue;
                }
            };

            if document.token_endpoint.is_none() {
                last_error = format!("{}: metadata has no token_endpoint", url);
                continue;
            }

            info!(
                "discovered OAuth metadata for {} (token endpoint {})",
                base,
                document.token_endpoint.as_deref().unwrap_or_default()
            );
            self.discovery_cache.lock().insert(
                base,
                CachedDiscovery {
                    document: document.clone(),
                    fetched_at: Instant::now(),
                },
            );
            return Ok(document);
        }

        Err(BrokerError::OAuthConfiguration(format!(
            "metadata discovery failed for {}: {}",
            base, last_error
        )))
    }
}
