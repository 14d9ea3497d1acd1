//! Provider templates for well-known identity providers
//!
//! A template supplies the endpoints and default scopes the configure step
//! merges under any explicit overrides. The `custom` tag has no template;
//! everything comes from overrides or discovery.

/// Static endpoint/scope defaults for one provider
#[derive(Debug, Clone)]
pub struct ProviderTemplate {
    pub auth_endpoint: &'static str,
    pub token_endpoint: &'static str,
    pub revoke_endpoint: Option<&'static str>,
    pub default_scopes: &'static [&'static str],
    pub supports_pkce: bool,
}

/// Look up the template for a provider tag
pub fn provider_template(provider: &str) -> Option<ProviderTemplate> {
    match provider {
        "github" => Some(ProviderTemplate {
            auth_endpoint: "https://github.com/login/oauth/authorize",
            token_endpoint: "https://github.com/login/oauth/access_token",
            revoke_endpoint: None,
            default_scopes: &["read:user"],
            supports_pkce: true,
        }),
        "google" => Some(ProviderTemplate {
            auth_endpoint: "https://accounts.google.com/o/oauth2/v2/auth",
            token_endpoint: "https://oauth2.googleapis.com/token",
            revoke_endpoint: Some("https://oauth2.googleapis.com/revoke"),
            default_scopes: &["openid", "email", "profile"],
            supports_pkce: true,
        }),
        "microsoft" => Some(ProviderTemplate {
            auth_endpoint: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            token_endpoint: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            revoke_endpoint: None,
            default_scopes: &["openid", "profile", "offline_access"],
            supports_pkce: true,
        }),
        "slack" => Some(ProviderTemplate {
            auth_endpoint: "https://slack.com/oauth/v2/authorize",
            token_endpoint: "https://slack.com/api/oauth.v2.access",
            revoke_endpoint: Some("https://slack.com/api/auth.revoke"),
            default_scopes: &[],
            supports_pkce: false,
        }),
        "gitlab" => Some(ProviderTemplate {
            auth_endpoint: "https://gitlab.com/oauth/authorize",
            token_endpoint: "https://gitlab.com/oauth/token",
            revoke_endpoint: Some("https://gitlab.com/oauth/revoke"),
            default_scopes: &["read_user"],
            supports_pkce: true,
        }),
        "bitbucket" => Some(ProviderTemplate {
            auth_endpoint: "https://bitbucket.org/site/oauth2/authorize",
            token_endpoint: "https://bitbucket.org/site/oauth2/access_token",
            revoke_endpoint: None,
            default_scopes: &["account"],
            supports_pkce: true,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers_have_templates() {
        for tag in ["github", "google", "microsoft", "slack", "gitlab", "bitbucket"] {
            let template = provider_template(tag).unwrap();
            assert!(template.auth_endpoint.starts_with("https://"));
            assert!(template.token_endpoint.starts_with("https://"));
        }
    }

    #[test]
    fn test_custom_has_no_template() {
        assert!(provider_template("custom").is_none());
        assert!(provider_template("unknown").is_none());
    }
}
