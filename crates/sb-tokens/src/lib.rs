//! Client token service
//!
//! Issues, lists, revokes, and validates the opaque bearer tokens that
//! downstream clients present to the router gate. A token is bound to one
//! client and an explicit set of servers; an empty set grants nothing.

use chrono::Utc;
use sb_store::{Store, StoredToken};
use sb_types::{BrokerError, BrokerResult};
use subtle::ConstantTimeEq;
use tracing::info;

/// Bytes of entropy in a token id (43 base64url characters)
const TOKEN_BYTES: usize = 32;

/// What a validated token is allowed to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub client_id: String,
    pub server_ids: Vec<String>,
    pub scopes: Vec<String>,
}

/// The single source of truth for "does this token exist and what can it see"
#[derive(Clone)]
pub struct TokenService {
    store: Store,
}

impl TokenService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Issue a new token for a client over an explicit server set
    ///
    /// Access must be explicit: an empty `server_ids` produces a token that
    /// is denied everywhere.
    pub fn generate(
        &self,
        client_id: &str,
        server_ids: Vec<String>,
        scopes: Vec<String>,
    ) -> BrokerResult<StoredToken> {
        if self.store.get_client(client_id)?.is_none() {
            return Err(BrokerError::NotFound(format!("client {}", client_id)));
        }

        let token = StoredToken {
            id: sb_crypto::random_token(TOKEN_BYTES),
            client_id: client_id.to_string(),
            server_ids,
            scopes,
            issued_at: Utc::now().timestamp_millis(),
        };
        self.store.insert_token(&token)?;

        info!(
            "issued token for client {} over {} servers",
            client_id,
            token.server_ids.len()
        );
        Ok(token)
    }

    /// Revoke a token; returns whether it existed
    pub fn revoke(&self, token_id: &str) -> BrokerResult<bool> {
        let removed = self.store.delete_token(token_id)?;
        if removed {
            info!("revoked token");
        }
        Ok(removed)
    }

    /// List all tokens issued to a client
    pub fn list_by_client(&self, client_id: &str) -> BrokerResult<Vec<StoredToken>> {
        self.store.list_tokens_by_client(client_id)
    }

    /// Validate a presented token id
    ///
    /// The stored id is compared to the presented one in constant time; the
    /// presented string comes from an untrusted caller.
    pub fn validate(&self, presented: &str) -> BrokerResult<TokenGrant> {
        let Some(token) = self.store.get_token(presented)? else {
            return Err(BrokerError::Unauthenticated);
        };

        let matches: bool = token
            .id
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into();
        if !matches {
            return Err(BrokerError::Unauthenticated);
        }

        Ok(TokenGrant {
            client_id: token.client_id,
            server_ids: token.server_ids,
            scopes: token.scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_config::{ClientRecord, ServerConfig};
    use sb_crypto::CryptoService;
    use std::sync::Arc;

    fn setup() -> (TokenService, Store, String, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Arc::new(
            CryptoService::load_or_create(
                &dir.path().join(".oauth-key"),
                &dir.path().join("oauth-keys.json"),
            )
            .unwrap(),
        );
        let store = Store::open_in_memory(crypto).unwrap();

        let client = ClientRecord::new("client", None);
        store.insert_client(&client).unwrap();
        let server = ServerConfig::local("srv", "echo", vec![]);
        store.insert_server(&server).unwrap();

        (
            TokenService::new(store.clone()),
            store,
            client.id,
            server.id,
            dir,
        )
    }

    #[test]
    fn test_generate_and_validate() {
        let (service, _store, client_id, server_id, _dir) = setup();

        let token = service
            .generate(&client_id, vec![server_id.clone()], vec![])
            .unwrap();
        assert_eq!(token.id.len(), 43);

        let grant = service.validate(&token.id).unwrap();
        assert_eq!(grant.client_id, client_id);
        assert_eq!(grant.server_ids, vec![server_id]);
    }

    #[test]
    fn test_unknown_token_is_unauthenticated() {
        let (service, _store, _client_id, _server_id, _dir) = setup();
        assert!(matches!(
            service.validate("not-a-token"),
            Err(BrokerError::Unauthenticated)
        ));
    }

    #[test]
    fn test_generate_for_unknown_client_fails() {
        let (service, _store, _client_id, server_id, _dir) = setup();
        assert!(service.generate("ghost", vec![server_id], vec![]).is_err());
    }

    #[test]
    fn test_revoke() {
        let (service, _store, client_id, server_id, _dir) = setup();

        let token = service.generate(&client_id, vec![server_id], vec![]).unwrap();
        assert!(service.revoke(&token.id).unwrap());
        assert!(!service.revoke(&token.id).unwrap());
        assert!(service.validate(&token.id).is_err());
    }

    #[test]
    fn test_empty_server_set_is_preserved() {
        let (service, _store, client_id, _server_id, _dir) = setup();

        let token = service.generate(&client_id, vec![], vec![]).unwrap();
        let grant = service.validate(&token.id).unwrap();
        assert!(grant.server_ids.is_empty());
    }

    #[test]
    fn test_list_by_client() {
        let (service, _store, client_id, server_id, _dir) = setup();

        service.generate(&client_id, vec![server_id.clone()], vec![]).unwrap();
        service.generate(&client_id, vec![server_id], vec![]).unwrap();
        assert_eq!(service.list_by_client(&client_id).unwrap().len(), 2);
    }
}
