//! Session registry: live identity-to-client bindings and client metadata.
//!
//! Owned and mutated exclusively by the broker loop, so it needs no
//! interior locking. Liveness here is informational: nothing expires a
//! binding except a reconnect (supersession) or a disconnect.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use drover_proto::is_well_formed_client_id;
use drover_store::models::ClientRecord;

use crate::router::Identity;

/// Registration refusal. The offending hello is dropped; nothing mutates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid api key presented by client {client_id:?}")]
    InvalidApiKey { client_id: String },
    #[error("malformed client id {0:?}")]
    MalformedClientId(String),
}

/// Metadata tracked per registered client.
#[derive(Debug, Clone)]
pub struct ClientState {
    pub identity: Identity,
    pub hostname: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// First time this `client_id` has been seen.
    pub is_new: bool,
    /// Previous identity for the same client, now unresolvable.
    pub superseded: Option<Identity>,
    /// Snapshot for persistence.
    pub record: ClientRecord,
}

/// Live sessions, keyed both ways: identity → client_id for inbound
/// attribution, client_id → state for dispatch and metadata.
#[derive(Default)]
pub struct Registry {
    by_identity: HashMap<Identity, String>,
    clients: HashMap<String, ClientState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate and register a hello.
    ///
    /// On success the client record is upserted and `identity` becomes the
    /// client's one live binding; any prior identity for the same
    /// `client_id` is unbound, so later messages on it resolve to nothing.
    pub fn register(
        &mut self,
        identity: Identity,
        client_id: &str,
        api_key: &str,
        hostname: Option<&str>,
        valid_api_keys: &HashSet<String>,
    ) -> Result<RegisterOutcome, AuthError> {
        if !is_well_formed_client_id(client_id) {
            return Err(AuthError::MalformedClientId(client_id.to_owned()));
        }
        if !valid_api_keys.contains(api_key) {
            return Err(AuthError::InvalidApiKey {
                client_id: client_id.to_owned(),
            });
        }

        let now = Utc::now();
        let mut superseded = None;

        let (is_new, state) = match self.clients.get_mut(client_id) {
            Some(state) => {
                if state.identity != identity {
                    self.by_identity.remove(&state.identity);
                    superseded = Some(state.identity);
                }
                state.identity = identity;
                if hostname.is_some() {
                    state.hostname = hostname.map(str::to_owned);
                }
                state.last_seen = now;
                state.updated_at = now;
                (false, state.clone())
            }
            None => {
                let state = ClientState {
                    identity,
                    hostname: hostname.map(str::to_owned),
                    last_seen: now,
                    created_at: now,
                    updated_at: now,
                };
                self.clients.insert(client_id.to_owned(), state.clone());
                (true, state)
            }
        };

        // Rebinding the identity also steals it from any other client it
        // previously belonged to; identity_of() cross-checks both maps, so
        // the stale reverse pointer on that client is harmless.
        self.by_identity.insert(identity, client_id.to_owned());

        Ok(RegisterOutcome {
            is_new,
            superseded,
            record: ClientRecord {
                client_id: client_id.to_owned(),
                identity_hex: identity.to_hex(),
                hostname: state.hostname,
                last_seen: state.last_seen,
                created_at: state.created_at,
                updated_at: state.updated_at,
            },
        })
    }

    /// Attribute an inbound message to a client without re-authenticating.
    pub fn resolve(&self, identity: Identity) -> Option<&str> {
        self.by_identity.get(&identity).map(String::as_str)
    }

    /// Current live identity for a client, if any.
    pub fn identity_of(&self, client_id: &str) -> Option<Identity> {
        let state = self.clients.get(client_id)?;
        // The binding may have been superseded or dropped.
        if self.by_identity.get(&state.identity).map(String::as_str) == Some(client_id) {
            Some(state.identity)
        } else {
            None
        }
    }

    /// Bump `last_seen` for a client. Called on every inbound message.
    pub fn touch(&mut self, client_id: &str) {
        if let Some(state) = self.clients.get_mut(client_id) {
            state.last_seen = Utc::now();
        }
    }

    /// Drop the binding for a disconnected identity. Client metadata stays;
    /// only the live-session mapping goes away.
    pub fn unbind(&mut self, identity: Identity) -> Option<String> {
        self.by_identity.remove(&identity)
    }

    /// Number of clients with a live identity.
    pub fn live_count(&self) -> usize {
        self.by_identity.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> HashSet<String> {
        HashSet::from(["supersecret123".to_owned()])
    }

    fn identity(raw: u64) -> Identity {
        Identity::from_raw(raw)
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = Registry::new();
        let outcome = registry
            .register(identity(1), "c1", "supersecret123", Some("h1"), &keys())
            .unwrap();
        assert!(outcome.is_new);
        assert!(outcome.superseded.is_none());
        assert_eq!(registry.resolve(identity(1)), Some("c1"));
        assert_eq!(registry.identity_of("c1"), Some(identity(1)));
    }

    #[test]
    fn invalid_api_key_refused() {
        let mut registry = Registry::new();
        let err = registry
            .register(identity(1), "c1", "wrong", None, &keys())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidApiKey { .. }));
        assert_eq!(registry.resolve(identity(1)), None);
    }

    #[test]
    fn malformed_client_id_refused() {
        let mut registry = Registry::new();
        for bad in ["", "has space", "a!b"] {
            let err = registry
                .register(identity(1), bad, "supersecret123", None, &keys())
                .unwrap_err();
            assert!(matches!(err, AuthError::MalformedClientId(_)));
        }
    }

    #[test]
    fn reconnect_supersedes_old_identity() {
        let mut registry = Registry::new();
        registry
            .register(identity(1), "c1", "supersecret123", Some("h1"), &keys())
            .unwrap();
        let outcome = registry
            .register(identity(2), "c1", "supersecret123", None, &keys())
            .unwrap();

        assert!(!outcome.is_new);
        assert_eq!(outcome.superseded, Some(identity(1)));
        // The old identity now resolves to nothing.
        assert_eq!(registry.resolve(identity(1)), None);
        assert_eq!(registry.resolve(identity(2)), Some("c1"));
        assert_eq!(registry.identity_of("c1"), Some(identity(2)));
        // hostname persists across a hello that omits it.
        assert_eq!(outcome.record.hostname.as_deref(), Some("h1"));
    }

    #[test]
    fn unbind_leaves_client_metadata() {
        let mut registry = Registry::new();
        registry
            .register(identity(1), "c1", "supersecret123", None, &keys())
            .unwrap();
        assert_eq!(registry.unbind(identity(1)), Some("c1".to_owned()));
        assert_eq!(registry.resolve(identity(1)), None);
        assert_eq!(registry.identity_of("c1"), None);
        assert_eq!(registry.live_count(), 0);

        // Re-registration works and is not "new".
        let outcome = registry
            .register(identity(2), "c1", "supersecret123", None, &keys())
            .unwrap();
        assert!(!outcome.is_new);
    }

    #[test]
    fn touch_updates_last_seen() {
        let mut registry = Registry::new();
        let outcome = registry
            .register(identity(1), "c1", "supersecret123", None, &keys())
            .unwrap();
        let before = outcome.record.last_seen;
        registry.touch("c1");
        let after = registry.clients.get("c1").unwrap().last_seen;
        assert!(after >= before);
    }
}
