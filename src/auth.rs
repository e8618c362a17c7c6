//! AuthProvider interface (C3).
//!
//! Key-material derivation, key-file loading, authorized-keys watching and
//! GitHub key fetching are explicitly out of scope (SPEC_FULL.md §4,
//! spec.md §1) - callers implement [`AuthProvider`] themselves for those.
//! This module only defines the interface and the handful of built-in,
//! in-memory descriptors a caller can reach for without writing one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PublicKey;

/// A credential presented by a connecting client.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    PublicKey(PublicKey),
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

impl AuthDecision {
    pub fn accepted(self) -> bool {
        matches!(self, AuthDecision::Accept)
    }
}

/// Given a candidate credential (password or public key) for `user`,
/// return accept/reject. Implementations must not block the async runtime;
/// perform blocking I/O (file reads, network calls) via `tokio::task::
/// spawn_blocking` or an async client.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, user: &str, credential: &Credential) -> AuthDecision;
}

/// Accepts every credential. Only appropriate for local testing.
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn authenticate(&self, _user: &str, _credential: &Credential) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// A single fixed `user`/password pair (Scenario 2).
pub struct PasswordAuth {
    pub user: String,
    pub password: String,
}

#[async_trait]
impl AuthProvider for PasswordAuth {
    async fn authenticate(&self, user: &str, credential: &Credential) -> AuthDecision {
        match credential {
            Credential::Password(pass) if user == self.user && pass == &self.password => {
                AuthDecision::Accept
            }
            _ => AuthDecision::Reject,
        }
    }
}

/// A static map of `user -> authorized public keys`.
pub struct AuthorizedKeys {
    pub keys: HashMap<String, Vec<PublicKey>>,
}

#[async_trait]
impl AuthProvider for AuthorizedKeys {
    async fn authenticate(&self, user: &str, credential: &Credential) -> AuthDecision {
        match credential {
            Credential::PublicKey(key) => match self.keys.get(user) {
                Some(allowed) if allowed.iter().any(|k| k == key) => AuthDecision::Accept,
                _ => AuthDecision::Reject,
            },
            _ => AuthDecision::Reject,
        }
    }
}

/// Delegates to a caller-supplied per-user lookup, e.g. backed by a GitHub
/// keys fetch or a file-watching authorized_keys store. The fetch/watch
/// mechanics live entirely in the closure; this struct is just glue.
pub struct PerUserAuth<F>
where
    F: Fn(&str) -> Option<Arc<dyn AuthProvider>> + Send + Sync,
{
    pub lookup: F,
}

#[async_trait]
impl<F> AuthProvider for PerUserAuth<F>
where
    F: Fn(&str) -> Option<Arc<dyn AuthProvider>> + Send + Sync,
{
    async fn authenticate(&self, user: &str, credential: &Credential) -> AuthDecision {
        match (self.lookup)(user) {
            Some(provider) => provider.authenticate(user, credential).await,
            None => AuthDecision::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn password_auth_matches_exact_pair() {
        let auth = PasswordAuth {
            user: "user".into(),
            password: "secret".into(),
        };
        assert_eq!(
            auth.authenticate("user", &Credential::Password("secret".into()))
                .await,
            AuthDecision::Accept
        );
        assert_eq!(
            auth.authenticate("user", &Credential::Password("wrong".into()))
                .await,
            AuthDecision::Reject
        );
    }

    #[tokio::test]
    async fn no_auth_always_accepts() {
        let auth = NoAuth;
        assert_eq!(
            auth.authenticate("anyone", &Credential::Password(String::new()))
                .await,
            AuthDecision::Accept
        );
    }
}
