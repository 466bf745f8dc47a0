//! Root-key and capability-token authentication.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use od_common::token;
use od_config::ConfigStore;

/// Actions a derived capability token may invoke.
pub const CAPABILITY_ACTIONS: &[&str] = &["mail.send"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthLevel {
    Root,
    /// Capability token bound to this identity.
    Capability(String),
    Denied,
}

pub struct AuthState {
    store: Arc<ConfigStore>,
    /// token → identity; populated by lifecycle events (app start/stop).
    tokens: RwLock<HashMap<String, String>>,
    /// Non-loopback peers allowed on the TCP listener (container IPs,
    /// registered at container start).
    allowed_ips: RwLock<HashSet<IpAddr>>,
}

impl AuthState {
    pub fn new(store: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            tokens: RwLock::new(HashMap::new()),
            allowed_ips: RwLock::new(HashSet::new()),
        })
    }

    pub async fn root_key(&self) -> String {
        self.store.read().await.api.auth.clone()
    }

    /// Derive and register the capability token for an identity; returns
    /// the token.
    pub async fn register_identity(&self, identity: &str) -> String {
        let derived = token::derive(&self.root_key().await, identity);
        self.tokens
            .write()
            .await
            .insert(derived.clone(), identity.to_string());
        derived
    }

    pub async fn unregister_identity(&self, identity: &str) {
        self.tokens.write().await.retain(|_, v| v != identity);
    }

    pub async fn classify(&self, auth: &str) -> AuthLevel {
        if !auth.is_empty() && auth == self.root_key().await {
            return AuthLevel::Root;
        }
        match self.tokens.read().await.get(auth) {
            Some(identity) => AuthLevel::Capability(identity.clone()),
            None => AuthLevel::Denied,
        }
    }

    pub async fn allow_ip(&self, ip: IpAddr) {
        self.allowed_ips.write().await.insert(ip);
    }

    pub async fn disallow_ip(&self, ip: IpAddr) {
        self.allowed_ips.write().await.remove(&ip);
    }

    /// TCP peers must be loopback or explicitly allowed.
    pub async fn peer_permitted(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || self.allowed_ips.read().await.contains(&ip)
    }
}

pub fn capability_allows(action: &str) -> bool {
    CAPABILITY_ACTIONS.contains(&action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use od_common::{EventBus, OdacPaths};

    async fn auth_state() -> (tempfile::TempDir, Arc<AuthState>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        (dir, AuthState::new(store))
    }

    #[tokio::test]
    async fn root_key_classifies_as_root() {
        let (_dir, auth) = auth_state().await;
        let key = auth.root_key().await;
        assert_eq!(auth.classify(&key).await, AuthLevel::Root);
        assert_eq!(auth.classify("wrong").await, AuthLevel::Denied);
        assert_eq!(auth.classify("").await, AuthLevel::Denied);
    }

    #[tokio::test]
    async fn token_lifecycle_follows_registration() {
        let (_dir, auth) = auth_state().await;
        let token = auth.register_identity("example.com").await;
        assert_eq!(
            auth.classify(&token).await,
            AuthLevel::Capability("example.com".to_string())
        );
        auth.unregister_identity("example.com").await;
        assert_eq!(auth.classify(&token).await, AuthLevel::Denied);
    }

    #[tokio::test]
    async fn peer_rules() {
        let (_dir, auth) = auth_state().await;
        assert!(auth.peer_permitted("127.0.0.1".parse().unwrap()).await);
        let remote: IpAddr = "10.0.0.7".parse().unwrap();
        assert!(!auth.peer_permitted(remote).await);
        auth.allow_ip(remote).await;
        assert!(auth.peer_permitted(remote).await);
        auth.disallow_ip(remote).await;
        assert!(!auth.peer_permitted(remote).await);
    }

    #[test]
    fn capability_whitelist() {
        assert!(capability_allows("mail.send"));
        assert!(!capability_allows("app.delete"));
        assert!(!capability_allows("auth"));
    }
}
