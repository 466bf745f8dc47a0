use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus for inter-component communication.
///
/// Components publish lifecycle events here instead of holding back
/// references to each other: the SSL engine subscribes to domain changes,
/// proxy sync subscribes to everything that can move a route.
pub struct EventBus {
    /// Domain created/folded/deleted (domains → ssl, proxy)
    pub domain_changed: broadcast::Sender<DomainChangedEvent>,
    /// Certificate issued and saved (ssl → proxy, mail)
    pub ssl_renewed: broadcast::Sender<SslRenewedEvent>,
    /// App lifecycle transition (apps → proxy, websocket consumers)
    pub app_status: broadcast::Sender<AppStatusEvent>,
    /// Explicit request to recompute and push the proxy snapshot
    pub proxy_resync: broadcast::Sender<ProxyResyncEvent>,
    /// A config module reached disk (store → interested components)
    pub config_flushed: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            domain_changed: broadcast::channel(64).0,
            ssl_renewed: broadcast::channel(64).0,
            app_status: broadcast::channel(64).0,
            proxy_resync: broadcast::channel(16).0,
            config_flushed: broadcast::channel(64).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainChange {
    Added,
    SubdomainAdded,
    SubdomainRemoved,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainChangedEvent {
    /// Apex or parent domain the change applies to.
    pub domain: String,
    pub app: String,
    pub change: DomainChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslRenewedEvent {
    pub domain: String,
    /// SAN list the new certificate covers.
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatusEvent {
    pub app: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResyncEvent {
    /// What triggered the resync, for the log line only.
    pub reason: String,
}
