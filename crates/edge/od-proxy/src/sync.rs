//! Routing-snapshot computation and delivery.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info, warn};

use od_common::EventBus;
use od_config::{AppRecord, CertMaterial, ConfigStore, FirewallConfig};

const PUSH_RETRIES: u32 = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Loopback sentinel used when a container backend can't be located; the
/// data plane answers 502 instead of hanging.
const FAIL_SECURE_BACKEND: &str = "127.0.0.1";

/// Runtime IP lookup seam; the orchestrator backs this with the container
/// runtime so proxy sync never references the app supervisor directly.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn container_ip(&self, app_name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRoute {
    pub port: u16,
    pub subdomain: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertMaterial>,
    /// Present when traffic goes to a container rather than a host port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "containerIP")]
    pub container_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDocument {
    pub domains: BTreeMap<String, ProxyRoute>,
    pub firewall: FirewallConfig,
    /// Default SNI material (system self-signed fallback).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<CertMaterial>,
}

#[derive(Debug, Clone)]
pub enum ProxyEndpoint {
    /// Local socket (preferred).
    Unix(PathBuf),
    /// Platforms without Unix sockets.
    Tcp(SocketAddr),
}

pub struct ProxySync {
    store: Arc<ConfigStore>,
    resolver: Arc<dyn BackendResolver>,
    events: Arc<EventBus>,
    endpoint: ProxyEndpoint,
}

impl ProxySync {
    pub fn new(
        store: Arc<ConfigStore>,
        resolver: Arc<dyn BackendResolver>,
        events: Arc<EventBus>,
        endpoint: ProxyEndpoint,
    ) -> Arc<Self> {
        Arc::new(Self { store, resolver, events, endpoint })
    }

    /// Compute a full snapshot from the current config.
    pub async fn build_snapshot(&self) -> ProxyDocument {
        let (domains, apps, firewall, ssl) = {
            let tree = self.store.read().await;
            (
                tree.domains.domains.clone(),
                tree.apps.clone(),
                tree.firewall.clone(),
                tree.ssl.ssl.clone(),
            )
        };

        let mut routes = BTreeMap::new();
        for (fqdn, record) in domains {
            let Some(app) = apps.by_name(&record.app_id) else {
                warn!(domain = fqdn, app = record.app_id, "Domain bound to missing app, skipped");
                continue;
            };
            let route = self
                .route_for(app, record.subdomain.clone(), record.cert.and_then(|c| c.ssl))
                .await;
            routes.insert(fqdn, route);
        }

        ProxyDocument { domains: routes, firewall, ssl }
    }

    /// Port priority: published host port, declared container port, legacy
    /// `port` field. Container-only backends resolve their IP live, fall
    /// back to the cached address, then to the fail-secure loopback.
    async fn route_for(
        &self,
        app: &AppRecord,
        subdomain: Vec<String>,
        cert: Option<CertMaterial>,
    ) -> ProxyRoute {
        if let Some(published) = app.ports.iter().find(|p| p.host.is_some()) {
            return ProxyRoute {
                port: published.host.unwrap_or(published.container),
                subdomain,
                cert,
                container: None,
                container_ip: None,
            };
        }

        if let Some(declared) = app.ports.first() {
            let container = crate::supervisor::app_container_name(&app.name);
            let ip = match self.resolver.container_ip(&app.name).await {
                Some(ip) => ip,
                None => app
                    .container_ip
                    .clone()
                    .unwrap_or_else(|| FAIL_SECURE_BACKEND.to_string()),
            };
            return ProxyRoute {
                port: declared.container,
                subdomain,
                cert,
                container: Some(container),
                container_ip: Some(ip),
            };
        }

        ProxyRoute {
            port: app.port.unwrap_or(80),
            subdomain,
            cert,
            container: None,
            container_ip: None,
        }
    }

    /// Build and push; the most recent snapshot wins on the far side.
    pub async fn sync(&self) {
        let document = self.build_snapshot().await;
        if let Err(e) = self.push(&document).await {
            warn!("Proxy config push failed: {e}");
        }
    }

    /// POST the document to the data plane, absorbing transient restart
    /// windows with a short retry ladder.
    pub async fn push(&self, document: &ProxyDocument) -> Result<()> {
        let body = serde_json::to_vec(document).context("snapshot serialization")?;

        let mut last_err = None;
        for attempt in 1..=PUSH_RETRIES {
            match self.post_config(body.clone()).await {
                Ok(()) => {
                    debug!(
                        routes = document.domains.len(),
                        attempt, "Proxy config pushed"
                    );
                    return Ok(());
                }
                Err(e) if is_transient(&e) => {
                    last_err = Some(e);
                    if attempt < PUSH_RETRIES {
                        tokio::time::sleep(PUSH_RETRY_DELAY).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("proxy push failed")))
    }

    async fn post_config(&self, body: Vec<u8>) -> Result<()> {
        let request = Request::builder()
            .method("POST")
            .uri("/config")
            .header("host", "odac-proxy")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .context("request build")?;

        let response = match &self.endpoint {
            ProxyEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("connect {}", path.display()))?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(conn);
                sender.send_request(request).await?
            }
            ProxyEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connect {addr}"))?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(conn);
                sender.send_request(request).await?
            }
        };

        if !response.status().is_success() {
            bail!("data plane rejected config: {}", response.status());
        }
        Ok(())
    }

    /// Resync whenever anything route-affecting happens. Fire-and-forget
    /// from the publishers' perspective.
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut resync = self.events.proxy_resync.subscribe();
        let mut ssl = self.events.ssl_renewed.subscribe();
        let mut apps = self.events.app_status.subscribe();
        info!("Proxy sync listening for route changes");
        loop {
            let reason = tokio::select! {
                event = resync.recv() => match event {
                    Ok(e) => e.reason,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
                event = ssl.recv() => match event {
                    Ok(e) => format!("certificate renewed: {}", e.domain),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
                event = apps.recv() => match event {
                    Ok(e) => format!("app {}: {}", e.app, e.status),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            };
            debug!(reason, "Recomputing proxy snapshot");
            self.sync().await;
        }
    }
}

fn is_transient(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionReset
            )
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use od_common::OdacPaths;
    use od_config::{
        AppStatus, AppType, DomainRecord, EnvSpec, Module, PortMapping,
    };

    struct FixedResolver(Option<String>);

    #[async_trait]
    impl BackendResolver for FixedResolver {
        async fn container_ip(&self, _app: &str) -> Option<String> {
            self.0.clone()
        }
    }

    fn app(name: &str, ports: Vec<PortMapping>) -> AppRecord {
        AppRecord {
            id: 1,
            name: name.into(),
            app_type: AppType::Container,
            image: Some("nginx".into()),
            url: None,
            branch: None,
            git: None,
            file: None,
            ports,
            volumes: vec![],
            env: EnvSpec::default(),
            api: None,
            dev: None,
            active: true,
            status: AppStatus::Running,
            created: Utc::now(),
            started: None,
            commit_sha: None,
            port: None,
            container_ip: Some("172.17.0.9".into()),
        }
    }

    async fn sync_with(
        app_record: AppRecord,
        resolver: FixedResolver,
    ) -> (tempfile::TempDir, Arc<ProxySync>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let events = Arc::new(EventBus::new());
        let store = Arc::new(ConfigStore::load(paths.clone(), events.clone()));
        let name = app_record.name.clone();
        store
            .update(Module::Apps, |tree| tree.apps.apps.push(app_record))
            .await;
        store
            .update(Module::Domains, |tree| {
                tree.domains.domains.insert(
                    "example.com".into(),
                    DomainRecord {
                        app_id: name.clone(),
                        subdomain: vec!["www".into()],
                        created: Utc::now(),
                        cert: None,
                    },
                );
            })
            .await;
        let sync = ProxySync::new(
            store,
            Arc::new(resolver),
            events,
            ProxyEndpoint::Unix(paths.proxy_socket("test")),
        );
        (dir, sync)
    }

    #[tokio::test]
    async fn published_host_port_routes_to_loopback() {
        let record = app("web", vec![PortMapping { host: Some(8080), container: 80 }]);
        let (_dir, sync) = sync_with(record, FixedResolver(None)).await;
        let doc = sync.build_snapshot().await;
        let route = &doc.domains["example.com"];
        assert_eq!(route.port, 8080);
        assert!(route.container.is_none());
        assert!(route.container_ip.is_none());
        assert_eq!(route.subdomain, vec!["www"]);
    }

    #[tokio::test]
    async fn container_port_uses_runtime_ip() {
        let record = app("web", vec![PortMapping { host: None, container: 3000 }]);
        let (_dir, sync) = sync_with(record, FixedResolver(Some("172.17.0.2".into()))).await;
        let doc = sync.build_snapshot().await;
        let route = &doc.domains["example.com"];
        assert_eq!(route.port, 3000);
        assert_eq!(route.container.as_deref(), Some("odac-web"));
        assert_eq!(route.container_ip.as_deref(), Some("172.17.0.2"));
    }

    #[tokio::test]
    async fn unreachable_runtime_falls_back_to_cached_ip() {
        let record = app("web", vec![PortMapping { host: None, container: 3000 }]);
        let (_dir, sync) = sync_with(record, FixedResolver(None)).await;
        let doc = sync.build_snapshot().await;
        let route = &doc.domains["example.com"];
        assert_eq!(route.container_ip.as_deref(), Some("172.17.0.9"));
    }

    #[tokio::test]
    async fn no_ip_anywhere_is_fail_secure() {
        let mut record = app("web", vec![PortMapping { host: None, container: 3000 }]);
        record.container_ip = None;
        let (_dir, sync) = sync_with(record, FixedResolver(None)).await;
        let doc = sync.build_snapshot().await;
        assert_eq!(
            doc.domains["example.com"].container_ip.as_deref(),
            Some(FAIL_SECURE_BACKEND)
        );
    }

    #[tokio::test]
    async fn legacy_port_field_used_last() {
        let mut record = app("web", vec![]);
        record.port = Some(9090);
        let (_dir, sync) = sync_with(record, FixedResolver(None)).await;
        let doc = sync.build_snapshot().await;
        let route = &doc.domains["example.com"];
        assert_eq!(route.port, 9090);
        assert!(route.container.is_none());
    }

    #[tokio::test]
    async fn domain_with_missing_app_is_skipped() {
        let record = app("web", vec![]);
        let (_dir, sync) = sync_with(record, FixedResolver(None)).await;
        sync.store
            .update(Module::Domains, |tree| {
                tree.domains.domains.insert(
                    "orphan.org".into(),
                    DomainRecord {
                        app_id: "ghost".into(),
                        subdomain: vec![],
                        created: Utc::now(),
                        cert: None,
                    },
                );
            })
            .await;
        let doc = sync.build_snapshot().await;
        assert!(doc.domains.contains_key("example.com"));
        assert!(!doc.domains.contains_key("orphan.org"));
    }

    #[tokio::test]
    async fn document_serializes_with_camel_case_container_ip() {
        let record = app("web", vec![PortMapping { host: None, container: 3000 }]);
        let (_dir, sync) = sync_with(record, FixedResolver(Some("172.17.0.2".into()))).await;
        let doc = sync.build_snapshot().await;
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"containerIP\":\"172.17.0.2\""));
        assert!(json.contains("\"firewall\""));
    }
}
