mod actions;
mod adapters;
mod hub;
mod mail;
mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use od_acme::SslEngine;
use od_api::{ApiServer, AuthState};
use od_apps::AppSupervisor;
use od_apps::supervisor::container_name;
use od_common::{EnvConfig, EventBus, OdacPaths};
use od_config::{ConfigStore, Module, ServerInfo};
use od_container::{ContainerRuntime, DockerCli};
use od_dns::{DnsAuthority, DnsServer, DynIpResolver, SystemdResolvedOps};
use od_domains::DomainManager;
use od_git::GitClient;
use od_proxy::{ProxyEndpoint, ProxySupervisor, ProxySync};

use crate::actions::{Components, ShutdownKind, build_action_table};
use crate::adapters::{AuthorityChallenge, RuntimeBackendResolver};
use crate::hub::HubManager;
use crate::mail::MailManager;
use crate::web::WebManager;

const WATCHDOG_TICK: Duration = Duration::from_secs(1);
const MAINTENANCE_EVERY_TICKS: u64 = 60;
const UPSTREAM_RESOLVER: &str = "1.1.1.1:53";

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvConfig::from_env();

    let default_filter = if env.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.parse().expect("valid filter")),
        )
        .init();

    info!(
        instance = env.instance_id,
        update_mode = env.update_mode,
        "odacd starting"
    );

    let paths = OdacPaths::from_env();
    paths.ensure().context("failed to prepare state directory")?;

    // ── config store ────────────────────────────────────────────
    let events = Arc::new(EventBus::new());
    let store = Arc::new(ConfigStore::load(paths.clone(), events.clone()));
    let flush_task = tokio::spawn(Arc::clone(&store).run_flush_loop());

    store
        .update(Module::Server, |tree| {
            tree.server.server = Some(ServerInfo {
                pid: std::process::id(),
                started: Utc::now(),
                watchdog: true,
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            });
        })
        .await;

    // ── components, dependency order ────────────────────────────
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli);
    let supervisor = AppSupervisor::new(
        store.clone(),
        runtime.clone(),
        Arc::new(GitClient),
        events.clone(),
    );

    let dynip = Arc::new(DynIpResolver::new(
        UPSTREAM_RESOLVER.parse().expect("valid upstream addr"),
    ));
    let authority = Arc::new(DnsAuthority::new(store.clone(), dynip.clone()));
    let resolver_ops = Arc::new(SystemdResolvedOps::new());
    let (dns_server, udp, tcp) = match DnsServer::bind(
        authority.clone(),
        store.clone(),
        resolver_ops,
    )
    .await
    {
        Ok(bound) => bound,
        Err(e) => {
            error!("DNS bind failed: {e}");
            return Err(e);
        }
    };
    let dns_server = Arc::new(dns_server);
    tokio::spawn(Arc::clone(&dns_server).run_udp(udp));
    tokio::spawn(Arc::clone(&dns_server).run_tcp(tcp));

    let ssl = Arc::new(SslEngine::new(
        store.clone(),
        Arc::new(AuthorityChallenge { dns: authority.clone() }),
        events.clone(),
        None,
    ));
    if let Err(e) = ssl.ensure_selfsigned().await {
        warn!("Self-signed bootstrap failed: {e}");
    }
    tokio::spawn(Arc::clone(&ssl).run_domain_watcher());

    let web = Arc::new(WebManager::new(store.clone(), events.clone()));
    let mail = Arc::new(MailManager::new(store.clone()));
    let hub = Arc::new(HubManager::new(store.clone()));
    let domains = Arc::new(DomainManager::new(
        store.clone(),
        authority.clone(),
        events.clone(),
    ));

    // ── data plane ──────────────────────────────────────────────
    let proxy_supervisor = Arc::new(ProxySupervisor::new(
        paths.clone(),
        &env.instance_id,
        env.update_mode,
    ));
    if let Err(e) = proxy_supervisor.start().await {
        warn!("Data-plane start failed (will retry on watchdog): {e}");
    }
    let proxy_sync = ProxySync::new(
        store.clone(),
        Arc::new(RuntimeBackendResolver { runtime: runtime.clone() }),
        events.clone(),
        ProxyEndpoint::Unix(proxy_supervisor.socket_path()),
    );
    tokio::spawn(Arc::clone(&proxy_sync).run_event_loop());
    proxy_sync.sync().await;

    // ── control API ─────────────────────────────────────────────
    let auth = AuthState::new(store.clone());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<ShutdownKind>(4);
    let components = Arc::new(Components {
        store: store.clone(),
        supervisor: supervisor.clone(),
        domains: domains.clone(),
        ssl: ssl.clone(),
        web: web.clone(),
        mail: mail.clone(),
        hub: hub.clone(),
        shutdown: shutdown_tx.clone(),
    });
    let api = ApiServer::new(auth.clone(), build_action_table(components));
    tokio::spawn(Arc::clone(&api).run_tcp());
    {
        let api = Arc::clone(&api);
        let socket = paths.api_socket().to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = api.run_unix(&socket).await {
                error!("API unix listener failed: {e}");
            }
        });
    }
    tokio::spawn(run_token_registrar(
        auth.clone(),
        store.clone(),
        runtime.clone(),
        events.clone(),
    ));

    // ── watchdog ────────────────────────────────────────────────
    {
        let supervisor = supervisor.clone();
        let ssl = ssl.clone();
        let web = web.clone();
        let mail = mail.clone();
        let hub = hub.clone();
        let dns_server = dns_server.clone();
        let proxy_supervisor = proxy_supervisor.clone();
        let dynip = dynip.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                ticks += 1;

                supervisor.check().await;
                supervisor.check_services().await;
                ssl.check().await;
                web.check().await;
                mail.check().await;
                hub.check().await;
                dns_server.check().await;
                proxy_supervisor.check().await;

                if ticks % MAINTENANCE_EVERY_TICKS == 0 {
                    supervisor.rotate_logs().await;
                    dynip.refresh_if_stale().await;
                }
            }
        });
    }

    info!("odacd started");

    // ── shutdown ────────────────────────────────────────────────
    let mut signals = Signals::new([SIGTERM, SIGINT]).context("signal handler")?;
    let kind = tokio::select! {
        signal = signals.next() => {
            info!(?signal, "Signal received, shutting down");
            ShutdownKind::Stop
        }
        kind = shutdown_rx.recv() => kind.unwrap_or(ShutdownKind::Stop),
    };

    // Data-plane components stop in reverse start order; during an update
    // handover the proxy stays up for the successor to adopt.
    if kind == ShutdownKind::Stop {
        proxy_supervisor.stop().await;
        dns_server.shutdown().await;
    }
    flush_task.abort();
    let _ = flush_task.await;
    store.force_flush().await;
    info!("odacd stopped");
    Ok(())
}

/// Keeps the capability-token table and the TCP allow-set in lockstep with
/// app lifecycle: an app holding API capabilities gets its token and its
/// container IP admitted while it runs.
async fn run_token_registrar(
    auth: Arc<AuthState>,
    store: Arc<ConfigStore>,
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<EventBus>,
) {
    let mut rx = events.app_status.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(_) => break,
        };

        match event.status.as_str() {
            "running" => {
                let has_api = {
                    let tree = store.read().await;
                    tree.apps.by_name(&event.app).is_some_and(|a| a.api.is_some())
                };
                if has_api {
                    auth.register_identity(&event.app).await;
                    if let Ok(Some(ip)) = runtime.container_ip(&container_name(&event.app)).await
                    {
                        if let Ok(addr) = ip.parse() {
                            auth.allow_ip(addr).await;
                        }
                    }
                    info!(app = event.app, "API capability token registered");
                }
            }
            "stopped" | "deleted" => {
                auth.unregister_identity(&event.app).await;
                let cached_ip = {
                    let tree = store.read().await;
                    tree.apps
                        .by_name(&event.app)
                        .and_then(|a| a.container_ip.clone())
                };
                if let Some(addr) = cached_ip.and_then(|ip| ip.parse().ok()) {
                    auth.disallow_ip(addr).await;
                }
            }
            _ => {}
        }
    }
}
