//! The closed control-API action registry and its handlers.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use od_api::dispatch::{ActionTable, opt_str_arg, str_arg};
use od_apps::{AppSupervisor, CreateGitRequest};
use od_config::{ConfigStore, EnvSpec, PortMapping};
use od_domains::DomainManager;

use crate::hub::HubManager;
use crate::mail::MailManager;
use crate::web::WebManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// `server.stop` or signal: plain shutdown.
    Stop,
    /// `update`: a successor instance is taking over; leave the data
    /// plane running for adoption.
    Update,
}

pub struct Components {
    pub store: Arc<ConfigStore>,
    pub supervisor: Arc<AppSupervisor>,
    pub domains: Arc<DomainManager>,
    pub ssl: Arc<od_acme::SslEngine>,
    pub web: Arc<WebManager>,
    pub mail: Arc<MailManager>,
    pub hub: Arc<HubManager>,
    pub shutdown: tokio::sync::mpsc::Sender<ShutdownKind>,
}

pub fn build_action_table(c: Arc<Components>) -> ActionTable {
    let mut table = ActionTable::new();

    table.register("auth", |_data, _progress| async move {
        Ok("authenticated".to_string())
    });

    // ── app.* ───────────────────────────────────────────────────

    let components = c.clone();
    table.register("app.create", move |data, progress| {
        let c = components.clone();
        async move {
            let spec = data.first().cloned().ok_or("missing app specification")?;
            let name = spec
                .get("name")
                .and_then(Value::as_str)
                .ok_or("missing app name")?
                .to_string();
            let kind = spec.get("type").and_then(Value::as_str).unwrap_or("git");
            let env: EnvSpec = spec
                .get("env")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| format!("invalid env: {e}"))?
                .unwrap_or_default();

            match kind {
                "git" => {
                    let request = CreateGitRequest {
                        name: name.clone(),
                        url: spec
                            .get("url")
                            .and_then(Value::as_str)
                            .ok_or("missing git url")?
                            .to_string(),
                        branch: spec
                            .get("branch")
                            .and_then(Value::as_str)
                            .unwrap_or("main")
                            .to_string(),
                        commit_sha: spec
                            .get("commitSha")
                            .and_then(Value::as_str)
                            .map(String::from),
                        token: spec.get("token").and_then(Value::as_str).map(String::from),
                        port: spec.get("port").and_then(Value::as_u64).map(|p| p as u16),
                        env,
                        api: spec.get("api").and_then(Value::as_array).map(|caps| {
                            caps.iter()
                                .filter_map(Value::as_str)
                                .map(String::from)
                                .collect()
                        }),
                    };
                    c.supervisor
                        .create_git(request, progress)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                "container" => {
                    let image = spec
                        .get("image")
                        .and_then(Value::as_str)
                        .ok_or("missing image")?;
                    let ports: Vec<PortMapping> = spec
                        .get("ports")
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e| format!("invalid ports: {e}"))?
                        .unwrap_or_default();
                    let volumes = spec
                        .get("volumes")
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e| format!("invalid volumes: {e}"))?
                        .unwrap_or_default();
                    c.supervisor
                        .create_container(&name, image, ports, volumes, env)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                "script" => {
                    let file = spec
                        .get("file")
                        .and_then(Value::as_str)
                        .ok_or("missing script file")?;
                    c.supervisor
                        .create_script(&name, file, env)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                other => return Err(format!("unknown app type: {other}")),
            }
            Ok(format!("app {name} created"))
        }
    });

    let components = c.clone();
    table.register("app.start", move |data, _progress| {
        let c = components.clone();
        async move {
            let name = str_arg(&data, 0, "name")?;
            c.supervisor.start(&name).await.map_err(|e| e.to_string())?;
            Ok(format!("app {name} started"))
        }
    });

    let components = c.clone();
    table.register("app.restart", move |data, _progress| {
        let c = components.clone();
        async move {
            let name = str_arg(&data, 0, "name")?;
            c.supervisor.restart(&name).await.map_err(|e| e.to_string())?;
            Ok(format!("app {name} restarted"))
        }
    });

    let components = c.clone();
    table.register("app.delete", move |data, _progress| {
        let c = components.clone();
        async move {
            let name = str_arg(&data, 0, "name")?;
            c.supervisor.delete(&name).await.map_err(|e| e.to_string())?;
            // Orphan domains go with the app.
            let removed = c.domains.delete_by_app(&name).await;
            Ok(format!("app {name} deleted ({removed} domains removed)"))
        }
    });

    let components = c.clone();
    table.register("app.list", move |_data, _progress| {
        let c = components.clone();
        async move {
            let apps = c.supervisor.list().await;
            serde_json::to_string(&apps).map_err(|e| e.to_string())
        }
    });

    let components = c.clone();
    table.register("app.redeploy", move |data, progress| {
        let c = components.clone();
        async move {
            // Either a bare name or `{container, commitSha}`.
            let (name, sha) = match data.first() {
                Some(Value::String(name)) => (name.clone(), None),
                Some(Value::Object(map)) => (
                    map.get("container")
                        .and_then(Value::as_str)
                        .ok_or("missing container")?
                        .to_string(),
                    map.get("commitSha").and_then(Value::as_str).map(String::from),
                ),
                _ => return Err("missing redeploy target".to_string()),
            };
            c.supervisor
                .redeploy(&name, sha, progress)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("app {name} redeployed"))
        }
    });

    // ── domain.* / subdomain.* ──────────────────────────────────

    let components = c.clone();
    table.register("domain.add", move |data, _progress| {
        let c = components.clone();
        async move {
            let domain = str_arg(&data, 0, "domain")?;
            let app = str_arg(&data, 1, "app")?;
            c.domains.add(&domain, &app).await.map_err(|e| e.to_string())?;
            Ok(format!("domain {domain} added"))
        }
    });

    let components = c.clone();
    table.register("domain.delete", move |data, _progress| {
        let c = components.clone();
        async move {
            let domain = str_arg(&data, 0, "domain")?;
            c.domains.delete(&domain).await.map_err(|e| e.to_string())?;
            Ok(format!("domain {domain} deleted"))
        }
    });

    let components = c.clone();
    table.register("domain.list", move |_data, _progress| {
        let c = components.clone();
        async move {
            let domains = c.domains.list().await;
            let view: serde_json::Map<String, Value> = domains
                .into_iter()
                .map(|(name, record)| {
                    (name, serde_json::to_value(record).unwrap_or(Value::Null))
                })
                .collect();
            serde_json::to_string(&view).map_err(|e| e.to_string())
        }
    });

    let components = c.clone();
    table.register("subdomain.create", move |data, _progress| {
        let c = components.clone();
        async move {
            let fqdn = str_arg(&data, 0, "subdomain")?;
            let app = str_arg(&data, 1, "app")?;
            c.domains.add(&fqdn, &app).await.map_err(|e| e.to_string())?;
            Ok(format!("subdomain {fqdn} added"))
        }
    });

    let components = c.clone();
    table.register("subdomain.delete", move |data, _progress| {
        let c = components.clone();
        async move {
            let fqdn = str_arg(&data, 0, "subdomain")?;
            c.domains.delete(&fqdn).await.map_err(|e| e.to_string())?;
            Ok(format!("subdomain {fqdn} deleted"))
        }
    });

    let components = c.clone();
    table.register("subdomain.list", move |data, _progress| {
        let c = components.clone();
        async move {
            let parent = str_arg(&data, 0, "domain")?;
            let tree = c.store.read().await;
            let labels = tree
                .domains
                .domains
                .get(&parent)
                .map(|record| record.subdomain.clone())
                .ok_or(format!("domain not found: {parent}"))?;
            serde_json::to_string(&labels).map_err(|e| e.to_string())
        }
    });

    // ── ssl / web / mail / server ───────────────────────────────

    let components = c.clone();
    table.register("ssl.renew", move |data, _progress| {
        let c = components.clone();
        async move {
            match opt_str_arg(&data, 0) {
                Some(domain) => {
                    {
                        let tree = c.store.read().await;
                        if !tree.domains.domains.contains_key(&domain) {
                            return Err(format!("domain not found: {domain}"));
                        }
                    }
                    c.ssl.request_renewal(&domain, true).await;
                    Ok(format!("renewal requested for {domain}"))
                }
                None => {
                    c.ssl.check().await;
                    Ok("renewal check queued for all domains".to_string())
                }
            }
        }
    });

    let components = c.clone();
    table.register("web.create", move |data, _progress| {
        let c = components.clone();
        async move {
            let domain = str_arg(&data, 0, "domain")?;
            let created = c.web.create(&domain).await.map_err(|e| e.to_string())?;
            Ok(format!("web site {created} created"))
        }
    });

    let components = c.clone();
    table.register("web.delete", move |data, _progress| {
        let c = components.clone();
        async move {
            let domain = str_arg(&data, 0, "domain")?;
            c.web.delete(&domain).await.map_err(|e| e.to_string())?;
            Ok(format!("web site {domain} deleted"))
        }
    });

    let components = c.clone();
    table.register("web.list", move |_data, _progress| {
        let c = components.clone();
        async move { serde_json::to_string(&c.web.list().await).map_err(|e| e.to_string()) }
    });

    let components = c.clone();
    table.register("mail.create", move |data, _progress| {
        let c = components.clone();
        async move {
            let address = str_arg(&data, 0, "address")?;
            let password = str_arg(&data, 1, "password")?;
            c.mail.create(&address, &password).await.map_err(|e| e.to_string())?;
            Ok(format!("mail account {address} created"))
        }
    });

    let components = c.clone();
    table.register("mail.delete", move |data, _progress| {
        let c = components.clone();
        async move {
            let address = str_arg(&data, 0, "address")?;
            c.mail.delete(&address).await.map_err(|e| e.to_string())?;
            Ok(format!("mail account {address} deleted"))
        }
    });

    let components = c.clone();
    table.register("mail.list", move |_data, _progress| {
        let c = components.clone();
        async move { serde_json::to_string(&c.mail.list().await).map_err(|e| e.to_string()) }
    });

    let components = c.clone();
    table.register("mail.password", move |data, _progress| {
        let c = components.clone();
        async move {
            let address = str_arg(&data, 0, "address")?;
            let password = str_arg(&data, 1, "password")?;
            c.mail
                .set_password(&address, &password)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("password updated for {address}"))
        }
    });

    let components = c.clone();
    table.register("mail.send", move |data, _progress| {
        let c = components.clone();
        async move {
            let from = str_arg(&data, 0, "from")?;
            let to = str_arg(&data, 1, "to")?;
            let subject = str_arg(&data, 2, "subject")?;
            let body = str_arg(&data, 3, "body")?;
            let id = c
                .mail
                .send(&from, &to, &subject, &body)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("queued {id}"))
        }
    });

    let components = c.clone();
    table.register("hub.status", move |_data, _progress| {
        let c = components.clone();
        async move {
            serde_json::to_string(&c.hub.status().await).map_err(|e| e.to_string())
        }
    });

    let components = c.clone();
    table.register("hub.fetched", move |data, _progress| {
        let c = components.clone();
        async move {
            let url = str_arg(&data, 0, "url")?;
            let etag = opt_str_arg(&data, 1);
            c.hub.mark_fetched(&url, etag).await;
            Ok("hub index recorded".to_string())
        }
    });

    let components = c.clone();
    table.register("server.stop", move |_data, _progress| {
        let c = components.clone();
        async move {
            info!("Shutdown requested over the API");
            let _ = c.shutdown.send(ShutdownKind::Stop).await;
            Ok("stopping".to_string())
        }
    });

    let components = c.clone();
    table.register("update", move |_data, _progress| {
        let c = components.clone();
        async move {
            let exe = std::env::current_exe().map_err(|e| e.to_string())?;
            let instance = uuid::Uuid::new_v4().to_string();
            let previous =
                std::env::var("ODAC_INSTANCE_ID").unwrap_or_else(|_| "main".to_string());
            tokio::process::Command::new(exe)
                .env("ODAC_UPDATE_MODE", "1")
                .env("ODAC_INSTANCE_ID", &instance)
                .env("ODAC_PREVIOUS_INSTANCE_ID", &previous)
                .spawn()
                .map_err(|e| format!("could not spawn successor: {e}"))?;
            info!(instance, "Successor instance spawned, handing over");
            let _ = c.shutdown.send(ShutdownKind::Update).await;
            Ok(format!("updating, successor {instance}"))
        }
    });

    table
}
