//! Modular configuration store.
//!
//! One logical tree, sharded on disk by module file (`apps.json`,
//! `domains.json`, ...). Mutations mark the owning module dirty; a 500 ms
//! ticker flushes dirty modules with an atomic tmp → bak → rename sequence.
//! Disk errors never reach mutators: they are logged and the module stays
//! dirty for the next tick.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use od_common::{EventBus, OdacPaths};

use crate::model::*;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Apps,
    Domains,
    Dns,
    Ssl,
    Web,
    Server,
    Firewall,
    Api,
    Mail,
    Services,
    Hub,
}

impl Module {
    pub const ALL: [Module; 11] = [
        Module::Apps,
        Module::Domains,
        Module::Dns,
        Module::Ssl,
        Module::Web,
        Module::Server,
        Module::Firewall,
        Module::Api,
        Module::Mail,
        Module::Services,
        Module::Hub,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Module::Apps => "apps.json",
            Module::Domains => "domains.json",
            Module::Dns => "dns.json",
            Module::Ssl => "ssl.json",
            Module::Web => "web.json",
            Module::Server => "server.json",
            Module::Firewall => "firewall.json",
            Module::Api => "api.json",
            Module::Mail => "mail.json",
            Module::Services => "services.json",
            Module::Hub => "hub.json",
        }
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".json"))
    }
}

/// The whole in-memory configuration, one field per module file.
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    pub apps: AppsConfig,
    pub domains: DomainsConfig,
    pub dns: DnsConfig,
    pub ssl: SslConfig,
    pub web: WebConfig,
    pub server: ServerConfig,
    pub firewall: FirewallConfig,
    pub api: ApiConfig,
    pub mail: MailConfig,
    pub services: ServicesConfig,
    pub hub: HubConfig,
}

pub struct ConfigStore {
    paths: OdacPaths,
    tree: RwLock<ConfigTree>,
    dirty: Mutex<HashSet<Module>>,
    /// Held for the duration of a flush; `try_lock` failure makes a
    /// concurrent flush a no-op.
    flushing: tokio::sync::Mutex<()>,
    events: Arc<EventBus>,
}

impl ConfigStore {
    /// Load every module from disk, recovering from corruption per module.
    /// Modules whose main file is absent start from defaults and are marked
    /// dirty so the first flush materializes them (the generated API root
    /// key in particular must survive a restart).
    pub fn load(paths: OdacPaths, events: Arc<EventBus>) -> Self {
        let mut fresh = HashSet::new();
        let tree = ConfigTree {
            apps: load_module(&paths, Module::Apps, &mut fresh),
            domains: load_module(&paths, Module::Domains, &mut fresh),
            dns: load_module(&paths, Module::Dns, &mut fresh),
            ssl: load_module(&paths, Module::Ssl, &mut fresh),
            web: load_module(&paths, Module::Web, &mut fresh),
            server: load_module(&paths, Module::Server, &mut fresh),
            firewall: load_module(&paths, Module::Firewall, &mut fresh),
            api: load_module(&paths, Module::Api, &mut fresh),
            mail: load_module(&paths, Module::Mail, &mut fresh),
            services: load_module(&paths, Module::Services, &mut fresh),
            hub: load_module(&paths, Module::Hub, &mut fresh),
        };

        info!(
            apps = tree.apps.apps.len(),
            domains = tree.domains.domains.len(),
            zones = tree.dns.zones.len(),
            "Config loaded"
        );

        Self {
            paths,
            tree: RwLock::new(tree),
            dirty: Mutex::new(fresh),
            flushing: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn paths(&self) -> &OdacPaths {
        &self.paths
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ConfigTree> {
        self.tree.read().await
    }

    /// Mutate the tree; the change is attributed to `module` and flushed on
    /// the next tick.
    pub async fn update<R>(
        &self,
        module: Module,
        f: impl FnOnce(&mut ConfigTree) -> R,
    ) -> R {
        let result = {
            let mut tree = self.tree.write().await;
            f(&mut tree)
        };
        self.mark_dirty(module);
        result
    }

    pub fn mark_dirty(&self, module: Module) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(module);
        }
    }

    pub fn mark_all_dirty(&self) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.extend(Module::ALL);
        }
    }

    /// Mark everything dirty and flush immediately.
    pub async fn force_flush(&self) {
        self.mark_all_dirty();
        self.flush_dirty().await;
    }

    /// Flush ticker. Runs until the task is aborted; the orchestrator calls
    /// `force_flush` once more during shutdown.
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.flush_dirty().await;
        }
    }

    /// Write every dirty module. A flush already in progress makes this a
    /// no-op; the dirty flags stay set and are handled on the next tick.
    pub async fn flush_dirty(&self) {
        let Ok(_flushing) = self.flushing.try_lock() else {
            return;
        };

        let modules: Vec<Module> = {
            match self.dirty.lock() {
                Ok(mut dirty) => dirty.drain().collect(),
                Err(_) => Vec::new(),
            }
        };

        if !modules.is_empty() {
            // Serialize under the read lock so every file reflects one
            // consistent snapshot, then hit the disk without it.
            let payloads: Vec<(Module, Result<String, serde_json::Error>)> = {
                let tree = self.tree.read().await;
                modules
                    .iter()
                    .map(|m| (*m, serialize_module(*m, &tree)))
                    .collect()
            };

            for (module, payload) in payloads {
                match payload {
                    Ok(json) => {
                        if let Err(e) = self.write_module_file(module, &json).await {
                            warn!(module = %module, "Config flush failed, will retry: {e}");
                            self.mark_dirty(module);
                        } else {
                            debug!(module = %module, "Config module flushed");
                            let _ = self.events.config_flushed.send(module.to_string());
                        }
                    }
                    Err(e) => {
                        error!(module = %module, "Config serialization failed: {e}");
                        self.mark_dirty(module);
                    }
                }
            }
        }
    }

    /// Atomic write: `.tmp` → copy current main to `.bak` → rename `.tmp`
    /// over main. A crash at any point leaves either the old main or the
    /// new main plus a backup, never a torn file.
    async fn write_module_file(&self, module: Module, json: &str) -> std::io::Result<()> {
        let main = self.paths.config_dir().join(module.file_name());
        let tmp = self.paths.config_dir().join(format!("{}.tmp", module.file_name()));
        let bak = self.paths.backup_dir().join(format!("{}.bak", module.file_name()));

        tokio::fs::write(&tmp, json).await?;
        if tokio::fs::try_exists(&main).await.unwrap_or(false) {
            tokio::fs::copy(&main, &bak).await?;
        }
        tokio::fs::rename(&tmp, &main).await?;
        Ok(())
    }
}

fn serialize_module(module: Module, tree: &ConfigTree) -> Result<String, serde_json::Error> {
    match module {
        Module::Apps => serde_json::to_string_pretty(&tree.apps),
        Module::Domains => serde_json::to_string_pretty(&tree.domains),
        Module::Dns => serde_json::to_string_pretty(&tree.dns),
        Module::Ssl => serde_json::to_string_pretty(&tree.ssl),
        Module::Web => serde_json::to_string_pretty(&tree.web),
        Module::Server => serde_json::to_string_pretty(&tree.server),
        Module::Firewall => serde_json::to_string_pretty(&tree.firewall),
        Module::Api => serde_json::to_string_pretty(&tree.api),
        Module::Mail => serde_json::to_string_pretty(&tree.mail),
        Module::Services => serde_json::to_string_pretty(&tree.services),
        Module::Hub => serde_json::to_string_pretty(&tree.hub),
    }
}

/// Read one module file: main, then (after quarantining a corrupt main)
/// the `.bak` copy, then defaults.
fn load_module<T>(paths: &OdacPaths, module: Module, fresh: &mut HashSet<Module>) -> T
where
    T: DeserializeOwned + Default,
{
    let main = paths.config_dir().join(module.file_name());
    let bak = paths.backup_dir().join(format!("{}.bak", module.file_name()));

    match std::fs::read_to_string(&main) {
        Ok(content) if !content.trim().is_empty() => match serde_json::from_str(&content) {
            Ok(value) => return value,
            Err(e) => {
                warn!(module = %module, "Config file corrupt ({e}), falling back to backup");
                quarantine(&main);
                fresh.insert(module);
            }
        },
        Ok(_) => {
            warn!(module = %module, "Config file empty, falling back to backup");
            quarantine(&main);
            fresh.insert(module);
        }
        Err(_) => {
            fresh.insert(module);
        }
    }

    match std::fs::read_to_string(&bak) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => {
                info!(module = %module, "Config restored from backup");
                return value;
            }
            Err(e) => {
                warn!(module = %module, "Backup also unreadable ({e}), using defaults");
            }
        },
        Err(_) => {
            debug!(module = %module, "No backup, using defaults");
        }
    }

    T::default()
}

fn quarantine(main: &PathBuf) {
    let corrupted = PathBuf::from(format!("{}.corrupted", main.display()));
    if let Err(e) = std::fs::copy(main, &corrupted) {
        warn!("Failed to quarantine corrupt config file: {e}");
    }
}
