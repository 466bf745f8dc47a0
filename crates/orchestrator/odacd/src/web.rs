//! Static-website management: a web site is a document root under the web
//! path plus a config entry; serving is the data plane's job.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::info;

use od_common::events::ProxyResyncEvent;
use od_common::validation::{normalize_domain, validate_domain};
use od_common::EventBus;
use od_config::{ConfigStore, Module, WebSite};

pub struct WebManager {
    store: Arc<ConfigStore>,
    events: Arc<EventBus>,
}

impl WebManager {
    pub fn new(store: Arc<ConfigStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, input: &str) -> Result<String> {
        let domain = normalize_domain(input);
        validate_domain(&domain).map_err(|e| anyhow::anyhow!("{e}"))?;
        {
            let tree = self.store.read().await;
            if tree.web.sites.contains_key(&domain) {
                bail!("web site already exists: {domain}");
            }
        }

        let root = self.store.paths().web_dir().join(&domain);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;

        self.store
            .update(Module::Web, |tree| {
                tree.web.sites.insert(
                    domain.clone(),
                    WebSite { path: domain.clone(), created: Utc::now() },
                );
            })
            .await;
        info!(domain, "Web site created");
        let _ = self.events.proxy_resync.send(ProxyResyncEvent {
            reason: "web site created".to_string(),
        });
        Ok(domain)
    }

    pub async fn delete(&self, input: &str) -> Result<()> {
        let domain = normalize_domain(input);
        let removed = self
            .store
            .update(Module::Web, |tree| tree.web.sites.remove(&domain))
            .await;
        if removed.is_none() {
            bail!("web site not found: {domain}");
        }
        // Document roots are kept on disk; only the record goes.
        info!(domain, "Web site deleted");
        let _ = self.events.proxy_resync.send(ProxyResyncEvent {
            reason: "web site deleted".to_string(),
        });
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.store.read().await.web.sites.keys().cloned().collect()
    }

    /// Watchdog hook: recreate document roots that went missing.
    pub async fn check(&self) {
        let sites: Vec<String> = {
            let tree = self.store.read().await;
            tree.web.sites.values().map(|s| s.path.clone()).collect()
        };
        for path in sites {
            let root = self.store.paths().web_dir().join(&path);
            if !root.exists() {
                let _ = std::fs::create_dir_all(&root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use od_common::OdacPaths;

    async fn manager() -> (tempfile::TempDir, WebManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let events = Arc::new(EventBus::new());
        let store = Arc::new(ConfigStore::load(paths, events.clone()));
        (dir, WebManager::new(store, events))
    }

    #[tokio::test]
    async fn create_list_delete() {
        let (dir, web) = manager().await;
        web.create("Site.Example.com").await.unwrap();
        assert!(dir.path().join("web/site.example.com").is_dir());
        assert_eq!(web.list().await, vec!["site.example.com"]);
        assert!(web.create("site.example.com").await.is_err());
        web.delete("site.example.com").await.unwrap();
        assert!(web.list().await.is_empty());
        assert!(web.delete("site.example.com").await.is_err());
    }

    #[tokio::test]
    async fn check_recreates_missing_root() {
        let (dir, web) = manager().await;
        web.create("a.example.com").await.unwrap();
        std::fs::remove_dir_all(dir.path().join("web/a.example.com")).unwrap();
        web.check().await;
        assert!(dir.path().join("web/a.example.com").is_dir());
    }
}
