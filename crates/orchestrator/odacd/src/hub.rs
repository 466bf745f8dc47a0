//! Recipe-hub bookkeeping. The fetcher itself is an external collaborator:
//! it reads the cache state over `hub.status` (index URL plus the etag for
//! a conditional request) and reports a completed fetch over `hub.fetched`.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use od_config::{ConfigStore, HubConfig, Module};

pub struct HubManager {
    store: Arc<ConfigStore>,
}

impl HubManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Cache snapshot handed to the fetcher before a conditional request.
    pub async fn status(&self) -> HubConfig {
        self.store.read().await.hub.clone()
    }

    /// Record a completed index fetch reported by the external fetcher.
    pub async fn mark_fetched(&self, url: &str, etag: Option<String>) {
        self.store
            .update(Module::Hub, |tree| {
                tree.hub.index_url = Some(url.to_string());
                tree.hub.etag = etag;
                tree.hub.fetched = Some(Utc::now());
            })
            .await;
        info!(url, "Hub index fetch recorded");
    }

    /// Watchdog hook; the hub holds cache metadata only, nothing to
    /// reconcile against a runtime.
    pub async fn check(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use od_common::{EventBus, OdacPaths};

    async fn manager() -> (tempfile::TempDir, HubManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        (dir, HubManager::new(store))
    }

    #[tokio::test]
    async fn fetch_report_persists_and_shows_in_status() {
        let (_dir, hub) = manager().await;
        let empty = hub.status().await;
        assert!(empty.index_url.is_none());
        assert!(empty.fetched.is_none());

        hub.mark_fetched("https://hub.odac.dev/index.json", Some("\"abc123\"".into()))
            .await;

        let status = hub.status().await;
        assert_eq!(status.index_url.as_deref(), Some("https://hub.odac.dev/index.json"));
        assert_eq!(status.etag.as_deref(), Some("\"abc123\""));
        assert!(status.fetched.is_some());
    }

    #[tokio::test]
    async fn not_modified_report_clears_stale_etag() {
        let (_dir, hub) = manager().await;
        hub.mark_fetched("https://hub.odac.dev/index.json", Some("\"abc\"".into()))
            .await;
        hub.mark_fetched("https://hub.odac.dev/index.json", None).await;
        let status = hub.status().await;
        assert!(status.etag.is_none());
        assert!(status.fetched.is_some());
    }
}
