//! Interface adapters between components that must not depend on each
//! other directly: the certificate engine publishes DNS-01 records through
//! the authority, proxy sync resolves container IPs through the runtime.

use std::sync::Arc;

use async_trait::async_trait;

use od_acme::ChallengeDns;
use od_apps::supervisor::container_name;
use od_container::ContainerRuntime;
use od_dns::DnsAuthority;
use od_proxy::BackendResolver;

pub struct AuthorityChallenge {
    pub dns: Arc<DnsAuthority>,
}

#[async_trait]
impl ChallengeDns for AuthorityChallenge {
    async fn publish_txt(&self, host: &str, value: &str) -> bool {
        self.dns.set_acme_challenge(host, value).await
    }

    async fn remove_txt(&self, host: &str, value: &str) {
        self.dns.clear_acme_challenge(host, value).await;
    }
}

pub struct RuntimeBackendResolver {
    pub runtime: Arc<dyn ContainerRuntime>,
}

#[async_trait]
impl BackendResolver for RuntimeBackendResolver {
    async fn container_ip(&self, app_name: &str) -> Option<String> {
        self.runtime
            .container_ip(&container_name(app_name))
            .await
            .ok()
            .flatten()
    }
}
