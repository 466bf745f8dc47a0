//! Renewal engine: decides *when* a domain needs a certificate and runs
//! the ACME DNS-01 flow, one in-flight order per domain.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::{debug, error, info, warn};

use od_common::EventBus;
use od_common::events::SslRenewedEvent;
use od_config::{CertMaterial, ConfigStore, DomainCert, Module};

use crate::san;
use crate::selfsigned;
use crate::types::{
    AcmeError, AcmeResult, ISSUED_LIFETIME_DAYS, RENEWAL_THRESHOLD_DAYS, SAN_CHECK_INTERVAL,
    backoff_for,
};

pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

const ORDER_POLL_LIMIT: u32 = 15;
const CERT_POLL_LIMIT: u32 = 15;

/// DNS-01 publication seam; implemented against the DNS authority by the
/// orchestrator so this crate stays independent of it.
#[async_trait]
pub trait ChallengeDns: Send + Sync {
    /// Publish `_acme-challenge.<host>` with the given value. Returns
    /// whether a zone covering `host` exists.
    async fn publish_txt(&self, host: &str, value: &str) -> bool;

    async fn remove_txt(&self, host: &str, value: &str);
}

#[derive(Default)]
struct DomainSslState {
    errors: u32,
    blocked_until: Option<Instant>,
    last_san_check: Option<Instant>,
}

#[derive(Default)]
struct EngineState {
    in_progress: HashSet<String>,
    queued: HashSet<String>,
    domains: HashMap<String, DomainSslState>,
}

pub struct SslEngine {
    store: Arc<ConfigStore>,
    challenge: Arc<dyn ChallengeDns>,
    events: Arc<EventBus>,
    directory_url: String,
    state: Mutex<EngineState>,
}

impl SslEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        challenge: Arc<dyn ChallengeDns>,
        events: Arc<EventBus>,
        directory_url: Option<String>,
    ) -> Self {
        Self {
            store,
            challenge,
            events,
            directory_url: directory_url
                .unwrap_or_else(|| LETSENCRYPT_PRODUCTION.to_string()),
            state: Mutex::new(EngineState::default()),
        }
    }

    // ── self-signed fallback ────────────────────────────────────

    /// Boot step: make sure the system fallback certificate exists and is
    /// not expired.
    pub async fn ensure_selfsigned(&self) -> AcmeResult<()> {
        let usable = {
            let tree = self.store.read().await;
            tree.ssl
                .ssl
                .as_ref()
                .is_some_and(|material| material.expiry > Utc::now())
        };
        if usable {
            return Ok(());
        }

        info!("Generating self-signed fallback certificate");
        let material = selfsigned::generate("odac.local")?;
        let paths = self.store.paths().clone();
        tokio::fs::write(paths.ssl_key_path("odac"), &material.key).await?;
        tokio::fs::write(paths.ssl_cert_path("odac"), &material.cert).await?;
        self.store
            .update(Module::Ssl, |tree| tree.ssl.ssl = Some(material))
            .await;
        Ok(())
    }

    // ── renewal triggers ────────────────────────────────────────

    /// Watchdog hook: enqueue a renewal for every domain that needs one
    /// and is not backing off.
    pub async fn check(self: &Arc<Self>) {
        let domains: Vec<String> = {
            let tree = self.store.read().await;
            tree.domains.domains.keys().cloned().collect()
        };
        for domain in domains {
            if let Some(reason) = self.needs_renewal(&domain).await {
                debug!(domain, reason, "Certificate renewal required");
                self.request_renewal(&domain, false).await;
            }
        }
    }

    /// Why `domain` needs a new certificate, if it does. SAN comparisons
    /// run at most every five minutes per domain.
    async fn needs_renewal(&self, domain: &str) -> Option<&'static str> {
        let (material, expected) = {
            let tree = self.store.read().await;
            let record = tree.domains.domains.get(domain)?;
            (
                record.cert.as_ref().and_then(|c| c.ssl.clone()),
                record.expected_sans(domain),
            )
        };

        let Some(material) = material else {
            return Some("no certificate");
        };
        if !self.store.paths().ssl_cert_path(domain).exists() {
            return Some("certificate missing on disk");
        }
        if material.expiry - Utc::now() < ChronoDuration::days(RENEWAL_THRESHOLD_DAYS) {
            return Some("expiring");
        }

        // Throttled SAN comparison.
        let check_due = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.domains.entry(domain.to_string()).or_default();
            let due = entry
                .last_san_check
                .is_none_or(|at| at.elapsed() >= SAN_CHECK_INTERVAL);
            if due {
                entry.last_san_check = Some(Instant::now());
            }
            due
        };
        if check_due {
            match san::inspect_pem(&material.cert) {
                Ok(facts) => {
                    if !san::missing_sans(&facts, &expected).is_empty() {
                        return Some("san mismatch");
                    }
                }
                Err(e) => {
                    warn!(domain, "Stored certificate unreadable: {e}");
                    return Some("unparseable certificate");
                }
            }
        }
        None
    }

    /// Request a renewal. `explicit` requests bypass the backoff window.
    /// If an order for this domain is already in flight the request is
    /// queued and re-run after the current one finishes.
    pub fn request_renewal<'a>(
        self: &'a Arc<Self>,
        domain: &'a str,
        explicit: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.in_progress.contains(domain) {
                    state.queued.insert(domain.to_string());
                    debug!(domain, "Renewal already in flight, queued");
                    return;
                }
                if !explicit {
                    let entry = state.domains.entry(domain.to_string()).or_default();
                    if entry.blocked_until.is_some_and(|until| Instant::now() < until) {
                        return;
                    }
                }
                state.in_progress.insert(domain.to_string());
            }

            let engine = Arc::clone(self);
            let domain = domain.to_string();
            tokio::spawn(async move {
                engine.run_renewal(domain).await;
            });
        })
    }

    async fn run_renewal(self: Arc<Self>, domain: String) {
        let result = self.issue(&domain).await;

        match &result {
            Ok(names) => {
                info!(domain, sans = names.len(), "Certificate issued and saved");
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let entry = state.domains.entry(domain.clone()).or_default();
                entry.errors = 0;
                entry.blocked_until = None;
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let entry = state.domains.entry(domain.clone()).or_default();
                entry.errors += 1;
                let delay = backoff_for(entry.errors);
                entry.blocked_until = Some(Instant::now() + delay);
                error!(
                    domain,
                    errors = entry.errors,
                    retry_in_secs = delay.as_secs(),
                    "Certificate issuance failed: {e}"
                );
            }
        }

        // Release the in-flight slot on every path, then serve a queued
        // request with a clean error interval.
        let rerun = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_progress.remove(&domain);
            if state.queued.remove(&domain) {
                let entry = state.domains.entry(domain.clone()).or_default();
                entry.errors = 0;
                entry.blocked_until = None;
                true
            } else {
                false
            }
        };

        if let Ok(names) = result {
            let _ = self.events.ssl_renewed.send(SslRenewedEvent {
                domain: domain.clone(),
                names,
            });
        }
        if rerun {
            self.request_renewal(&domain, true).await;
        }
    }

    // ── ACME order flow ─────────────────────────────────────────

    async fn issue(&self, domain: &str) -> AcmeResult<Vec<String>> {
        let expected = {
            let tree = self.store.read().await;
            let record = tree
                .domains
                .domains
                .get(domain)
                .ok_or_else(|| AcmeError::DomainNotFound(domain.to_string()))?;
            record.expected_sans(domain)
        };

        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let identifiers: Vec<Identifier> =
            expected.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = account.new_order(&NewOrder { identifiers: &identifiers }).await?;

        let authorizations = order.authorizations().await?;
        let mut published: Vec<(String, String)> = Vec::new();

        let challenge_result = async {
            for authz in &authorizations {
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(AcmeError::OrderFailed(format!(
                            "authorization in state {status:?}"
                        )));
                    }
                }
                let challenge = authz
                    .challenges
                    .iter()
                    .find(|c| c.r#type == ChallengeType::Dns01)
                    .ok_or_else(|| {
                        AcmeError::OrderFailed("no dns-01 challenge offered".to_string())
                    })?;
                #[allow(unreachable_patterns)]
                let host = match &authz.identifier {
                    Identifier::Dns(host) => host.clone(),
                    _ => continue,
                };
                let value = order.key_authorization(challenge).dns_value();

                if !self.challenge.publish_txt(&host, &value).await {
                    return Err(AcmeError::ChallengePublish(host));
                }
                published.push((host, value));
                order.set_challenge_ready(&challenge.url).await?;
            }

            // Let the CA validate.
            let mut delay = Duration::from_secs(1);
            let mut tries = 0;
            loop {
                tokio::time::sleep(delay).await;
                let state = order.refresh().await?;
                match state.status {
                    OrderStatus::Ready => break,
                    OrderStatus::Invalid => {
                        return Err(AcmeError::OrderFailed("order became invalid".to_string()));
                    }
                    _ => {}
                }
                tries += 1;
                if tries >= ORDER_POLL_LIMIT {
                    return Err(AcmeError::OrderFailed(
                        "order did not become ready in time".to_string(),
                    ));
                }
                delay = (delay * 2).min(Duration::from_secs(10));
            }

            // CSR with CN = domain, SANs = expected set.
            let mut params = CertificateParams::new(expected.clone())?;
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, domain);
            params.distinguished_name = dn;
            let key_pair = KeyPair::generate()?;
            let csr = params.serialize_request(&key_pair)?;
            order.finalize(csr.der()).await?;

            let mut tries = 0;
            let cert_chain = loop {
                match order.certificate().await? {
                    Some(chain) => break chain,
                    None => {
                        tries += 1;
                        if tries >= CERT_POLL_LIMIT {
                            return Err(AcmeError::OrderFailed(
                                "certificate not available after finalize".to_string(),
                            ));
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            };

            Ok((cert_chain, key_pair.serialize_pem()))
        }
        .await;

        // Challenge records come down on success and failure alike.
        for (host, value) in &published {
            self.challenge.remove_txt(host, value).await;
        }

        let (cert_chain, key_pem) = challenge_result?;
        self.save(domain, &key_pem, &cert_chain).await?;
        Ok(expected)
    }

    async fn save(&self, domain: &str, key_pem: &str, cert_pem: &str) -> AcmeResult<()> {
        let expiry = match san::inspect_pem(cert_pem) {
            Ok(facts) => facts.not_after,
            Err(e) => {
                warn!(domain, "Could not read notAfter from issued chain: {e}");
                Utc::now() + ChronoDuration::days(ISSUED_LIFETIME_DAYS)
            }
        };

        let paths = self.store.paths().clone();
        tokio::fs::write(paths.ssl_key_path(domain), key_pem).await?;
        tokio::fs::write(paths.ssl_cert_path(domain), cert_pem).await?;

        let material = CertMaterial {
            key: key_pem.to_string(),
            cert: cert_pem.to_string(),
            expiry,
        };
        self.store
            .update(Module::Domains, |tree| {
                if let Some(record) = tree.domains.domains.get_mut(domain) {
                    record.cert.get_or_insert_with(DomainCert::default).ssl = Some(material);
                }
            })
            .await;
        Ok(())
    }

    /// Event loop: domain changes trigger a fresh SAN evaluation, which in
    /// turn enqueues a renewal when the cert no longer covers the set.
    pub async fn run_domain_watcher(self: Arc<Self>) {
        let mut rx = self.events.domain_changed.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    debug!(domain = event.domain, "Domain changed, evaluating certificate");
                    self.request_renewal(&event.domain, false).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use od_common::OdacPaths;
    use od_config::DomainRecord;

    struct MockChallenge;

    #[async_trait]
    impl ChallengeDns for MockChallenge {
        async fn publish_txt(&self, _host: &str, _value: &str) -> bool {
            true
        }
        async fn remove_txt(&self, _host: &str, _value: &str) {}
    }

    async fn engine_with_domain(
        subs: Vec<String>,
        cert_names: Option<Vec<&str>>,
        expiry_days: i64,
    ) -> (tempfile::TempDir, Arc<SslEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths.clone(), Arc::new(EventBus::new())));

        let cert = cert_names.map(|names| {
            let params = CertificateParams::new(
                names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
            .unwrap();
            let key = KeyPair::generate().unwrap();
            let pem = params.self_signed(&key).unwrap().pem();
            std::fs::write(paths.ssl_cert_path("example.com"), &pem).unwrap();
            DomainCert {
                ssl: Some(CertMaterial {
                    key: key.serialize_pem(),
                    cert: pem,
                    expiry: Utc::now() + ChronoDuration::days(expiry_days),
                }),
            }
        });

        store
            .update(Module::Domains, |tree| {
                tree.domains.domains.insert(
                    "example.com".to_string(),
                    DomainRecord {
                        app_id: "myapp".to_string(),
                        subdomain: subs,
                        created: Utc::now(),
                        cert,
                    },
                );
            })
            .await;

        let engine = Arc::new(SslEngine::new(
            store,
            Arc::new(MockChallenge),
            Arc::new(EventBus::new()),
            None,
        ));
        (dir, engine)
    }

    #[tokio::test]
    async fn missing_cert_triggers() {
        let (_dir, engine) = engine_with_domain(vec!["www".into()], None, 0).await;
        assert_eq!(engine.needs_renewal("example.com").await, Some("no certificate"));
    }

    #[tokio::test]
    async fn expiring_cert_triggers() {
        let (_dir, engine) = engine_with_domain(
            vec!["www".into()],
            Some(vec!["example.com", "www.example.com"]),
            10,
        )
        .await;
        assert_eq!(engine.needs_renewal("example.com").await, Some("expiring"));
    }

    #[tokio::test]
    async fn san_mismatch_triggers() {
        let (_dir, engine) = engine_with_domain(
            vec!["www".into(), "api".into()],
            Some(vec!["example.com", "www.example.com"]),
            80,
        )
        .await;
        assert_eq!(engine.needs_renewal("example.com").await, Some("san mismatch"));
    }

    #[tokio::test]
    async fn covering_cert_does_not_trigger() {
        let (_dir, engine) = engine_with_domain(
            vec!["www".into()],
            Some(vec!["example.com", "www.example.com"]),
            80,
        )
        .await;
        assert_eq!(engine.needs_renewal("example.com").await, None);
    }

    #[tokio::test]
    async fn san_check_is_throttled() {
        let (_dir, engine) = engine_with_domain(
            vec!["www".into(), "api".into()],
            Some(vec!["example.com", "www.example.com"]),
            80,
        )
        .await;
        // First evaluation performs the SAN comparison...
        assert_eq!(engine.needs_renewal("example.com").await, Some("san mismatch"));
        // ...the immediate second one is inside the throttle window.
        assert_eq!(engine.needs_renewal("example.com").await, None);
    }

    #[tokio::test]
    async fn concurrent_request_queues() {
        let (_dir, engine) = engine_with_domain(vec![], None, 0).await;
        {
            let mut state = engine.state.lock().unwrap();
            state.in_progress.insert("example.com".to_string());
        }
        engine.request_renewal("example.com", true).await;
        let state = engine.state.lock().unwrap();
        assert!(state.queued.contains("example.com"));
    }

    #[tokio::test]
    async fn selfsigned_bootstrap_persists() {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths.clone(), Arc::new(EventBus::new())));
        let engine = SslEngine::new(
            store.clone(),
            Arc::new(MockChallenge),
            Arc::new(EventBus::new()),
            None,
        );
        engine.ensure_selfsigned().await.unwrap();
        assert!(paths.ssl_cert_path("odac").exists());
        assert!(store.read().await.ssl.ssl.is_some());

        // Second call keeps the existing material.
        let before = store.read().await.ssl.ssl.clone().unwrap().cert;
        engine.ensure_selfsigned().await.unwrap();
        assert_eq!(store.read().await.ssl.ssl.clone().unwrap().cert, before);
    }
}
