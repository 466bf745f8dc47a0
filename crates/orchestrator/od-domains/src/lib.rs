//! Domain CRUD with subdomain folding and the DNS/SSL/proxy cascade.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use od_common::events::{DomainChange, DomainChangedEvent, ProxyResyncEvent};
use od_common::validation::{normalize_domain, validate_domain};
use od_common::EventBus;
use od_config::{ConfigStore, DomainRecord, Module, RecordType};
use od_dns::DnsAuthority;

pub const DEFAULT_RECORD_TTL: u32 = 3600;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid domain: {0}")]
    Invalid(String),

    #[error("domain already exists: {0}")]
    Duplicate(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("domain not found: {0}")]
    NotFound(String),
}

pub struct DomainManager {
    store: Arc<ConfigStore>,
    dns: Arc<DnsAuthority>,
    events: Arc<EventBus>,
}

impl DomainManager {
    pub fn new(store: Arc<ConfigStore>, dns: Arc<DnsAuthority>, events: Arc<EventBus>) -> Self {
        Self { store, dns, events }
    }

    pub async fn list(&self) -> Vec<(String, DomainRecord)> {
        self.store
            .read()
            .await
            .domains
            .domains
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Add a domain bound to an app. A domain under an existing domain of
    /// the same app folds into the parent as a subdomain label; anything
    /// else becomes its own record (and its own zone when no covering
    /// zone exists).
    pub async fn add(&self, input: &str, app_name: &str) -> Result<(), DomainError> {
        let domain = normalize_domain(input);
        validate_domain(&domain).map_err(|_| DomainError::Invalid(input.to_string()))?;

        // Pre-checks against one snapshot.
        let fold_parent = {
            let tree = self.store.read().await;
            if tree.domains.domains.contains_key(&domain) {
                return Err(DomainError::Duplicate(domain));
            }
            if tree.apps.by_name(app_name).is_none() {
                return Err(DomainError::AppNotFound(app_name.to_string()));
            }
            // Already folded under some parent?
            for (parent, record) in &tree.domains.domains {
                if let Some(label) = subdomain_label(&domain, parent) {
                    if record.subdomain.iter().any(|s| s == &label) {
                        return Err(DomainError::Duplicate(domain));
                    }
                }
            }
            tree.domains
                .domains
                .iter()
                .find(|(parent, record)| {
                    subdomain_label(&domain, parent).is_some() && record.app_id == app_name
                })
                .map(|(parent, _)| parent.clone())
        };

        if let Some(parent) = fold_parent {
            return self.fold_subdomain(&domain, &parent, app_name).await;
        }
        self.add_full_domain(&domain, app_name).await
    }

    async fn fold_subdomain(
        &self,
        domain: &str,
        parent: &str,
        app_name: &str,
    ) -> Result<(), DomainError> {
        let label = subdomain_label(domain, parent)
            .ok_or_else(|| DomainError::Invalid(domain.to_string()))?;

        self.store
            .update(Module::Domains, |tree| {
                if let Some(record) = tree.domains.domains.get_mut(parent) {
                    record.subdomain.push(label.clone());
                }
            })
            .await;

        // CNAME in the zone that covers the parent.
        let apex = {
            let tree = self.store.read().await;
            tree.dns
                .zones
                .keys()
                .find(|apex| parent == *apex || parent.ends_with(&format!(".{apex}")))
                .cloned()
        };
        let apex = match apex {
            Some(apex) => apex,
            None => {
                self.dns.ensure_zone(parent).await;
                parent.to_string()
            }
        };
        self.dns
            .record(
                &apex,
                RecordType::CNAME,
                domain,
                Some(parent.to_string()),
                None,
                DEFAULT_RECORD_TTL,
                true,
            )
            .await;

        info!(domain, parent, app = app_name, "Subdomain folded into parent");
        // The SAN set of the parent changed; the certificate engine picks
        // this up from the event and re-issues.
        let _ = self.events.domain_changed.send(DomainChangedEvent {
            domain: parent.to_string(),
            app: app_name.to_string(),
            change: DomainChange::SubdomainAdded,
        });
        self.resync_proxy("subdomain added");
        Ok(())
    }

    async fn add_full_domain(&self, domain: &str, app_name: &str) -> Result<(), DomainError> {
        // Reuse a covering zone when one exists (it may belong to another
        // app's apex; its records are left untouched), otherwise the new
        // domain becomes its own apex.
        let apex = {
            let tree = self.store.read().await;
            tree.dns
                .zones
                .keys()
                .find(|apex| domain == **apex || domain.ends_with(&format!(".{apex}")))
                .cloned()
        };
        let apex = match apex {
            Some(apex) => apex,
            None => {
                self.dns.ensure_zone(domain).await;
                domain.to_string()
            }
        };

        // Dynamic A/AAAA: no stored value, resolved per query.
        self.dns
            .record(&apex, RecordType::A, domain, None, None, DEFAULT_RECORD_TTL, true)
            .await;
        self.dns
            .record(&apex, RecordType::AAAA, domain, None, None, DEFAULT_RECORD_TTL, true)
            .await;
        self.dns
            .record(
                &apex,
                RecordType::CNAME,
                &format!("www.{domain}"),
                Some(domain.to_string()),
                None,
                DEFAULT_RECORD_TTL,
                true,
            )
            .await;
        self.dns
            .record(
                &apex,
                RecordType::MX,
                domain,
                Some(domain.to_string()),
                Some(10),
                DEFAULT_RECORD_TTL,
                true,
            )
            .await;
        self.dns
            .record(
                &apex,
                RecordType::TXT,
                &format!("_dmarc.{domain}"),
                Some(format!("v=DMARC1; p=none; rua=mailto:postmaster@{domain}")),
                None,
                DEFAULT_RECORD_TTL,
                true,
            )
            .await;
        self.dns
            .record(
                &apex,
                RecordType::TXT,
                domain,
                Some(self.spf_value().await),
                None,
                DEFAULT_RECORD_TTL,
                false,
            )
            .await;

        self.store
            .update(Module::Domains, |tree| {
                tree.domains.domains.insert(
                    domain.to_string(),
                    DomainRecord {
                        app_id: app_name.to_string(),
                        subdomain: vec!["www".to_string()],
                        created: Utc::now(),
                        cert: None,
                    },
                );
            })
            .await;

        info!(domain, app = app_name, "Domain added");
        let _ = self.events.domain_changed.send(DomainChangedEvent {
            domain: domain.to_string(),
            app: app_name.to_string(),
            change: DomainChange::Added,
        });
        self.resync_proxy("domain added");
        Ok(())
    }

    async fn spf_value(&self) -> String {
        let (v4, v6) = self.dns.dynip().public_addrs().await;
        let mut spf = String::from("v=spf1 a mx");
        if let Some(addr) = v4 {
            spf.push_str(&format!(" ip4:{addr}"));
        }
        if let Some(addr) = v6 {
            spf.push_str(&format!(" ip6:{addr}"));
        }
        spf.push_str(" ~all");
        spf
    }

    /// Delete a domain or a folded subdomain. The zone keeps its apex and
    /// SOA either way. Proxy sync always runs last.
    pub async fn delete(&self, input: &str) -> Result<(), DomainError> {
        let domain = normalize_domain(input);

        let full = {
            let tree = self.store.read().await;
            tree.domains.domains.contains_key(&domain)
        };
        if full {
            let record = self
                .store
                .update(Module::Domains, |tree| tree.domains.domains.remove(&domain))
                .await
                .ok_or_else(|| DomainError::NotFound(domain.clone()))?;

            let apex = {
                let tree = self.store.read().await;
                tree.dns
                    .zones
                    .keys()
                    .find(|apex| domain == **apex || domain.ends_with(&format!(".{apex}")))
                    .cloned()
            };
            if let Some(apex) = apex {
                let names = self.owned_record_names(&domain, &record).await;
                self.dns.remove_records_named(&apex, &names).await;
            }

            info!(domain, "Domain deleted");
            let _ = self.events.domain_changed.send(DomainChangedEvent {
                domain: domain.clone(),
                app: record.app_id,
                change: DomainChange::Deleted,
            });
            self.resync_proxy("domain deleted");
            return Ok(());
        }

        // Subdomain path: find the parent owning this label.
        let parent = {
            let tree = self.store.read().await;
            tree.domains
                .domains
                .iter()
                .find(|(parent, record)| {
                    subdomain_label(&domain, parent)
                        .is_some_and(|label| record.subdomain.iter().any(|s| s == &label))
                })
                .map(|(parent, record)| (parent.clone(), record.app_id.clone()))
        };
        let Some((parent, app)) = parent else {
            return Err(DomainError::NotFound(domain));
        };

        let label = subdomain_label(&domain, &parent)
            .ok_or_else(|| DomainError::NotFound(domain.clone()))?;
        self.store
            .update(Module::Domains, |tree| {
                if let Some(record) = tree.domains.domains.get_mut(&parent) {
                    record.subdomain.retain(|s| s != &label);
                }
            })
            .await;
        self.dns
            .delete(&parent, RecordType::CNAME, &domain, None)
            .await;

        info!(domain, parent, "Subdomain removed");
        // Shrinks the expected SAN set: re-issue the parent certificate.
        let _ = self.events.domain_changed.send(DomainChangedEvent {
            domain: parent,
            app,
            change: DomainChange::SubdomainRemoved,
        });
        self.resync_proxy("subdomain deleted");
        Ok(())
    }

    /// The DNS names this manager created for a domain: the domain itself,
    /// each folded subdomain label, and the service records under them.
    /// Zones can be shared, so any name a more-specific registered domain
    /// owns is excluded — deleting one domain must never strip a
    /// neighbor's records.
    async fn owned_record_names(&self, domain: &str, record: &DomainRecord) -> Vec<String> {
        let mut names = vec![
            domain.to_string(),
            format!("_dmarc.{domain}"),
            format!("_acme-challenge.{domain}"),
        ];
        for label in &record.subdomain {
            names.push(format!("{label}.{domain}"));
            names.push(format!("_acme-challenge.{label}.{domain}"));
        }

        let tree = self.store.read().await;
        names.retain(|name| {
            !tree.domains.domains.keys().any(|other| {
                let covers = name == other || name.ends_with(&format!(".{other}"));
                covers && other.len() > domain.len()
            })
        });
        names
    }

    /// Cascade on app deletion: no Domain may reference a missing app.
    pub async fn delete_by_app(&self, app_name: &str) -> usize {
        let owned: Vec<String> = {
            let tree = self.store.read().await;
            tree.domains
                .domains
                .iter()
                .filter(|(_, record)| record.app_id == app_name)
                .map(|(domain, _)| domain.clone())
                .collect()
        };
        let mut removed = 0;
        for domain in owned {
            if self.delete(&domain).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(app = app_name, removed, "Domains cascaded with app deletion");
        }
        removed
    }

    fn resync_proxy(&self, reason: &str) {
        let _ = self
            .events
            .proxy_resync
            .send(ProxyResyncEvent { reason: reason.to_string() });
    }
}

/// `api.example.com` under parent `example.com` → label `api`; `None`
/// when `domain` is not strictly below `parent`.
fn subdomain_label(domain: &str, parent: &str) -> Option<String> {
    domain
        .strip_suffix(parent)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .filter(|label| !label.is_empty())
        .map(String::from)
}
