//! Zone storage and authoritative answer logic.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use od_config::{ConfigStore, Module, RecordType, SoaRecord, Zone, ZoneRecord};

use crate::dynip::{DynIpResolver, is_public};
use crate::wire::{self, Message, RData, Record};

pub const ACME_CHALLENGE_TTL: u32 = 100;

/// One computed response: rcode plus answer/authority sections.
pub struct AnswerSet {
    pub rcode: u8,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
}

impl AnswerSet {
    fn nxdomain(authority: Vec<Record>) -> Self {
        Self { rcode: wire::RCODE_NXDOMAIN, answers: Vec::new(), authority }
    }

    fn nodata(authority: Vec<Record>) -> Self {
        Self { rcode: wire::RCODE_NOERROR, answers: Vec::new(), authority }
    }

    fn answers(answers: Vec<Record>) -> Self {
        Self { rcode: wire::RCODE_NOERROR, answers, authority: Vec::new() }
    }
}

pub struct DnsAuthority {
    store: Arc<ConfigStore>,
    dynip: Arc<DynIpResolver>,
}

impl DnsAuthority {
    pub fn new(store: Arc<ConfigStore>, dynip: Arc<DynIpResolver>) -> Self {
        Self { store, dynip }
    }

    pub fn dynip(&self) -> &Arc<DynIpResolver> {
        &self.dynip
    }

    // ── zone mutation ───────────────────────────────────────────

    /// Create the zone if missing; returns whether it was created.
    pub async fn ensure_zone(&self, apex: &str) -> bool {
        let apex = apex.to_lowercase();
        self.store
            .update(Module::Dns, |tree| {
                if tree.dns.zones.contains_key(&apex) {
                    false
                } else {
                    tree.dns.zones.insert(
                        apex.clone(),
                        Zone { soa: SoaRecord::for_apex(&apex), records: Vec::new() },
                    );
                    true
                }
            })
            .await
    }

    /// Add or update a record. With `unique` (the default), existing
    /// records with the same (type, name) are replaced; otherwise the new
    /// record is appended. Any change bumps the zone serial.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        apex: &str,
        rtype: RecordType,
        name: &str,
        value: Option<String>,
        priority: Option<u16>,
        ttl: u32,
        unique: bool,
    ) -> Option<Uuid> {
        let apex = apex.to_lowercase();
        let name = name.to_lowercase();
        self.store
            .update(Module::Dns, move |tree| {
                let zone = tree.dns.zones.get_mut(&apex)?;
                if unique {
                    zone.records.retain(|r| !(r.rtype == rtype && r.name == name));
                }
                let id = Uuid::new_v4();
                zone.records.push(ZoneRecord {
                    id,
                    rtype,
                    name,
                    value,
                    priority,
                    ttl,
                    unique: Some(unique),
                });
                zone.soa.bump_serial();
                Some(id)
            })
            .await
    }

    /// Delete records matching (type, name) and, when given, the value.
    /// The zone keeps its SOA even when its record list empties.
    pub async fn delete(
        &self,
        apex: &str,
        rtype: RecordType,
        name: &str,
        value: Option<&str>,
    ) -> usize {
        let apex = apex.to_lowercase();
        let name = name.to_lowercase();
        let value = value.map(str::to_string);
        self.store
            .update(Module::Dns, move |tree| {
                let Some(zone) = tree.dns.zones.get_mut(&apex) else {
                    return 0;
                };
                let before = zone.records.len();
                zone.records.retain(|r| {
                    !(r.rtype == rtype
                        && r.name == name
                        && value.as_ref().is_none_or(|v| r.value.as_deref() == Some(v)))
                });
                let removed = before - zone.records.len();
                if removed > 0 {
                    zone.soa.bump_serial();
                }
                removed
            })
            .await
    }

    /// Remove the records with the given owner names (domain deletion).
    /// Only exact name matches go; the zone itself, with its SOA, stays so
    /// deletes are idempotent and neighbors in a shared zone are safe.
    pub async fn remove_records_named(&self, apex: &str, names: &[String]) {
        let apex = apex.to_lowercase();
        let names: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        self.store
            .update(Module::Dns, move |tree| {
                if let Some(zone) = tree.dns.zones.get_mut(&apex) {
                    let before = zone.records.len();
                    zone.records.retain(|r| !names.contains(&r.name));
                    if zone.records.len() != before {
                        zone.soa.bump_serial();
                    }
                }
            })
            .await;
    }

    // ── ACME DNS-01 ─────────────────────────────────────────────

    pub async fn set_acme_challenge(&self, host: &str, value: &str) -> bool {
        let Some(apex) = self.zone_apex_for(host).await else {
            return false;
        };
        let name = format!("_acme-challenge.{host}");
        self.record(
            &apex,
            RecordType::TXT,
            &name,
            Some(value.to_string()),
            None,
            ACME_CHALLENGE_TTL,
            true,
        )
        .await
        .is_some()
    }

    pub async fn clear_acme_challenge(&self, host: &str, value: &str) {
        if let Some(apex) = self.zone_apex_for(host).await {
            let name = format!("_acme-challenge.{host}");
            self.delete(&apex, RecordType::TXT, &name, Some(value)).await;
        }
    }

    // ── lookup ──────────────────────────────────────────────────

    async fn zone_apex_for(&self, name: &str) -> Option<String> {
        let tree = self.store.read().await;
        find_zone_apex(name, tree.dns.zones.keys())
    }

    /// Compute the response for one parsed query.
    pub async fn answer(&self, query: &Message, source: IpAddr) -> AnswerSet {
        let qname = query.question.name.to_lowercase();
        let qtype = query.question.qtype;

        // Snapshot the zone; nothing below may hold the config lock across
        // a dynamic-IP resolution.
        let zone: Option<(String, Zone)> = {
            let tree = self.store.read().await;
            find_zone_apex(&qname, tree.dns.zones.keys())
                .and_then(|apex| tree.dns.zones.get(&apex).cloned().map(|z| (apex, z)))
        };
        let Some((apex, zone)) = zone else {
            debug!(name = qname, "Query outside managed zones");
            return AnswerSet::nxdomain(Vec::new());
        };

        let soa_record = soa_wire_record(&apex, &zone.soa);

        // ANY answers with SOA only (amplification defense).
        if qtype == wire::TYPE_ANY {
            return AnswerSet::answers(vec![soa_record]);
        }
        if qtype == wire::TYPE_SOA && qname == apex {
            return AnswerSet::answers(vec![soa_record]);
        }

        let allow_private = source.is_loopback() || !is_public(source);
        let matching: Vec<ZoneRecord> = zone
            .records
            .iter()
            .filter(|r| r.name == qname && qtype_matches(r.rtype, qtype))
            .cloned()
            .collect();

        let mut answers = Vec::new();
        for record in &matching {
            if let Some(wire_record) = self
                .to_wire_record(record, &qname, allow_private)
                .await
            {
                answers.push(wire_record);
            }
        }

        // Default CAA: a domain with no explicit CAA record advertises
        // Let's Encrypt.
        if qtype == wire::TYPE_CAA && matching.is_empty() && name_exists(&zone, &qname, &apex) {
            for tag in ["issue", "issuewild"] {
                answers.push(Record {
                    name: qname.clone(),
                    rtype: wire::TYPE_CAA,
                    ttl: zone.soa.ttl,
                    rdata: RData::Caa {
                        flags: 0,
                        tag: tag.to_string(),
                        value: "letsencrypt.org".to_string(),
                    },
                });
            }
        }

        if !answers.is_empty() {
            return AnswerSet::answers(answers);
        }
        if name_exists(&zone, &qname, &apex) {
            // Known name, no data of this type.
            AnswerSet::nodata(vec![soa_record])
        } else {
            AnswerSet::nxdomain(vec![soa_record])
        }
    }

    async fn to_wire_record(
        &self,
        record: &ZoneRecord,
        qname: &str,
        allow_private: bool,
    ) -> Option<Record> {
        let rdata = match record.rtype {
            RecordType::A => match &record.value {
                Some(v) => RData::A(v.parse().ok()?),
                None => {
                    self.dynip.refresh_if_stale().await;
                    match self.dynip.select(qname, false, allow_private).await? {
                        IpAddr::V4(addr) => RData::A(addr),
                        IpAddr::V6(_) => return None,
                    }
                }
            },
            RecordType::AAAA => match &record.value {
                Some(v) => RData::Aaaa(v.parse().ok()?),
                None => {
                    self.dynip.refresh_if_stale().await;
                    match self.dynip.select(qname, true, allow_private).await? {
                        IpAddr::V6(addr) => RData::Aaaa(addr),
                        IpAddr::V4(_) => return None,
                    }
                }
            },
            RecordType::CNAME => RData::Cname(record.value.clone()?),
            RecordType::NS => RData::Ns(record.value.clone()?),
            RecordType::MX => RData::Mx {
                preference: record.priority.unwrap_or(10),
                exchange: record.value.clone()?,
            },
            RecordType::TXT => RData::Txt(record.value.clone()?),
            RecordType::CAA => RData::Caa {
                flags: 0,
                tag: "issue".to_string(),
                value: record.value.clone()?,
            },
        };
        Some(Record {
            name: record.name.clone(),
            rtype: rtype_to_wire(record.rtype),
            ttl: record.ttl,
            rdata,
        })
    }
}

fn qtype_matches(rtype: RecordType, qtype: u16) -> bool {
    rtype_to_wire(rtype) == qtype
}

fn rtype_to_wire(rtype: RecordType) -> u16 {
    match rtype {
        RecordType::A => wire::TYPE_A,
        RecordType::AAAA => wire::TYPE_AAAA,
        RecordType::CNAME => wire::TYPE_CNAME,
        RecordType::MX => wire::TYPE_MX,
        RecordType::TXT => wire::TYPE_TXT,
        RecordType::NS => wire::TYPE_NS,
        RecordType::CAA => wire::TYPE_CAA,
    }
}

fn name_exists(zone: &Zone, qname: &str, apex: &str) -> bool {
    qname == apex || zone.records.iter().any(|r| r.name == qname)
}

fn soa_wire_record(apex: &str, soa: &SoaRecord) -> Record {
    Record {
        name: apex.to_string(),
        rtype: wire::TYPE_SOA,
        ttl: soa.ttl,
        rdata: RData::Soa {
            primary: soa.primary.clone(),
            email: soa.email.clone(),
            serial: soa.serial,
            refresh: soa.refresh,
            retry: soa.retry,
            expire: soa.expire,
            minimum: soa.minimum,
        },
    }
}

/// Strip labels from the left until a stored zone matches.
fn find_zone_apex<'a>(
    name: &str,
    zones: impl Iterator<Item = &'a String> + Clone,
) -> Option<String> {
    let mut candidate = name.to_lowercase();
    loop {
        if zones.clone().any(|apex| apex == &candidate) {
            return Some(candidate);
        }
        match candidate.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => candidate = rest.to_string(),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynip::HostIp;
    use crate::wire::{CLASS_IN, Question};
    use od_common::{EventBus, OdacPaths};

    async fn authority() -> (tempfile::TempDir, DnsAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        let dynip = Arc::new(DynIpResolver::new("1.1.1.1:53".parse().unwrap()));
        dynip.set_static(Vec::new()).await;
        (dir, DnsAuthority::new(store, dynip))
    }

    fn query(name: &str, qtype: u16) -> Message {
        Message {
            id: 7,
            recursion_desired: false,
            rcode: 0,
            question: Question { name: name.into(), qtype, qclass: CLASS_IN },
            answers: Vec::new(),
        }
    }

    const PUBLIC_SRC: &str = "203.0.113.50";

    #[tokio::test]
    async fn unknown_apex_is_nxdomain() {
        let (_dir, auth) = authority().await;
        let set = auth.answer(&query("x.nope.org", wire::TYPE_A), PUBLIC_SRC.parse().unwrap()).await;
        assert_eq!(set.rcode, wire::RCODE_NXDOMAIN);
    }

    #[tokio::test]
    async fn any_returns_soa_only() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record(
            "example.com",
            RecordType::TXT,
            "example.com",
            Some("hello".into()),
            None,
            300,
            true,
        )
        .await;
        let set = auth
            .answer(&query("example.com", wire::TYPE_ANY), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.rcode, wire::RCODE_NOERROR);
        assert_eq!(set.answers.len(), 1);
        assert_eq!(set.answers[0].rtype, wire::TYPE_SOA);
    }

    #[tokio::test]
    async fn dynamic_a_uses_ptr_match() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record("example.com", RecordType::A, "web.example.com", None, None, 3600, true)
            .await;
        auth.dynip()
            .set_static(vec![
                HostIp { ip: "1.2.3.4".parse().unwrap(), public: true, ptr: Some("mail.example.com".into()) },
                HostIp { ip: "5.6.7.8".parse().unwrap(), public: true, ptr: Some("web.example.com".into()) },
            ])
            .await;
        let set = auth
            .answer(&query("web.example.com", wire::TYPE_A), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.answers.len(), 1);
        assert_eq!(set.answers[0].ttl, 3600);
        assert_eq!(set.answers[0].rdata, RData::A("5.6.7.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn dynamic_a_with_only_private_candidates_is_empty_for_public_query() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record("example.com", RecordType::A, "web.example.com", None, None, 3600, true)
            .await;
        auth.dynip()
            .set_static(vec![HostIp {
                ip: "192.168.0.9".parse().unwrap(),
                public: false,
                ptr: None,
            }])
            .await;
        let set = auth
            .answer(&query("web.example.com", wire::TYPE_A), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.rcode, wire::RCODE_NOERROR);
        assert!(set.answers.is_empty());
    }

    #[tokio::test]
    async fn caa_synthesized_when_absent() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        let set = auth
            .answer(&query("example.com", wire::TYPE_CAA), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.answers.len(), 2);
        assert!(matches!(
            &set.answers[0].rdata,
            RData::Caa { value, .. } if value == "letsencrypt.org"
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_nodata_with_soa() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record(
            "example.com",
            RecordType::TXT,
            "example.com",
            Some("x".into()),
            None,
            300,
            true,
        )
        .await;
        let set = auth
            .answer(&query("example.com", wire::TYPE_MX), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.rcode, wire::RCODE_NOERROR);
        assert!(set.answers.is_empty());
        assert_eq!(set.authority.len(), 1);
        assert_eq!(set.authority[0].rtype, wire::TYPE_SOA);
    }

    #[tokio::test]
    async fn non_unique_records_append() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record(
            "example.com",
            RecordType::TXT,
            "example.com",
            Some("one".into()),
            None,
            300,
            false,
        )
        .await;
        auth.record(
            "example.com",
            RecordType::TXT,
            "example.com",
            Some("two".into()),
            None,
            300,
            false,
        )
        .await;
        let set = auth
            .answer(&query("example.com", wire::TYPE_TXT), PUBLIC_SRC.parse().unwrap())
            .await;
        assert_eq!(set.answers.len(), 2);
    }

    #[tokio::test]
    async fn serial_bumps_on_change() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        let before = {
            let tree = auth.store.read().await;
            tree.dns.zones["example.com"].soa.serial
        };
        auth.record("example.com", RecordType::A, "a.example.com", None, None, 3600, true)
            .await;
        let after = {
            let tree = auth.store.read().await;
            tree.dns.zones["example.com"].soa.serial
        };
        assert!(after > before);
    }

    #[tokio::test]
    async fn acme_challenge_roundtrip() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        assert!(auth.set_acme_challenge("example.com", "tok-123").await);
        let set = auth
            .answer(
                &query("_acme-challenge.example.com", wire::TYPE_TXT),
                PUBLIC_SRC.parse().unwrap(),
            )
            .await;
        assert_eq!(set.answers.len(), 1);
        assert_eq!(set.answers[0].ttl, ACME_CHALLENGE_TTL);
        assert_eq!(set.answers[0].rdata, RData::Txt("tok-123".into()));

        auth.clear_acme_challenge("example.com", "tok-123").await;
        let set = auth
            .answer(
                &query("_acme-challenge.example.com", wire::TYPE_TXT),
                PUBLIC_SRC.parse().unwrap(),
            )
            .await;
        assert!(set.answers.is_empty());
    }

    #[tokio::test]
    async fn remove_records_named_is_exact_match_only() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record("example.com", RecordType::A, "example.com", None, None, 3600, true)
            .await;
        auth.record("example.com", RecordType::A, "app2.example.com", None, None, 3600, true)
            .await;
        let serial_before = {
            let tree = auth.store.read().await;
            tree.dns.zones["example.com"].soa.serial
        };

        auth.remove_records_named("example.com", &["example.com".to_string()]).await;

        let tree = auth.store.read().await;
        let zone = &tree.dns.zones["example.com"];
        // The sibling sharing the apex suffix is untouched.
        assert_eq!(zone.records.len(), 1);
        assert_eq!(zone.records[0].name, "app2.example.com");
        assert!(zone.soa.serial > serial_before);
    }

    #[tokio::test]
    async fn empty_zone_keeps_soa_after_deletes() {
        let (_dir, auth) = authority().await;
        auth.ensure_zone("example.com").await;
        auth.record("example.com", RecordType::A, "example.com", None, None, 3600, true)
            .await;
        auth.delete("example.com", RecordType::A, "example.com", None).await;
        let tree = auth.store.read().await;
        let zone = &tree.dns.zones["example.com"];
        assert!(zone.records.is_empty());
        assert!(zone.soa.serial > 0);
    }
}
