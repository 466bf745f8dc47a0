//! Persisted data model. Field names follow the on-disk JSON shape
//! (camelCase where the files have always used it), struct per module file.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── server.json ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub pid: u32,
    pub started: DateTime<Utc>,
    pub watchdog: bool,
    pub os: String,
    pub arch: String,
}

// ── apps.json ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppsConfig {
    #[serde(default)]
    pub apps: Vec<AppRecord>,
}

impl AppsConfig {
    pub fn by_name(&self, name: &str) -> Option<&AppRecord> {
        self.apps.iter().find(|a| a.name == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut AppRecord> {
        self.apps.iter_mut().find(|a| a.name == name)
    }

    /// Ids are monotonic non-decreasing: next is `max(id) + 1`.
    pub fn next_id(&self) -> u64 {
        self.apps.iter().map(|a| a.id).max().map_or(1, |m| m + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Script,
    Container,
    Git,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Starting,
    Running,
    Stopped,
    Errored,
    Installing,
    Building,
    Updating,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::Installing => "installing",
            Self::Building => "building",
            Self::Updating => "updating",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSource {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<u16>,
    pub container: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
}

/// App environment: explicit values plus links to other apps whose manual
/// values are merged in at launch (one level, not recursive).
///
/// Legacy records stored a flat `{"KEY": "VALUE"}` map; those are lifted
/// into `manual` at read time and written back in the new shape on the
/// next flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvSpec {
    pub manual: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<String>,
}

impl<'de> Deserialize<'de> for EnvSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Modern {
            #[serde(default)]
            manual: BTreeMap<String, String>,
            #[serde(default)]
            linked: Vec<String>,
        }

        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let is_modern = raw.keys().all(|k| k == "manual" || k == "linked");
        if is_modern && (raw.contains_key("manual") || raw.contains_key("linked") || raw.is_empty())
        {
            let value = serde_json::Value::Object(raw.into_iter().collect());
            let modern: Modern =
                serde_json::from_value(value).map_err(serde::de::Error::custom)?;
            return Ok(Self { manual: modern.manual, linked: modern.linked });
        }
        // Legacy flat map: every value must be a string.
        let mut manual = BTreeMap::new();
        for (k, v) in raw {
            match v {
                serde_json::Value::String(s) => {
                    manual.insert(k, s);
                }
                other => {
                    manual.insert(k, other.to_string());
                }
            }
        }
        Ok(Self { manual, linked: Vec::new() })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    /// Script path for `script` apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default)]
    pub env: EnvSpec,
    /// Capability actions granted to the app's derived API token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<bool>,
    pub active: bool,
    pub status: AppStatus,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Legacy single-port field kept for proxy-sync fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Container IP observed at last launch, used when the runtime can't
    /// be queried during a proxy sync.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "containerIP")]
    pub container_ip: Option<String>,
}

// ── domains.json ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainsConfig {
    #[serde(default)]
    pub domains: BTreeMap<String, DomainRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    /// Name of the owning app.
    pub app_id: String,
    /// Subdomain labels folded into this record (`www`, `api`, ...).
    #[serde(default)]
    pub subdomain: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<DomainCert>,
}

impl DomainRecord {
    /// The SAN set a certificate for this domain must cover.
    pub fn expected_sans(&self, domain: &str) -> Vec<String> {
        let mut names = vec![domain.to_string()];
        for sub in &self.subdomain {
            names.push(format!("{sub}.{domain}"));
        }
        names
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainCert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<CertMaterial>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertMaterial {
    /// PEM private key.
    pub key: String,
    /// PEM certificate chain.
    pub cert: String,
    pub expiry: DateTime<Utc>,
}

// ── dns.json ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub zones: BTreeMap<String, Zone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub soa: SoaRecord,
    #[serde(default)]
    pub records: Vec<ZoneRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaRecord {
    pub primary: String,
    pub email: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    pub ttl: u32,
}

impl SoaRecord {
    pub fn for_apex(apex: &str) -> Self {
        Self {
            primary: format!("ns1.{apex}"),
            email: format!("hostmaster.{apex}"),
            serial: serial_for_today(0),
            refresh: 7200,
            retry: 3600,
            expire: 1_209_600,
            minimum: 3600,
            ttl: 3600,
        }
    }

    /// Bump the serial: `YYYYMMDDnn`, counter per day, monotonic across
    /// day changes (never goes backwards even with a skewed clock).
    pub fn bump_serial(&mut self) {
        let today_base = serial_for_today(0);
        self.serial = if self.serial >= today_base {
            self.serial + 1
        } else {
            serial_for_today(1)
        };
    }
}

fn serial_for_today(counter: u32) -> u32 {
    let date: u32 = Utc::now().format("%Y%m%d").to_string().parse().unwrap_or(19700101);
    date * 100 + counter
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    MX,
    TXT,
    NS,
    CAA,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::AAAA => "AAAA",
            Self::CNAME => "CNAME",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::NS => "NS",
            Self::CAA => "CAA",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub rtype: RecordType,
    /// Fully qualified owner name.
    pub name: String,
    /// Absent on dynamic A/AAAA records: resolved at answer time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
    pub ttl: u32,
    /// `false` lets several records share (type, name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
}

// ── ssl.json ────────────────────────────────────────────────────

/// System-wide self-signed fallback certificate (default SNI material).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<CertMaterial>,
}

// ── firewall.json ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    pub enabled: bool,
    #[serde(default)]
    pub blacklist: BTreeSet<String>,
    #[serde(default)]
    pub whitelist: BTreeSet<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blacklist: BTreeSet::new(),
            whitelist: BTreeSet::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true, window_ms: 60_000, max: 300 }
    }
}

// ── api.json ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Root key: 32 random bytes, hex encoded. Full API privileges.
    pub auth: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self { auth: hex::encode(bytes) }
    }
}

// ── mail.json ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub accounts: BTreeMap<String, MailAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailAccount {
    pub password_hash: String,
    pub salt: String,
    pub created: DateTime<Utc>,
}

// ── web.json ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default)]
    pub sites: BTreeMap<String, WebSite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSite {
    /// Document root under the web path.
    pub path: String,
    pub created: DateTime<Utc>,
}

// ── services.json ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

/// Third-party managed container (database, cache, ...). Narrower than an
/// app: fixed image, no deploy pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub active: bool,
    pub status: AppStatus,
    pub created: DateTime<Utc>,
}

// ── hub.json ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_is_max_plus_one() {
        let mut cfg = AppsConfig::default();
        assert_eq!(cfg.next_id(), 1);
        cfg.apps.push(sample_app(7, "a"));
        cfg.apps.push(sample_app(3, "b"));
        assert_eq!(cfg.next_id(), 8);
    }

    #[test]
    fn env_spec_modern_roundtrip() {
        let json = r#"{"manual":{"FOO":"bar"},"linked":["db"]}"#;
        let spec: EnvSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.manual.get("FOO").unwrap(), "bar");
        assert_eq!(spec.linked, vec!["db"]);
        let back = serde_json::to_string(&spec).unwrap();
        let again: EnvSpec = serde_json::from_str(&back).unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn env_spec_legacy_flat_map() {
        let json = r#"{"DATABASE_URL":"postgres://x","PORT":"8080"}"#;
        let spec: EnvSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.manual.len(), 2);
        assert!(spec.linked.is_empty());
        // Migrated on next write: serializes in the modern shape.
        let back = serde_json::to_string(&spec).unwrap();
        assert!(back.contains("\"manual\""));
    }

    #[test]
    fn env_spec_empty_map() {
        let spec: EnvSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.manual.is_empty());
        assert!(spec.linked.is_empty());
    }

    #[test]
    fn soa_serial_same_day_increments() {
        let mut soa = SoaRecord::for_apex("example.com");
        let first = soa.serial;
        soa.bump_serial();
        assert!(soa.serial > first);
        assert_eq!(soa.serial / 100, first / 100);
    }

    #[test]
    fn soa_serial_never_regresses() {
        let mut soa = SoaRecord::for_apex("example.com");
        // Simulate a serial from the far future (clock skew).
        soa.serial = 2_999_123_199;
        soa.bump_serial();
        assert_eq!(soa.serial, 2_999_123_200);
    }

    #[test]
    fn expected_sans_include_subdomains() {
        let rec = DomainRecord {
            app_id: "myapp".into(),
            subdomain: vec!["www".into(), "api".into()],
            created: Utc::now(),
            cert: None,
        };
        assert_eq!(
            rec.expected_sans("example.com"),
            vec!["example.com", "www.example.com", "api.example.com"]
        );
    }

    fn sample_app(id: u64, name: &str) -> AppRecord {
        AppRecord {
            id,
            name: name.into(),
            app_type: AppType::Container,
            image: Some("nginx".into()),
            url: None,
            branch: None,
            git: None,
            file: None,
            ports: vec![],
            volumes: vec![],
            env: EnvSpec::default(),
            api: None,
            dev: None,
            active: true,
            status: AppStatus::Stopped,
            created: Utc::now(),
            started: None,
            commit_sha: None,
            port: None,
            container_ip: None,
        }
    }
}
