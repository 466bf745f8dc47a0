//! Public-IP discovery and PTR-matched selection for dynamic A/AAAA
//! records.
//!
//! Candidate IPs come from external lookup services and from the local
//! routing table (UDP connect trick). Each candidate gets a reverse lookup
//! through the upstream recursive resolver; the query-time selection walks
//! the PTR-match ladder.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use ipnet::{Ipv4Net, Ipv6Net};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::wire;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PTR_TIMEOUT: Duration = Duration::from_secs(3);
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

const IPV4_LOOKUP_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ipv4.icanhazip.com",
];
const IPV6_LOOKUP_SERVICES: &[&str] = &[
    "https://api6.ipify.org",
    "https://ipv6.icanhazip.com",
];

#[derive(Debug, Clone)]
pub struct HostIp {
    pub ip: IpAddr,
    pub public: bool,
    pub ptr: Option<String>,
}

#[derive(Default)]
struct Cache {
    ips: Vec<HostIp>,
    refreshed: Option<Instant>,
}

pub struct DynIpResolver {
    client: reqwest::Client,
    upstream: SocketAddr,
    cache: RwLock<Cache>,
}

impl DynIpResolver {
    pub fn new(upstream: SocketAddr) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, upstream, cache: RwLock::new(Cache::default()) }
    }

    /// Inject a fixed candidate set; used by tests and by setups with a
    /// statically configured public IP.
    pub async fn set_static(&self, ips: Vec<HostIp>) {
        let mut cache = self.cache.write().await;
        cache.ips = ips;
        cache.refreshed = Some(Instant::now());
    }

    /// Refresh the candidate set if stale. Never fails: probe errors leave
    /// the previous cache in place.
    pub async fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.read().await;
            cache
                .refreshed
                .is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL)
        };
        if stale {
            self.refresh().await;
        }
    }

    pub async fn refresh(&self) {
        let mut candidates: Vec<IpAddr> = Vec::new();

        for url in IPV4_LOOKUP_SERVICES {
            if let Some(ip) = self.probe_service(url).await {
                candidates.push(ip);
                break;
            }
        }
        for url in IPV6_LOOKUP_SERVICES {
            if let Some(ip) = self.probe_service(url).await {
                candidates.push(ip);
                break;
            }
        }
        if let Some(ip) = local_source_ip(false).await {
            candidates.push(ip);
        }
        if let Some(ip) = local_source_ip(true).await {
            candidates.push(ip);
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut ips = Vec::with_capacity(candidates.len());
        for ip in candidates {
            let public = is_public(ip);
            let ptr = if public { self.reverse_lookup(ip).await } else { None };
            ips.push(HostIp { ip, public, ptr });
        }

        debug!(count = ips.len(), "Host IP candidates refreshed");
        let mut cache = self.cache.write().await;
        cache.ips = ips;
        cache.refreshed = Some(Instant::now());
    }

    async fn probe_service(&self, url: &str) -> Option<IpAddr> {
        match self.client.get(url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => body.trim().parse().ok(),
                Err(_) => None,
            },
            Err(e) => {
                debug!(url, "IP probe failed: {e}");
                None
            }
        }
    }

    /// Reverse lookup against the upstream recursive resolver using our
    /// own codec.
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        let qname = ptr_qname(ip);
        let id: u16 = rand::rng().random();
        let query = wire::encode_query(id, &qname, wire::TYPE_PTR);

        let lookup = async {
            let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
            socket.send_to(&query, self.upstream).await.ok()?;
            let mut buf = [0u8; 512];
            let (n, _) = socket.recv_from(&mut buf).await.ok()?;
            let response = wire::parse_response(&buf[..n]).ok()?;
            if response.id != id {
                return None;
            }
            response.answers.into_iter().find_map(|r| match r.rdata {
                wire::RData::Ptr(name) => Some(name),
                _ => None,
            })
        };

        match tokio::time::timeout(PTR_TIMEOUT, lookup).await {
            Ok(ptr) => ptr,
            Err(_) => {
                warn!(%ip, "PTR lookup timed out");
                None
            }
        }
    }

    /// Pick the best candidate for `qname`. `want_v6` selects AAAA vs A;
    /// `allow_private` is set for queries arriving from loopback or
    /// private sources. Returns `None` (empty answer) rather than ever
    /// handing a private IP to a public query.
    pub async fn select(&self, qname: &str, want_v6: bool, allow_private: bool) -> Option<IpAddr> {
        let cache = self.cache.read().await;
        let pool: Vec<&HostIp> = cache
            .ips
            .iter()
            .filter(|h| h.ip.is_ipv6() == want_v6)
            .filter(|h| allow_private || h.public)
            .collect();

        // a. PTR exactly equals the query name
        if let Some(h) = pool.iter().find(|h| h.ptr.as_deref() == Some(qname)) {
            return Some(h.ip);
        }
        // b. PTR is a sub- or super-domain of the query name
        if let Some(h) = pool.iter().find(|h| {
            h.ptr.as_deref().is_some_and(|ptr| {
                ptr.ends_with(&format!(".{qname}")) || qname.ends_with(&format!(".{ptr}"))
            })
        }) {
            return Some(h.ip);
        }
        // c. same root domain (last two labels)
        let qroot = root_domain(qname);
        if let Some(h) = pool.iter().find(|h| {
            h.ptr.as_deref().is_some_and(|ptr| root_domain(ptr) == qroot)
        }) {
            return Some(h.ip);
        }
        // d. first public candidate, else the primary address
        if let Some(h) = pool.iter().find(|h| h.public) {
            return Some(h.ip);
        }
        pool.first().map(|h| h.ip)
    }

    /// First public IPv4 / IPv6, for SPF record synthesis.
    pub async fn public_addrs(&self) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let cache = self.cache.read().await;
        let v4 = cache.ips.iter().find_map(|h| match h.ip {
            IpAddr::V4(a) if h.public => Some(a),
            _ => None,
        });
        let v6 = cache.ips.iter().find_map(|h| match h.ip {
            IpAddr::V6(a) if h.public => Some(a),
            _ => None,
        });
        (v4, v6)
    }
}

/// Local address the kernel would route from; no packet is sent.
async fn local_source_ip(v6: bool) -> Option<IpAddr> {
    let (bind, target) = if v6 {
        ("[::]:0", "[2001:4860:4860::8888]:53")
    } else {
        ("0.0.0.0:0", "8.8.8.8:53")
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

fn root_domain(name: &str) -> String {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() <= 2 {
        name.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let private: [Ipv4Net; 6] = [
                "10.0.0.0/8".parse().unwrap(),
                "172.16.0.0/12".parse().unwrap(),
                "192.168.0.0/16".parse().unwrap(),
                "100.64.0.0/10".parse().unwrap(),
                "169.254.0.0/16".parse().unwrap(),
                "127.0.0.0/8".parse().unwrap(),
            ];
            !v4.is_unspecified() && !private.iter().any(|net| net.contains(&v4))
        }
        IpAddr::V6(v6) => {
            let private: [Ipv6Net; 3] = [
                "fc00::/7".parse().unwrap(),
                "fe80::/10".parse().unwrap(),
                "::1/128".parse().unwrap(),
            ];
            !v6.is_unspecified() && !private.iter().any(|net| net.contains(&v6))
        }
    }
}

fn ptr_qname(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", byte & 0x0F));
                nibbles.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str, public: bool, ptr: Option<&str>) -> HostIp {
        HostIp {
            ip: ip.parse().unwrap(),
            public,
            ptr: ptr.map(String::from),
        }
    }

    fn resolver() -> DynIpResolver {
        DynIpResolver::new("1.1.1.1:53".parse().unwrap())
    }

    #[tokio::test]
    async fn exact_ptr_match_wins() {
        let r = resolver();
        r.set_static(vec![
            host("1.2.3.4", true, Some("mail.example.com")),
            host("5.6.7.8", true, Some("web.example.com")),
        ])
        .await;
        let picked = r.select("web.example.com", false, false).await.unwrap();
        assert_eq!(picked, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn subdomain_ptr_match() {
        let r = resolver();
        r.set_static(vec![
            host("1.2.3.4", true, Some("other.net")),
            host("5.6.7.8", true, Some("host.web.example.com")),
        ])
        .await;
        let picked = r.select("web.example.com", false, false).await.unwrap();
        assert_eq!(picked, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn root_domain_match_beats_first_public() {
        let r = resolver();
        r.set_static(vec![
            host("9.9.9.9", true, Some("unrelated.org")),
            host("5.6.7.8", true, Some("mx.example.com")),
        ])
        .await;
        let picked = r.select("api.example.com", false, false).await.unwrap();
        assert_eq!(picked, "5.6.7.8".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn falls_back_to_first_public() {
        let r = resolver();
        r.set_static(vec![
            host("192.168.1.5", false, None),
            host("9.9.9.9", true, None),
        ])
        .await;
        let picked = r.select("web.example.com", false, false).await.unwrap();
        assert_eq!(picked, "9.9.9.9".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn public_query_never_gets_private_ip() {
        let r = resolver();
        r.set_static(vec![host("192.168.1.5", false, Some("web.example.com"))]).await;
        assert!(r.select("web.example.com", false, false).await.is_none());
        // A loopback/private source may still see it.
        assert!(r.select("web.example.com", false, true).await.is_some());
    }

    #[tokio::test]
    async fn v4_v6_pools_are_separate() {
        let r = resolver();
        r.set_static(vec![
            host("9.9.9.9", true, None),
            host("2001:db8::1", true, None),
        ])
        .await;
        let v4 = r.select("x.example.com", false, false).await.unwrap();
        let v6 = r.select("x.example.com", true, false).await.unwrap();
        assert!(v4.is_ipv4());
        assert!(v6.is_ipv6());
    }

    #[test]
    fn public_classification() {
        assert!(is_public("203.0.113.7".parse().unwrap()));
        assert!(!is_public("10.1.2.3".parse().unwrap()));
        assert!(!is_public("172.20.0.1".parse().unwrap()));
        assert!(!is_public("100.72.0.1".parse().unwrap()));
        assert!(!is_public("fe80::1".parse().unwrap()));
        assert!(!is_public("fd00::1".parse().unwrap()));
        assert!(is_public("2606:4700::1".parse().unwrap()));
    }

    #[test]
    fn ptr_qnames() {
        assert_eq!(ptr_qname("1.2.3.4".parse().unwrap()), "4.3.2.1.in-addr.arpa");
        assert!(ptr_qname("2001:db8::1".parse().unwrap()).ends_with(".ip6.arpa"));
    }
}
