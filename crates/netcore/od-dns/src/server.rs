//! UDP + TCP authoritative listeners with the port-53 takeover dance.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use od_config::ConfigStore;

use crate::authority::DnsAuthority;
use crate::ratelimit::RateLimiter;
use crate::resolvconf::ResolverOps;
use crate::wire;

const FALLBACK_PORTS: &[u16] = &[5353, 1053, 8053];
const MAX_UDP_PAYLOAD: usize = 512;

pub struct DnsServer {
    authority: Arc<DnsAuthority>,
    store: Arc<ConfigStore>,
    resolver_ops: Arc<dyn ResolverOps>,
    ratelimit: Arc<Mutex<RateLimiter>>,
    /// Port actually bound, set by `bind`.
    port: u16,
}

impl DnsServer {
    pub async fn bind(
        authority: Arc<DnsAuthority>,
        store: Arc<ConfigStore>,
        resolver_ops: Arc<dyn ResolverOps>,
    ) -> Result<(Self, UdpSocket, TcpListener)> {
        let rate_config = store.read().await.firewall.rate_limit.clone();
        let ratelimit = Arc::new(Mutex::new(RateLimiter::new(rate_config)));

        let (udp, tcp, port) = Self::bind_transports(&resolver_ops).await?;

        if port == 53 {
            // The stub listener is gone; the host still needs recursion.
            if let Err(e) = resolver_ops.point_resolver_to_public().await {
                warn!("Could not rewrite host resolver: {e}");
            }
        } else {
            warn!(port, "DNS bound to fallback port, authoritative answers only reachable there");
        }

        info!(port, "DNS authority listening (udp+tcp)");
        Ok((
            Self { authority, store, resolver_ops, ratelimit, port },
            udp,
            tcp,
        ))
    }

    async fn bind_transports(
        resolver_ops: &Arc<dyn ResolverOps>,
    ) -> Result<(UdpSocket, TcpListener, u16)> {
        match Self::try_bind(53).await {
            Ok(pair) => return Ok((pair.0, pair.1, 53)),
            Err(first_err) => {
                debug!("Port 53 busy ({first_err}), trying to release the stub listener");
                if resolver_ops.release_stub_listener().await.is_ok() {
                    if let Ok(pair) = Self::try_bind(53).await {
                        return Ok((pair.0, pair.1, 53));
                    }
                }
            }
        }
        for &port in FALLBACK_PORTS {
            if let Ok(pair) = Self::try_bind(port).await {
                return Ok((pair.0, pair.1, port));
            }
        }
        anyhow::bail!("no DNS port available (53, {FALLBACK_PORTS:?})")
    }

    async fn try_bind(port: u16) -> Result<(UdpSocket, TcpListener)> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let udp = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("udp bind {addr}"))?;
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tcp bind {addr}"))?;
        Ok((udp, tcp))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Watchdog hook: refresh the rate-limit config and trim idle windows.
    pub async fn check(&self) {
        let config = self.store.read().await.firewall.rate_limit.clone();
        let mut rl = self.ratelimit.lock().await;
        rl.set_config(config);
        rl.purge();
    }

    /// Restore the host resolver; called during shutdown when we owned 53.
    pub async fn shutdown(&self) {
        if self.port == 53 {
            if let Err(e) = self.resolver_ops.restore().await {
                warn!("Resolver restore failed: {e}");
            }
        }
    }

    pub async fn run_udp(self: Arc<Self>, socket: UdpSocket) {
        let socket = Arc::new(socket);
        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let payload = buf[..len].to_vec();
                    let server = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        if let Some(response) = server.handle_packet(&payload, peer.ip()).await {
                            if let Err(e) = socket.send_to(&response, peer).await {
                                debug!(peer = %peer, "UDP send failed: {e}");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("UDP receive failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub async fn run_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_tcp_conn(stream, peer.ip()).await {
                            debug!(peer = %peer, "TCP session ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("TCP accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_tcp_conn(&self, mut stream: TcpStream, peer: IpAddr) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(()); // client closed
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;

            if let Some(response) = self.handle_packet(&payload, peer).await {
                let len = (response.len() as u16).to_be_bytes();
                stream.write_all(&len).await?;
                stream.write_all(&response).await?;
            }
        }
    }

    /// One request in, at most one response out. Over-limit sources get an
    /// empty NOERROR response; malformed packets get FORMERR when a header
    /// is salvageable.
    async fn handle_packet(&self, payload: &[u8], peer: IpAddr) -> Option<Vec<u8>> {
        let query = match wire::parse_query(payload) {
            Ok(query) => query,
            Err(e) => {
                debug!(peer = %peer, "Unparseable query: {e}");
                return None;
            }
        };

        let allowed = {
            let mut rl = self.ratelimit.lock().await;
            rl.allow(peer)
        };
        if !allowed {
            debug!(peer = %peer, "Rate limited");
            return Some(wire::encode_response(&query, wire::RCODE_NOERROR, &[], &[]));
        }

        if query.question.qclass != wire::CLASS_IN {
            return Some(wire::encode_response(&query, wire::RCODE_NOTIMP, &[], &[]));
        }

        let set = self.authority.answer(&query, peer).await;
        debug!(
            peer = %peer,
            name = query.question.name,
            qtype = query.question.qtype,
            rcode = set.rcode,
            answers = set.answers.len(),
            "DNS query"
        );
        Some(wire::encode_response(&query, set.rcode, &set.answers, &set.authority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::DnsAuthority;
    use crate::dynip::DynIpResolver;
    use crate::resolvconf::NoopResolverOps;
    use od_common::{EventBus, OdacPaths};
    use od_config::{Module, RateLimitConfig, RecordType};
    use std::sync::Arc;

    async fn server_without_sockets(max: u32) -> (tempfile::TempDir, DnsServer) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        store
            .update(Module::Firewall, |tree| {
                tree.firewall.rate_limit = RateLimitConfig {
                    enabled: true,
                    window_ms: 60_000,
                    max,
                };
            })
            .await;
        let dynip = Arc::new(DynIpResolver::new("1.1.1.1:53".parse().unwrap()));
        dynip.set_static(Vec::new()).await;
        let authority = Arc::new(DnsAuthority::new(store.clone(), dynip));
        authority.ensure_zone("example.com").await;
        authority
            .record(
                "example.com",
                RecordType::TXT,
                "example.com",
                Some("hello".into()),
                None,
                300,
                true,
            )
            .await;

        let rate = store.read().await.firewall.rate_limit.clone();
        let server = DnsServer {
            authority,
            store,
            resolver_ops: Arc::new(NoopResolverOps),
            ratelimit: Arc::new(Mutex::new(RateLimiter::new(rate))),
            port: 5353,
        };
        (dir, server)
    }

    #[tokio::test]
    async fn over_limit_remote_source_gets_empty_response() {
        let (_dir, server) = server_without_sockets(2).await;
        let query = wire::encode_query(1, "example.com", wire::TYPE_TXT);
        let peer: IpAddr = "203.0.113.10".parse().unwrap();

        for _ in 0..2 {
            let raw = server.handle_packet(&query, peer).await.unwrap();
            let parsed = wire::parse_response(&raw).unwrap();
            assert_eq!(parsed.answers.len(), 1);
        }
        // Third request in the window: response arrives but carries
        // nothing.
        let raw = server.handle_packet(&query, peer).await.unwrap();
        let parsed = wire::parse_response(&raw).unwrap();
        assert_eq!(parsed.rcode, wire::RCODE_NOERROR);
        assert!(parsed.answers.is_empty());

        // Loopback stays unthrottled.
        let raw = server
            .handle_packet(&query, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(wire::parse_response(&raw).unwrap().answers.len(), 1);
    }

    #[tokio::test]
    async fn garbage_packet_yields_no_response() {
        let (_dir, server) = server_without_sockets(10).await;
        let peer: IpAddr = "203.0.113.10".parse().unwrap();
        assert!(server.handle_packet(&[1, 2, 3], peer).await.is_none());
    }
}
