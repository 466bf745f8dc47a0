//! Authoritative DNS for locally managed zones: UDP + TCP, SOA-backed
//! zones, dynamic PTR-matched A/AAAA answers, ACME TXT challenges.

pub mod authority;
pub mod dynip;
pub mod ratelimit;
pub mod resolvconf;
pub mod server;
pub mod wire;

pub use authority::DnsAuthority;
pub use dynip::DynIpResolver;
pub use resolvconf::{NoopResolverOps, ResolverOps, SystemdResolvedOps};
pub use server::DnsServer;
