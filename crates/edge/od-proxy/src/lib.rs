//! Control-to-proxy synchronization: computes the routing snapshot the
//! data-plane binary serves from and ships it over the local socket, plus
//! the supervisor that keeps that binary alive across restarts.

pub mod supervisor;
pub mod sync;

pub use supervisor::ProxySupervisor;
pub use sync::{BackendResolver, ProxyDocument, ProxyEndpoint, ProxyRoute, ProxySync};
