//! Certificate engine: ACME DNS-01 issuance with SAN tracking, per-domain
//! backoff, and the self-signed system fallback.

pub mod engine;
pub mod san;
pub mod selfsigned;
pub mod types;

pub use engine::{ChallengeDns, SslEngine};
pub use types::{AcmeError, AcmeResult};
