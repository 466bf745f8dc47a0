use std::time::Duration;

use thiserror::Error;

/// Renew when less than this much lifetime remains.
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Lifetime recorded for issued certificates when the chain itself can't
/// be parsed for notAfter.
pub const ISSUED_LIFETIME_DAYS: i64 = 90;

/// Minimum spacing between SAN checks for one domain.
pub const SAN_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Error backoff ladder; attempts beyond the ladder stay at the cap.
pub const BACKOFF_LADDER: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(2 * 60),
    Duration::from_secs(10 * 60),
    Duration::from_secs(30 * 60),
];

pub fn backoff_for(error_count: u32) -> Duration {
    let idx = (error_count.saturating_sub(1) as usize).min(BACKOFF_LADDER.len() - 1);
    BACKOFF_LADDER[idx]
}

/// Per-domain issuance progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Fresh,
    Requested,
    Issued,
    Saved,
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("challenge could not be published for {0}")]
    ChallengePublish(String),

    #[error("order failed: {0}")]
    OrderFailed(String),

    #[error("certificate parse error: {0}")]
    CertParse(String),

    #[error("acme protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("certificate generation error: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AcmeResult<T> = Result<T, AcmeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(30));
        assert_eq!(backoff_for(2), Duration::from_secs(120));
        assert_eq!(backoff_for(3), Duration::from_secs(600));
        assert_eq!(backoff_for(4), Duration::from_secs(1800));
        assert_eq!(backoff_for(99), Duration::from_secs(1800));
        assert_eq!(backoff_for(0), Duration::from_secs(30));
    }
}
