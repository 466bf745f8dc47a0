//! Per-source fixed-window rate limiting for the resolver.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use od_config::RateLimitConfig;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed window per source IP, reset lazily on the first request after the
/// window expires. Loopback sources are always allowed.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<IpAddr, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: HashMap::new() }
    }

    pub fn set_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }

    pub fn allow(&mut self, source: IpAddr) -> bool {
        self.allow_at(source, Instant::now())
    }

    fn allow_at(&mut self, source: IpAddr, now: Instant) -> bool {
        if !self.config.enabled || source.is_loopback() {
            return true;
        }
        let window_len = Duration::from_millis(self.config.window_ms);
        let window = self
            .windows
            .entry(source)
            .or_insert(Window { started: now, count: 0 });
        if now.duration_since(window.started) >= window_len {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.config.max
    }

    /// Drop windows idle for more than one window length; called from the
    /// watchdog to bound the map.
    pub fn purge(&mut self) {
        let window_len = Duration::from_millis(self.config.window_ms);
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < window_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig { enabled: true, window_ms, max })
    }

    #[test]
    fn allows_up_to_max_then_blocks() {
        let mut rl = limiter(3, 60_000);
        let src: IpAddr = "203.0.113.9".parse().unwrap();
        let t0 = Instant::now();
        assert!(rl.allow_at(src, t0));
        assert!(rl.allow_at(src, t0));
        assert!(rl.allow_at(src, t0));
        assert!(!rl.allow_at(src, t0));
    }

    #[test]
    fn loopback_exempt() {
        let mut rl = limiter(1, 60_000);
        let src: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..10 {
            assert!(rl.allow_at(src, Instant::now()));
        }
    }

    #[test]
    fn window_resets_lazily() {
        let mut rl = limiter(1, 10);
        let src: IpAddr = "198.51.100.2".parse().unwrap();
        let t0 = Instant::now();
        assert!(rl.allow_at(src, t0));
        assert!(!rl.allow_at(src, t0));
        assert!(rl.allow_at(src, t0 + Duration::from_millis(11)));
    }

    #[test]
    fn disabled_allows_everything() {
        let mut rl = RateLimiter::new(RateLimitConfig {
            enabled: false,
            window_ms: 1,
            max: 0,
        });
        let src: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(rl.allow_at(src, Instant::now()));
    }

    #[test]
    fn sources_are_independent() {
        let mut rl = limiter(1, 60_000);
        let a: IpAddr = "203.0.113.9".parse().unwrap();
        let b: IpAddr = "203.0.113.10".parse().unwrap();
        let t0 = Instant::now();
        assert!(rl.allow_at(a, t0));
        assert!(!rl.allow_at(a, t0));
        assert!(rl.allow_at(b, t0));
    }
}
