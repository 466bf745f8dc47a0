//! Runtime port discovery for freshly launched containers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use od_container::ContainerRuntime;

pub const PREFERRED_PORTS: [u16; 4] = [80, 8080, 3000, 5000];

const ATTEMPTS: u32 = 20;
const GRACE_ATTEMPTS: u32 = 5;
const ATTEMPT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// The declared port came up.
    Expected,
    /// Nothing on the declared port; the app listens here instead.
    Alternate(u16),
    /// Nothing listened before the attempts ran out.
    NotListening,
}

/// Poll the container for listeners: 20 attempts at 1 s. The declared port
/// wins immediately; other listeners are only accepted after a 5-attempt
/// grace period, preferring well-known HTTP ports.
pub async fn discover(
    runtime: &Arc<dyn ContainerRuntime>,
    container: &str,
    expected: u16,
) -> Discovery {
    for attempt in 1..=ATTEMPTS {
        let ports = match runtime.listening_ports(container).await {
            Ok(ports) => ports,
            Err(e) => {
                debug!(container, attempt, "Port scan failed: {e}");
                Vec::new()
            }
        };

        if ports.contains(&expected) {
            return Discovery::Expected;
        }

        if !ports.is_empty() && attempt > GRACE_ATTEMPTS {
            let chosen = PREFERRED_PORTS
                .iter()
                .copied()
                .find(|p| ports.contains(p))
                .unwrap_or(ports[0]);
            warn!(
                container,
                expected,
                chosen,
                "Declared port never came up, adopting observed listener"
            );
            return Discovery::Alternate(chosen);
        }

        if attempt < ATTEMPTS {
            tokio::time::sleep(ATTEMPT_INTERVAL).await;
        }
    }
    Discovery::NotListening
}
