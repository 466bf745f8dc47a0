//! Privileged host-resolver operations.
//!
//! Binding port 53 on a systemd host usually collides with the
//! systemd-resolved stub listener. These operations disable the stub and
//! point `/etc/resolv.conf` at a public recursive resolver while we own
//! port 53, restoring the original file on clean shutdown. Everything runs
//! as argv arrays; the trait lets tests substitute a mock.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const DROPIN_DIR: &str = "/etc/systemd/resolved.conf.d";
const DROPIN_FILE: &str = "/etc/systemd/resolved.conf.d/odac-dns.conf";
const DROPIN_CONTENT: &str = "[Resolve]\nDNSStubListener=no\n";
const PUBLIC_RESOLV: &str = "# Managed by odac while it serves port 53.\nnameserver 1.1.1.1\nnameserver 8.8.8.8\n";
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait ResolverOps: Send + Sync {
    /// Free port 53 held by the host's stub resolver.
    async fn release_stub_listener(&self) -> Result<()>;

    /// Point the host at a public recursive resolver (we are now
    /// authoritative-only on 53 and cannot serve the host's own lookups).
    async fn point_resolver_to_public(&self) -> Result<()>;

    /// Undo `point_resolver_to_public`.
    async fn restore(&self) -> Result<()>;
}

pub struct SystemdResolvedOps {
    saved_resolv: Mutex<Option<String>>,
}

impl SystemdResolvedOps {
    pub fn new() -> Self {
        Self { saved_resolv: Mutex::new(None) }
    }

    async fn systemctl(args: &[&str]) -> Result<()> {
        let run = Command::new("systemctl").args(args).output();
        let output = tokio::time::timeout(SYSTEMCTL_TIMEOUT, run)
            .await
            .context("systemctl timed out")?
            .context("failed to run systemctl")?;
        if !output.status.success() {
            bail!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

impl Default for SystemdResolvedOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResolverOps for SystemdResolvedOps {
    async fn release_stub_listener(&self) -> Result<()> {
        tokio::fs::create_dir_all(PathBuf::from(DROPIN_DIR))
            .await
            .context("failed to create resolved drop-in dir")?;
        tokio::fs::write(DROPIN_FILE, DROPIN_CONTENT)
            .await
            .context("failed to write resolved drop-in")?;
        Self::systemctl(&["restart", "systemd-resolved"]).await?;
        info!("systemd-resolved stub listener disabled");
        Ok(())
    }

    async fn point_resolver_to_public(&self) -> Result<()> {
        let current = tokio::fs::read_to_string(RESOLV_CONF).await.ok();
        {
            let mut saved = self.saved_resolv.lock().await;
            if saved.is_none() {
                *saved = current;
            }
        }
        tokio::fs::write(RESOLV_CONF, PUBLIC_RESOLV)
            .await
            .context("failed to rewrite resolv.conf")?;
        info!("Host resolver pointed at public recursive DNS");
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let saved = self.saved_resolv.lock().await.take();
        if let Some(content) = saved {
            tokio::fs::write(RESOLV_CONF, content)
                .await
                .context("failed to restore resolv.conf")?;
            info!("Host resolver restored");
        }
        let _ = tokio::fs::remove_file(DROPIN_FILE).await;
        if let Err(e) = Self::systemctl(&["restart", "systemd-resolved"]).await {
            warn!("Could not restart systemd-resolved during restore: {e}");
        }
        Ok(())
    }
}

/// Used in containers and tests where the host resolver is out of reach.
pub struct NoopResolverOps;

#[async_trait]
impl ResolverOps for NoopResolverOps {
    async fn release_stub_listener(&self) -> Result<()> {
        bail!("host resolver not managed in this environment")
    }

    async fn point_resolver_to_public(&self) -> Result<()> {
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        Ok(())
    }
}
