//! Data-plane process supervision with zero-downtime adoption.
//!
//! On (re)start we first try to adopt a proxy left behind by a previous
//! control-plane instance: live PID, socket file present and, on Linux,
//! a `/proc/<pid>/cmdline` match. Anything less is treated as PID reuse
//! and the stale PID file is discarded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use od_common::OdacPaths;

pub const PROXY_BINARY: &str = "odac-proxy";

/// Container name the supervisor and proxy sync agree on for an app.
pub fn app_container_name(app: &str) -> String {
    format!("odac-{app}")
}

pub struct ProxySupervisor {
    paths: OdacPaths,
    instance_id: String,
    /// During a declared self-update the PID file is overwritten rather
    /// than created O_EXCL: the previous instance still owns the old one.
    update_mode: bool,
    child: Arc<Mutex<Option<Child>>>,
}

impl ProxySupervisor {
    pub fn new(paths: OdacPaths, instance_id: &str, update_mode: bool) -> Self {
        Self {
            paths,
            instance_id: instance_id.to_string(),
            update_mode,
            child: Arc::new(Mutex::new(None)),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.paths.proxy_socket(&self.instance_id)
    }

    fn pid_path(&self) -> PathBuf {
        self.paths.proxy_pid(&self.instance_id)
    }

    /// Start or adopt the data plane. Returns whether a fresh process was
    /// spawned (false = adopted).
    pub async fn start(&self) -> Result<bool> {
        let pid_path = self.pid_path();
        if let Some(pid) = read_pid(&pid_path) {
            if self.can_adopt(pid) {
                info!(pid, "Adopted running data-plane proxy");
                return Ok(false);
            }
            warn!(pid, "Stale proxy PID file, discarding");
            let _ = std::fs::remove_file(&pid_path);
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.proxy_log())
            .context("could not open proxy log")?;
        let log_err = log.try_clone().context("could not clone proxy log handle")?;

        let child = Command::new(PROXY_BINARY)
            .arg("--socket")
            .arg(self.socket_path())
            .env("ODAC_INSTANCE_ID", &self.instance_id)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .context("could not spawn odac-proxy")?;

        let pid = child.id().context("spawned proxy has no pid")?;
        self.write_pid_file(pid)?;
        *self.child.lock().await = Some(child);
        info!(pid, "Data-plane proxy started");
        Ok(true)
    }

    /// Adoption checks: PID alive, socket present, and the process really
    /// is our binary (PID-reuse defense).
    fn can_adopt(&self, pid: u32) -> bool {
        if !pid_alive(pid) {
            return false;
        }
        if !self.socket_path().exists() {
            return false;
        }
        if cfg!(target_os = "linux") {
            return cmdline_matches(pid, PROXY_BINARY);
        }
        true
    }

    fn write_pid_file(&self, pid: u32) -> Result<()> {
        let path = self.pid_path();
        if self.update_mode {
            std::fs::write(&path, pid.to_string())
                .with_context(|| format!("write {}", path.display()))?;
        } else {
            // O_EXCL: a concurrent starter loses instead of clobbering.
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .with_context(|| format!("create {}", path.display()))?;
            write!(file, "{pid}")?;
        }
        Ok(())
    }

    /// Stop the data plane and clean up its handles.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                warn!("Proxy kill failed: {e}");
            }
            let _ = child.wait().await;
        } else if let Some(pid) = read_pid(&self.pid_path()) {
            // Adopted process: signal it by pid.
            let _ = Command::new("kill").arg(pid.to_string()).output().await;
        }
        let _ = std::fs::remove_file(self.pid_path());
        let _ = std::fs::remove_file(self.socket_path());
        info!("Data-plane proxy stopped");
    }

    /// Watchdog hook: respawn when the process is gone.
    pub async fn check(&self) {
        let alive = {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(%status, "Data-plane proxy exited");
                        *guard = None;
                        false
                    }
                    Ok(None) => true,
                    Err(_) => false,
                },
                None => read_pid(&self.pid_path()).is_some_and(pid_alive),
            }
        };
        if !alive {
            let _ = std::fs::remove_file(self.pid_path());
            if let Err(e) = self.start().await {
                warn!("Data-plane restart failed: {e}");
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn cmdline_matches(pid: u32, needle: &str) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let argv0 = raw.split(|b| *b == 0).next().unwrap_or_default();
            String::from_utf8_lossy(argv0).contains(needle)
        }
        Err(_) => false,
    }
}
