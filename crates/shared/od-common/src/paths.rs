//! Resolution of the `~/.odac` state tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All persisted-state locations used by the platform.
///
/// The root defaults to `~/.odac` and can be overridden with `ODAC_HOME`
/// (tests point it at a temp dir). `ODAC_APPS_PATH`, `ODAC_WEB_PATH` and
/// `ODAC_SOCKET_PATH` override their respective subtrees individually.
#[derive(Debug, Clone)]
pub struct OdacPaths {
    root: PathBuf,
    apps: PathBuf,
    web: PathBuf,
    api_socket: PathBuf,
}

impl OdacPaths {
    pub fn from_env() -> Self {
        let root = std::env::var("ODAC_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
                PathBuf::from(home).join(".odac")
            });
        Self::at(root)
    }

    pub fn at(root: PathBuf) -> Self {
        let apps = std::env::var("ODAC_APPS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("apps"));
        let web = std::env::var("ODAC_WEB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("web"));
        let api_socket = std::env::var("ODAC_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.join("run").join("api.sock"));
        Self { root, apps, web, api_socket }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Pre-overwrite backups live next to the config dir.
    pub fn backup_dir(&self) -> PathBuf {
        self.config_dir().join(".bak")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.root.join("cert").join("ssl")
    }

    pub fn ssl_key_path(&self, domain: &str) -> PathBuf {
        self.cert_dir().join(format!("{domain}.key"))
    }

    pub fn ssl_cert_path(&self, domain: &str) -> PathBuf {
        self.cert_dir().join(format!("{domain}.crt"))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn api_socket(&self) -> &Path {
        &self.api_socket
    }

    pub fn proxy_pid(&self, instance: &str) -> PathBuf {
        self.run_dir().join(format!("proxy-{instance}.pid"))
    }

    pub fn proxy_socket(&self, instance: &str) -> PathBuf {
        self.run_dir().join(format!("proxy-{instance}.sock"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn proxy_log(&self) -> PathBuf {
        self.logs_dir().join("proxy.log")
    }

    pub fn app_log_dir(&self, app: &str) -> PathBuf {
        self.logs_dir().join(app)
    }

    pub fn app_runtime_log_dir(&self, app: &str) -> PathBuf {
        self.app_log_dir(app).join("runtime")
    }

    pub fn app_builds_dir(&self, app: &str) -> PathBuf {
        self.app_log_dir(app).join("builds")
    }

    pub fn apps_dir(&self) -> &Path {
        &self.apps
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.apps.join(app)
    }

    pub fn web_dir(&self) -> &Path {
        &self.web
    }

    pub fn mail_spool_dir(&self) -> PathBuf {
        self.root.join("mail").join("spool")
    }

    /// Create the whole tree. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.config_dir(),
            self.backup_dir(),
            self.cert_dir(),
            self.run_dir(),
            self.logs_dir(),
            self.apps.clone(),
            self.web.clone(),
            self.mail_spool_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let p = OdacPaths::at(PathBuf::from("/tmp/odac-test"));
        assert_eq!(p.config_dir(), PathBuf::from("/tmp/odac-test/config"));
        assert_eq!(
            p.ssl_cert_path("example.com"),
            PathBuf::from("/tmp/odac-test/cert/ssl/example.com.crt")
        );
        assert_eq!(
            p.proxy_pid("a1"),
            PathBuf::from("/tmp/odac-test/run/proxy-a1.pid")
        );
        assert_eq!(
            p.app_builds_dir("myapp"),
            PathBuf::from("/tmp/odac-test/logs/myapp/builds")
        );
    }
}
