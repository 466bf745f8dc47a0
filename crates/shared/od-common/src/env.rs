//! Process environment snapshot taken once at boot.

/// Runtime flags handed to the daemon by its launcher (CLI or the previous
/// instance during a self-update handover).
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// Identifier of this daemon instance, used to key the data-plane
    /// pid/socket files so two instances can coexist during handover.
    pub instance_id: String,
    /// Instance being replaced, if this process was started by an update.
    pub previous_instance_id: Option<String>,
    /// Set while a self-update is in flight; postpones data-plane starts.
    pub update_mode: bool,
    pub debug: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            instance_id: std::env::var("ODAC_INSTANCE_ID")
                .unwrap_or_else(|_| "main".to_string()),
            previous_instance_id: std::env::var("ODAC_PREVIOUS_INSTANCE_ID").ok(),
            update_mode: env_flag("ODAC_UPDATE_MODE"),
            debug: env_flag("ODAC_DEBUG"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}
