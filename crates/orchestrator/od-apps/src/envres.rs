//! Launch-time environment resolution.

use std::collections::BTreeMap;

use od_common::token;
use od_config::{AppRecord, AppsConfig};

/// Mount point of the control-API socket inside sandboxed containers.
pub const API_SOCKET_MOUNT: &str = "/odac/api.sock";

/// Resolve the environment an app launches with:
///
/// 1. `ODAC_APP=true` seed;
/// 2. `manual` values of each linked app, in link order (one level only —
///    links of linked apps are not followed);
/// 3. this app's own `manual` values;
/// 4. framework `PORT`, plus `ODAC_API_KEY` / `ODAC_API_SOCKET` when the
///    app holds API capabilities.
pub fn resolve(
    app: &AppRecord,
    all: &AppsConfig,
    root_key: &str,
    port: u16,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("ODAC_APP".to_string(), "true".to_string());

    for linked_name in &app.env.linked {
        if let Some(linked) = all.by_name(linked_name) {
            for (key, value) in &linked.env.manual {
                env.insert(key.clone(), value.clone());
            }
        }
    }

    for (key, value) in &app.env.manual {
        env.insert(key.clone(), value.clone());
    }

    env.insert("PORT".to_string(), port.to_string());
    if app.api.is_some() {
        env.insert("ODAC_API_KEY".to_string(), token::derive(root_key, &app.name));
        env.insert("ODAC_API_SOCKET".to_string(), API_SOCKET_MOUNT.to_string());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use od_config::{AppStatus, AppType, EnvSpec};

    fn app(name: &str, manual: &[(&str, &str)], linked: &[&str]) -> AppRecord {
        AppRecord {
            id: 1,
            name: name.into(),
            app_type: AppType::Git,
            image: None,
            url: None,
            branch: None,
            git: None,
            file: None,
            ports: vec![],
            volumes: vec![],
            env: EnvSpec {
                manual: manual
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                linked: linked.iter().map(|s| s.to_string()).collect(),
            },
            api: None,
            dev: None,
            active: true,
            status: AppStatus::Stopped,
            created: Utc::now(),
            started: None,
            commit_sha: None,
            port: None,
            container_ip: None,
        }
    }

    #[test]
    fn own_manual_overrides_linked() {
        let mut all = AppsConfig::default();
        all.apps.push(app("db", &[("DB_URL", "postgres://db"), ("SHARED", "from-db")], &[]));
        let web = app("web", &[("SHARED", "from-web")], &["db"]);
        all.apps.push(web.clone());

        let env = resolve(&web, &all, "rootkey", 3000);
        assert_eq!(env["ODAC_APP"], "true");
        assert_eq!(env["DB_URL"], "postgres://db");
        assert_eq!(env["SHARED"], "from-web");
        assert_eq!(env["PORT"], "3000");
        assert!(!env.contains_key("ODAC_API_KEY"));
    }

    #[test]
    fn links_are_not_recursive() {
        let mut all = AppsConfig::default();
        all.apps.push(app("c", &[("DEEP", "secret")], &[]));
        all.apps.push(app("b", &[("MID", "yes")], &["c"]));
        let a = app("a", &[], &["b"]);
        all.apps.push(a.clone());

        let env = resolve(&a, &all, "rootkey", 3000);
        assert_eq!(env["MID"], "yes");
        assert!(!env.contains_key("DEEP"));
    }

    #[test]
    fn api_capability_injects_token_and_socket() {
        let mut all = AppsConfig::default();
        let mut a = app("mailer", &[], &[]);
        a.api = Some(vec!["mail.send".to_string()]);
        all.apps.push(a.clone());

        let env = resolve(&a, &all, "rootkey", 8080);
        assert_eq!(env["ODAC_API_KEY"], token::derive("rootkey", "mailer"));
        assert_eq!(env["ODAC_API_SOCKET"], API_SOCKET_MOUNT);
    }

    #[test]
    fn missing_linked_app_is_skipped() {
        let mut all = AppsConfig::default();
        let a = app("a", &[("K", "v")], &["ghost"]);
        all.apps.push(a.clone());
        let env = resolve(&a, &all, "rootkey", 3000);
        assert_eq!(env["K"], "v");
    }
}
