//! App lifecycle: create → run → (redeploy)* → delete, reconciled by the
//! watchdog tick.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use od_common::events::AppStatusEvent;
use od_common::progress::{ProgressSink, ProgressStatus, report};
use od_common::validation::{ValidationError, validate_app_name};
use od_common::EventBus;
use od_config::{
    AppRecord, AppStatus, AppType, ConfigStore, EnvSpec, GitSource, Module, PortMapping,
    VolumeMapping,
};
use od_container::{ContainerRuntime, RunSpec};
use od_git::{CheckoutRef, RepoFetcher};

use crate::buildlog::{self, BuildLog};
use crate::envres;
use crate::guards::GuardSets;
use crate::ports::{self, Discovery};

pub const DEFAULT_APP_PORT: u16 = 3000;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("app not found: {0}")]
    NotFound(String),

    #[error("app already exists: {0}")]
    AlreadyExists(String),

    #[error("app {0} is already being created")]
    AlreadyBeingCreated(String),

    #[error("app {0} is already being processed")]
    AlreadyProcessing(String),

    #[error("app {0} is not a git app")]
    NotGitApp(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("deploy failed in phase {phase}: {message}")]
    Deploy { phase: &'static str, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CreateGitRequest {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    /// Clone credential, forwarded through the environment only.
    pub token: Option<String>,
    /// Explicit container port; otherwise taken from the image, else 3000.
    pub port: Option<u16>,
    pub env: EnvSpec,
    pub api: Option<Vec<String>>,
}

pub struct AppSupervisor {
    store: Arc<ConfigStore>,
    runtime: Arc<dyn ContainerRuntime>,
    git: Arc<dyn RepoFetcher>,
    events: Arc<EventBus>,
    guards: Arc<GuardSets>,
    attached_logs: Arc<Mutex<HashSet<String>>>,
}

pub fn container_name(app: &str) -> String {
    format!("odac-{app}")
}

fn image_tag(app: &str, build_id: &str) -> String {
    format!("odac-app-{app}:{build_id}")
}

impl AppSupervisor {
    pub fn new(
        store: Arc<ConfigStore>,
        runtime: Arc<dyn ContainerRuntime>,
        git: Arc<dyn RepoFetcher>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime,
            git,
            events,
            guards: GuardSets::new(),
            attached_logs: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn guards(&self) -> &Arc<GuardSets> {
        &self.guards
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        self.store.read().await.apps.apps.clone()
    }

    // ── create (git) ────────────────────────────────────────────

    pub async fn create_git(
        self: &Arc<Self>,
        req: CreateGitRequest,
        progress: Option<ProgressSink>,
    ) -> Result<AppRecord, AppError> {
        validate_app_name(&req.name)?;
        let Some(_creating) = self.guards.try_creating(&req.name) else {
            return Err(AppError::AlreadyBeingCreated(req.name.clone()));
        };
        if self.store.read().await.apps.by_name(&req.name).is_some() {
            return Err(AppError::AlreadyExists(req.name.clone()));
        }

        let mut log = BuildLog::create(self.store.paths(), &req.name)
            .context("could not open build log")?;
        log.set_metadata(serde_json::json!({
            "url": req.url,
            "branch": req.branch,
            "commitSha": req.commit_sha,
        }));

        let result = self.git_create_pipeline(&req, &mut log, &progress).await;
        match result {
            Ok(record) => {
                let _ = log.finalize(true);
                report(&progress, "create", ProgressStatus::Success, "app running");
                self.emit_status(&record.name, "running", None);
                Ok(record)
            }
            Err(e) => {
                log.phase_end(false);
                let _ = log.finalize(false);
                report(&progress, "create", ProgressStatus::Error, &e.to_string());
                // The record only exists once the build succeeded; if it
                // does, surface the failure on it.
                self.set_status(&req.name, AppStatus::Errored).await;
                Err(e)
            }
        }
    }

    async fn git_create_pipeline(
        self: &Arc<Self>,
        req: &CreateGitRequest,
        log: &mut BuildLog,
        progress: &Option<ProgressSink>,
    ) -> Result<AppRecord, AppError> {
        // validate
        log.phase_start("validate");
        report(progress, "validate", ProgressStatus::Progress, "validating inputs");
        let target = CheckoutRef {
            branch: req.branch.clone(),
            commit_sha: req.commit_sha.clone(),
        };
        od_common::validation::validate_git_url(&req.url)?;
        target.validate()?;
        log.phase_end(true);

        // clone
        log.phase_start("clone");
        report(progress, "clone", ProgressStatus::Progress, "fetching repository");
        let app_dir = self.store.paths().app_dir(&req.name);
        tokio::fs::create_dir_all(&app_dir)
            .await
            .context("could not create app directory")?;
        self.git
            .clone_repo(&req.url, &target, &app_dir, req.token.as_deref())
            .await
            .map_err(|e| AppError::Deploy { phase: "clone", message: e.to_string() })?;
        log.phase_end(true);

        // build
        log.phase_start("build");
        report(progress, "build", ProgressStatus::Progress, "building image");
        let tag = image_tag(&req.name, log.id());
        let built = self.run_build(&tag, &app_dir, log).await?;
        if !built {
            return Err(AppError::Deploy { phase: "build", message: "image build failed".into() });
        }
        log.phase_end(true);

        // detect port
        log.phase_start("detect_port");
        let port = match req.port {
            Some(port) => port,
            None => self
                .runtime
                .image_exposed_port(&tag)
                .await
                .ok()
                .flatten()
                .unwrap_or(DEFAULT_APP_PORT),
        };
        log.analyze_line(&format!("using container port {port}"));
        log.phase_end(true);

        // register
        let commit_sha = self.git.head_sha(&app_dir).await.ok().or(req.commit_sha.clone());
        let record = self
            .store
            .update(Module::Apps, |tree| {
                let record = AppRecord {
                    id: tree.apps.next_id(),
                    name: req.name.clone(),
                    app_type: AppType::Git,
                    image: Some(tag.clone()),
                    url: Some(req.url.clone()),
                    branch: Some(req.branch.clone()),
                    git: Some(GitSource {
                        repo: req.url.clone(),
                        provider: None,
                        branch: req.branch.clone(),
                    }),
                    file: None,
                    ports: vec![PortMapping { host: None, container: port }],
                    volumes: Vec::new(),
                    env: req.env.clone(),
                    api: req.api.clone(),
                    dev: None,
                    active: true,
                    status: AppStatus::Starting,
                    created: Utc::now(),
                    started: None,
                    commit_sha,
                    port: None,
                    container_ip: None,
                };
                tree.apps.apps.push(record.clone());
                record
            })
            .await;

        // run
        log.phase_start("run");
        report(progress, "run", ProgressStatus::Progress, "starting container");
        self.launch(&record).await.map_err(|e| AppError::Deploy {
            phase: "run",
            message: e.to_string(),
        })?;
        self.after_launch(&req.name, port).await;
        log.phase_end(true);

        let record = self
            .store
            .read()
            .await
            .apps
            .by_name(&req.name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(req.name.clone()))?;
        Ok(record)
    }

    async fn run_build(
        &self,
        tag: &str,
        dir: &PathBuf,
        log: &mut BuildLog,
    ) -> Result<bool, AppError> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let build = self.runtime.build_image(tag, dir, tx);
        let drain = async {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        };
        let (built, lines) = tokio::join!(build, drain);
        for line in &lines {
            log.analyze_line(line);
        }
        Ok(built.context("image build did not run")?)
    }

    // ── create (container / script) ─────────────────────────────

    pub async fn create_container(
        self: &Arc<Self>,
        name: &str,
        image: &str,
        ports: Vec<PortMapping>,
        volumes: Vec<VolumeMapping>,
        env: EnvSpec,
    ) -> Result<AppRecord, AppError> {
        validate_app_name(name)?;
        let Some(_creating) = self.guards.try_creating(name) else {
            return Err(AppError::AlreadyBeingCreated(name.to_string()));
        };
        if self.store.read().await.apps.by_name(name).is_some() {
            return Err(AppError::AlreadyExists(name.to_string()));
        }

        let port = ports.first().map(|p| p.container).unwrap_or(DEFAULT_APP_PORT);
        let record = self
            .store
            .update(Module::Apps, |tree| {
                let record = AppRecord {
                    id: tree.apps.next_id(),
                    name: name.to_string(),
                    app_type: AppType::Container,
                    image: Some(image.to_string()),
                    url: None,
                    branch: None,
                    git: None,
                    file: None,
                    ports: if ports.is_empty() {
                        vec![PortMapping { host: None, container: port }]
                    } else {
                        ports.clone()
                    },
                    volumes: volumes.clone(),
                    env: env.clone(),
                    api: None,
                    dev: None,
                    active: true,
                    status: AppStatus::Installing,
                    created: Utc::now(),
                    started: None,
                    commit_sha: None,
                    port: None,
                    container_ip: None,
                };
                tree.apps.apps.push(record.clone());
                record
            })
            .await;

        self.set_status(name, AppStatus::Starting).await;
        if let Err(e) = self.launch(&record).await {
            self.set_status(name, AppStatus::Errored).await;
            return Err(AppError::Deploy { phase: "run", message: e.to_string() });
        }
        self.after_launch(name, port).await;
        self.emit_status(name, "running", None);
        Ok(record)
    }

    pub async fn create_script(
        self: &Arc<Self>,
        name: &str,
        file: &str,
        env: EnvSpec,
    ) -> Result<AppRecord, AppError> {
        validate_app_name(name)?;
        script_runner(file).ok_or_else(|| AppError::Deploy {
            phase: "validate",
            message: format!("unsupported script type: {file}"),
        })?;
        let Some(_creating) = self.guards.try_creating(name) else {
            return Err(AppError::AlreadyBeingCreated(name.to_string()));
        };
        if self.store.read().await.apps.by_name(name).is_some() {
            return Err(AppError::AlreadyExists(name.to_string()));
        }

        let record = self
            .store
            .update(Module::Apps, |tree| {
                let record = AppRecord {
                    id: tree.apps.next_id(),
                    name: name.to_string(),
                    app_type: AppType::Script,
                    image: None,
                    url: None,
                    branch: None,
                    git: None,
                    file: Some(file.to_string()),
                    ports: vec![PortMapping { host: None, container: DEFAULT_APP_PORT }],
                    volumes: Vec::new(),
                    env: env.clone(),
                    api: None,
                    dev: None,
                    active: true,
                    status: AppStatus::Starting,
                    created: Utc::now(),
                    started: None,
                    commit_sha: None,
                    port: None,
                    container_ip: None,
                };
                tree.apps.apps.push(record.clone());
                record
            })
            .await;

        if let Err(e) = self.launch(&record).await {
            self.set_status(name, AppStatus::Errored).await;
            return Err(AppError::Deploy { phase: "run", message: e.to_string() });
        }
        self.after_launch(name, DEFAULT_APP_PORT).await;
        self.emit_status(name, "running", None);
        Ok(record)
    }

    // ── start / stop / restart / delete ─────────────────────────

    pub async fn start(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let Some(_processing) = self.guards.try_processing(name) else {
            return Err(AppError::AlreadyProcessing(name.to_string()));
        };
        self.start_locked(name).await
    }

    async fn start_locked(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let record = self
            .store
            .read()
            .await
            .apps
            .by_name(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(name.to_string()))?;

        self.set_status(name, AppStatus::Starting).await;
        if let Err(e) = self.launch(&record).await {
            self.set_status(name, AppStatus::Errored).await;
            return Err(AppError::Deploy { phase: "run", message: e.to_string() });
        }
        let port = record
            .ports
            .first()
            .map(|p| p.container)
            .unwrap_or(DEFAULT_APP_PORT);
        self.after_launch(name, port).await;
        self.emit_status(name, "running", None);
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let Some(_processing) = self.guards.try_processing(name) else {
            return Err(AppError::AlreadyProcessing(name.to_string()));
        };
        self.stop_locked(name).await
    }

    async fn stop_locked(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        if self.store.read().await.apps.by_name(name).is_none() {
            return Err(AppError::NotFound(name.to_string()));
        }
        if let Err(e) = self.runtime.stop(&container_name(name)).await {
            debug!(app = name, "Stop reported: {e}");
        }
        self.set_status(name, AppStatus::Stopped).await;
        self.store
            .update(Module::Apps, |tree| {
                if let Some(app) = tree.apps.by_name_mut(name) {
                    app.active = false;
                }
            })
            .await;
        self.emit_status(name, "stopped", None);
        Ok(())
    }

    /// Idempotent: restarting a stopped or running app converges on one
    /// running instance.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let Some(_processing) = self.guards.try_processing(name) else {
            return Err(AppError::AlreadyProcessing(name.to_string()));
        };
        if self.store.read().await.apps.by_name(name).is_none() {
            return Err(AppError::NotFound(name.to_string()));
        }
        if let Err(e) = self.runtime.stop(&container_name(name)).await {
            debug!(app = name, "Stop before restart: {e}");
        }
        self.store
            .update(Module::Apps, |tree| {
                if let Some(app) = tree.apps.by_name_mut(name) {
                    app.active = true;
                }
            })
            .await;
        self.start_locked(name).await
    }

    pub async fn delete(self: &Arc<Self>, name: &str) -> Result<(), AppError> {
        let Some(_processing) = self.guards.try_processing(name) else {
            return Err(AppError::AlreadyProcessing(name.to_string()));
        };
        let record = self
            .store
            .read()
            .await
            .apps
            .by_name(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(name.to_string()))?;

        let container = container_name(name);
        if let Err(e) = self.runtime.stop(&container).await {
            debug!(app = name, "Stop during delete: {e}");
        }
        if let Err(e) = self.runtime.remove(&container).await {
            warn!(app = name, "Container removal failed: {e}");
        }
        if record.app_type == AppType::Git {
            if let Some(image) = &record.image {
                let _ = self.runtime.remove_image(image).await;
            }
            let app_dir = self.store.paths().app_dir(name);
            if let Err(e) = tokio::fs::remove_dir_all(&app_dir).await {
                debug!(app = name, "App dir removal: {e}");
            }
        }

        self.store
            .update(Module::Apps, |tree| {
                tree.apps.apps.retain(|a| a.name != name);
            })
            .await;
        self.attached_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        info!(app = name, "App deleted");
        self.emit_status(name, "deleted", None);
        Ok(())
    }

    // ── redeploy ────────────────────────────────────────────────

    /// Rebuild and replace a running git app. The old container keeps
    /// serving through fetch and build; the watchdog cannot interleave
    /// because the `processing` guard is held for the whole sequence.
    pub async fn redeploy(
        self: &Arc<Self>,
        name: &str,
        commit_sha: Option<String>,
        progress: Option<ProgressSink>,
    ) -> Result<(), AppError> {
        let Some(_processing) = self.guards.try_processing(name) else {
            return Err(AppError::AlreadyProcessing(name.to_string()));
        };

        let record = self
            .store
            .read()
            .await
            .apps
            .by_name(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(name.to_string()))?;
        let git = record
            .git
            .clone()
            .ok_or_else(|| AppError::NotGitApp(name.to_string()))?;

        let mut log = BuildLog::create(self.store.paths(), name)
            .context("could not open build log")?;
        log.set_metadata(serde_json::json!({
            "redeploy": true,
            "commitSha": commit_sha,
        }));

        self.set_status(name, AppStatus::Updating).await;
        let result = self
            .redeploy_pipeline(name, &record, &git, commit_sha, &mut log, &progress)
            .await;

        match result {
            Ok(()) => {
                let _ = log.finalize(true);
                report(&progress, "redeploy", ProgressStatus::Success, "redeploy complete");
                Ok(())
            }
            Err(e) => {
                log.phase_end(false);
                let _ = log.finalize(false);
                self.set_status(name, AppStatus::Errored).await;
                report(&progress, "redeploy", ProgressStatus::Error, &e.to_string());
                // The previous image stays in place for rollback.
                Err(e)
            }
        }
    }

    async fn redeploy_pipeline(
        self: &Arc<Self>,
        name: &str,
        record: &AppRecord,
        git: &GitSource,
        commit_sha: Option<String>,
        log: &mut BuildLog,
        progress: &Option<ProgressSink>,
    ) -> Result<(), AppError> {
        let app_dir = self.store.paths().app_dir(name);
        let target = CheckoutRef {
            branch: git.branch.clone(),
            commit_sha,
        };

        log.phase_start("fetchRepo");
        report(progress, "fetchRepo", ProgressStatus::Progress, "updating sources");
        if self.git.is_repo(&app_dir) {
            self.git
                .fetch(&app_dir, &target, None)
                .await
                .map_err(|e| AppError::Deploy { phase: "fetchRepo", message: e.to_string() })?;
        } else {
            tokio::fs::create_dir_all(&app_dir)
                .await
                .context("could not recreate app directory")?;
            self.git
                .clone_repo(&git.repo, &target, &app_dir, None)
                .await
                .map_err(|e| AppError::Deploy { phase: "fetchRepo", message: e.to_string() })?;
        }
        log.phase_end(true);

        log.phase_start("build");
        report(progress, "build", ProgressStatus::Progress, "building new image");
        self.set_status(name, AppStatus::Building).await;
        let new_tag = image_tag(name, log.id());
        let built = self.run_build(&new_tag, &app_dir, log).await?;
        if !built {
            return Err(AppError::Deploy { phase: "build", message: "image build failed".into() });
        }
        log.phase_end(true);

        // The handover: everything before this point left the old
        // container serving.
        log.phase_start("stop");
        report(progress, "stop", ProgressStatus::Progress, "stopping old container");
        let container = container_name(name);
        if let Err(e) = self.runtime.stop(&container).await {
            debug!(app = name, "Old container stop: {e}");
        }
        let _ = self.runtime.remove(&container).await;
        log.phase_end(true);

        log.phase_start("start");
        report(progress, "start", ProgressStatus::Progress, "starting new container");
        let sha = self.git.head_sha(&app_dir).await.ok();
        let updated = self
            .store
            .update(Module::Apps, |tree| {
                let app = tree.apps.by_name_mut(name)?;
                app.image = Some(new_tag.clone());
                app.status = AppStatus::Starting;
                app.commit_sha = sha.clone().or(app.commit_sha.take());
                Some(app.clone())
            })
            .await
            .ok_or_else(|| AppError::NotFound(name.to_string()))?;
        self.launch(&updated)
            .await
            .map_err(|e| AppError::Deploy { phase: "start", message: e.to_string() })?;
        let port = record
            .ports
            .first()
            .map(|p| p.container)
            .unwrap_or(DEFAULT_APP_PORT);
        self.after_launch(name, port).await;
        log.phase_end(true);

        log.phase_start("proxy_propagation");
        self.emit_status(name, "running", Some("redeployed"));
        log.phase_end(true);
        Ok(())
    }

    // ── launch internals ────────────────────────────────────────

    async fn launch(&self, record: &AppRecord) -> anyhow::Result<()> {
        let container = container_name(&record.name);
        // A stale container under our name blocks the new one.
        let _ = self.runtime.remove(&container).await;

        let (image, cmd, mut volumes) = match record.app_type {
            AppType::Script => {
                let file = record.file.clone().context("script app without file")?;
                let (runner, cmd) = script_runner(&file).context("unsupported script type")?;
                let script_path = PathBuf::from(&file);
                let host_dir = script_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                let volumes = vec![VolumeMapping {
                    host: host_dir.display().to_string(),
                    container: "/app".to_string(),
                }];
                (runner.to_string(), cmd, volumes)
            }
            AppType::Container | AppType::Git => {
                let image = record.image.clone().context("app without image")?;
                (image, Vec::new(), record.volumes.clone())
            }
        };

        let port = record
            .ports
            .first()
            .map(|p| p.container)
            .unwrap_or(DEFAULT_APP_PORT);
        let (env, api_socket) = {
            let tree = self.store.read().await;
            (
                envres::resolve(record, &tree.apps, &tree.api.auth, port),
                self.store.paths().api_socket().to_path_buf(),
            )
        };
        if record.api.is_some() {
            volumes.push(VolumeMapping {
                host: api_socket.display().to_string(),
                container: envres::API_SOCKET_MOUNT.to_string(),
            });
        }

        self.runtime
            .run(&RunSpec {
                name: container,
                image,
                ports: record.ports.clone(),
                volumes,
                env,
                cmd,
            })
            .await?;
        Ok(())
    }

    /// Post-launch steps shared by every start path: port discovery,
    /// container IP caching, final state transition.
    async fn after_launch(self: &Arc<Self>, name: &str, expected_port: u16) {
        let container = container_name(name);

        match ports::discover(&self.runtime, &container, expected_port).await {
            Discovery::Expected => {}
            Discovery::Alternate(port) => {
                self.store
                    .update(Module::Apps, |tree| {
                        if let Some(app) = tree.apps.by_name_mut(name) {
                            app.ports = vec![PortMapping { host: None, container: port }];
                        }
                    })
                    .await;
            }
            Discovery::NotListening => {
                warn!(app = name, "No listener detected after launch");
            }
        }

        let ip = self.runtime.container_ip(&container).await.ok().flatten();
        self.store
            .update(Module::Apps, |tree| {
                if let Some(app) = tree.apps.by_name_mut(name) {
                    app.container_ip = ip.clone();
                    app.status = AppStatus::Running;
                    app.started = Some(Utc::now());
                    app.active = true;
                }
            })
            .await;

        self.attach_runtime_log(name).await;
    }

    // ── watchdog ────────────────────────────────────────────────

    /// One reconciliation pass: every active app outside `processing` is
    /// compared with the runtime and restarted when its backend is gone.
    pub async fn check(self: &Arc<Self>) {
        let apps: Vec<AppRecord> = self.store.read().await.apps.apps.clone();
        for app in apps {
            if !app.active || self.guards.is_processing(&app.name) {
                continue;
            }
            let alive = self
                .runtime
                .is_running(&container_name(&app.name))
                .await
                .unwrap_or(false);

            if alive {
                self.attach_runtime_log(&app.name).await;
                continue;
            }

            let should_restart = match app.status {
                AppStatus::Running => {
                    warn!(app = app.name, "Backend died, restarting");
                    true
                }
                AppStatus::Stopped
                | AppStatus::Errored
                | AppStatus::Starting
                | AppStatus::Installing => false,
                AppStatus::Building | AppStatus::Updating => true,
            };
            if should_restart {
                let supervisor = Arc::clone(self);
                let name = app.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.start(&name).await {
                        debug!(app = name, "Watchdog restart skipped: {e}");
                    }
                });
            }
        }
    }

    /// Managed third-party services run through the same runtime calls.
    pub async fn check_services(&self) {
        let services = self.store.read().await.services.services.clone();
        for service in services {
            if !service.active {
                continue;
            }
            let container = format!("odac-svc-{}", service.name);
            let alive = self.runtime.is_running(&container).await.unwrap_or(false);
            if alive {
                continue;
            }
            let _ = self.runtime.remove(&container).await;
            let spec = RunSpec {
                name: container,
                image: service.image.clone(),
                ports: service.ports.clone(),
                volumes: service.volumes.clone(),
                env: service.env.clone(),
                cmd: Vec::new(),
            };
            if let Err(e) = self.runtime.run(&spec).await {
                warn!(service = service.name, "Service restart failed: {e}");
                self.store
                    .update(Module::Services, |tree| {
                        if let Some(s) =
                            tree.services.services.iter_mut().find(|s| s.name == service.name)
                        {
                            s.status = AppStatus::Errored;
                        }
                    })
                    .await;
            } else {
                self.store
                    .update(Module::Services, |tree| {
                        if let Some(s) =
                            tree.services.services.iter_mut().find(|s| s.name == service.name)
                        {
                            s.status = AppStatus::Running;
                        }
                    })
                    .await;
            }
        }
    }

    /// Log housekeeping, run off the slow maintenance tick.
    pub async fn rotate_logs(&self) {
        let names: Vec<String> = self
            .store
            .read()
            .await
            .apps
            .apps
            .iter()
            .map(|a| a.name.clone())
            .collect();
        for name in names {
            buildlog::purge_runtime_logs(self.store.paths(), &name);
        }
    }

    // ── helpers ─────────────────────────────────────────────────

    async fn attach_runtime_log(&self, name: &str) {
        {
            let attached = self.attached_logs.lock().unwrap_or_else(|e| e.into_inner());
            if attached.contains(name) {
                return;
            }
        }
        let (tx, mut rx) = mpsc::channel::<String>(256);
        if self
            .runtime
            .attach_logs(&container_name(name), tx)
            .await
            .is_err()
        {
            return;
        }
        self.attached_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());

        let dir = self.store.paths().app_runtime_log_dir(name);
        let attached = Arc::clone(&self.attached_logs);
        let name = name.to_string();
        tokio::spawn(async move {
            let _ = tokio::fs::create_dir_all(&dir).await;
            while let Some(line) = rx.recv().await {
                let path = dir.join(format!("{}.log", Utc::now().format("%Y-%m-%d")));
                let stamped = format!("{} {line}\n", Utc::now().format("%H:%M:%S"));
                let write = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await;
                if let Ok(mut file) = write {
                    use tokio::io::AsyncWriteExt;
                    let _ = file.write_all(stamped.as_bytes()).await;
                }
            }
            // Stream ended: allow the watchdog to re-attach.
            attached
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&name);
        });
    }

    async fn set_status(&self, name: &str, status: AppStatus) {
        self.store
            .update(Module::Apps, |tree| {
                if let Some(app) = tree.apps.by_name_mut(name) {
                    app.status = status;
                }
            })
            .await;
    }

    fn emit_status(&self, name: &str, status: &str, message: Option<&str>) {
        let _ = self.events.app_status.send(AppStatusEvent {
            app: name.to_string(),
            status: status.to_string(),
            message: message.map(String::from),
        });
    }
}

/// Runner image and command for a script app, by extension.
fn script_runner(file: &str) -> Option<(&'static str, Vec<String>)> {
    let basename = std::path::Path::new(file).file_name()?.to_str()?.to_string();
    let in_container = format!("/app/{basename}");
    let (image, argv0) = match std::path::Path::new(file).extension()?.to_str()? {
        "js" => ("node:20-alpine", "node"),
        "py" => ("python:3.12-alpine", "python"),
        "php" => ("php:8.3-cli", "php"),
        "sh" => ("alpine:3.20", "sh"),
        "rb" => ("ruby:3.3-alpine", "ruby"),
        _ => return None,
    };
    Some((image, vec![argv0.to_string(), in_container]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use od_common::OdacPaths;
    use od_container::MockRuntime;
    use std::path::Path;

    struct FakeGit;

    #[async_trait]
    impl RepoFetcher for FakeGit {
        async fn clone_repo(
            &self,
            _url: &str,
            _target: &CheckoutRef,
            dest: &Path,
            _token: Option<&str>,
        ) -> Result<()> {
            tokio::fs::create_dir_all(dest.join(".git")).await?;
            tokio::fs::write(dest.join("Dockerfile"), "FROM scratch").await?;
            Ok(())
        }

        async fn fetch(&self, dest: &Path, _target: &CheckoutRef, _token: Option<&str>) -> Result<()> {
            tokio::fs::write(dest.join("fetched"), "1").await?;
            Ok(())
        }

        fn is_repo(&self, dest: &Path) -> bool {
            dest.join(".git").is_dir()
        }

        async fn head_sha(&self, _dest: &Path) -> Result<String> {
            Ok("a".repeat(40))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<ConfigStore>,
        runtime: Arc<MockRuntime>,
        supervisor: Arc<AppSupervisor>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        let runtime = Arc::new(MockRuntime::new());
        let supervisor = AppSupervisor::new(
            store.clone(),
            runtime.clone() as Arc<dyn ContainerRuntime>,
            Arc::new(FakeGit),
            Arc::new(EventBus::new()),
        );
        Harness { _dir: dir, store, runtime, supervisor }
    }

    fn git_request(name: &str) -> CreateGitRequest {
        CreateGitRequest {
            name: name.to_string(),
            url: "https://github.com/acme/site.git".to_string(),
            branch: "main".to_string(),
            commit_sha: None,
            token: None,
            port: Some(3000),
            env: EnvSpec::default(),
            api: None,
        }
    }

    #[tokio::test]
    async fn create_git_reaches_running() {
        let h = harness();
        let record = h.supervisor.create_git(git_request("web"), None).await.unwrap();
        assert_eq!(record.status, AppStatus::Running);
        assert_eq!(record.ports, vec![PortMapping { host: None, container: 3000 }]);
        assert!(record.image.as_deref().unwrap().starts_with("odac-app-web:"));
        assert_eq!(record.commit_sha.as_deref(), Some("a".repeat(40)).as_deref());
        assert!(h.runtime.container("odac-web").unwrap().running);
        assert!(record.container_ip.is_some());
    }

    #[tokio::test]
    async fn create_git_rejects_duplicate_name() {
        let h = harness();
        h.supervisor.create_git(git_request("web"), None).await.unwrap();
        let err = h.supervisor.create_git(git_request("web"), None).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn concurrent_create_one_wins() {
        let h = harness();
        let a = h.supervisor.clone();
        let b = h.supervisor.clone();
        let (ra, rb) = tokio::join!(
            a.create_git(git_request("web"), None),
            b.create_git(git_request("web"), None),
        );
        let results = [ra, rb];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let failure = results.iter().find(|r| r.is_err()).unwrap();
        let message = failure.as_ref().unwrap_err().to_string();
        assert!(
            message.contains("already being created") || message.contains("already exists"),
            "unexpected: {message}"
        );
        // Exactly one app record exists.
        assert_eq!(h.store.read().await.apps.apps.len(), 1);
    }

    #[tokio::test]
    async fn failed_build_marks_errored_and_keeps_no_container() {
        let h = harness();
        h.runtime.set_fail_build(true);
        h.runtime
            .set_build_output(vec!["ERROR: syntax".to_string()]);
        let err = h.supervisor.create_git(git_request("bad"), None).await.unwrap_err();
        assert!(matches!(err, AppError::Deploy { phase: "build", .. }));
        assert!(h.runtime.container("odac-bad").is_none());
        // No record was registered before the build.
        assert!(h.store.read().await.apps.by_name("bad").is_none());
    }

    #[tokio::test]
    async fn restart_is_idempotent() {
        let h = harness();
        h.supervisor.create_git(git_request("web"), None).await.unwrap();
        h.supervisor.restart("web").await.unwrap();
        h.supervisor.restart("web").await.unwrap();
        let tree = h.store.read().await;
        assert_eq!(tree.apps.by_name("web").unwrap().status, AppStatus::Running);
        assert!(h.runtime.container("odac-web").unwrap().running);
    }

    #[tokio::test]
    async fn stop_sets_stopped_and_watchdog_leaves_it() {
        let h = harness();
        h.supervisor.create_git(git_request("web"), None).await.unwrap();
        h.supervisor.stop("web").await.unwrap();
        assert_eq!(
            h.store.read().await.apps.by_name("web").unwrap().status,
            AppStatus::Stopped
        );
        h.supervisor.check().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!h.runtime.container("odac-web").unwrap().running);
    }

    #[tokio::test]
    async fn watchdog_restarts_dead_running_app() {
        let h = harness();
        h.supervisor.create_git(git_request("web"), None).await.unwrap();
        h.runtime.kill("odac-web");
        h.supervisor.check().await;
        // The restart runs in a spawned task.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if h.runtime.container("odac-web").is_some_and(|c| c.running) {
                break;
            }
        }
        assert!(h.runtime.container("odac-web").unwrap().running);
    }

    #[tokio::test]
    async fn redeploy_replaces_image_and_keeps_serving_until_stop() {
        let h = harness();
        let before = h.supervisor.create_git(git_request("svc"), None).await.unwrap();
        let old_tag = before.image.clone().unwrap();

        h.supervisor
            .redeploy("svc", Some("abcdef0".to_string()), None)
            .await
            .unwrap();

        let tree = h.store.read().await;
        let app = tree.apps.by_name("svc").unwrap();
        assert_eq!(app.status, AppStatus::Running);
        let new_tag = app.image.clone().unwrap();
        assert_ne!(new_tag, old_tag);
        assert!(h.runtime.container("odac-svc").unwrap().running);
        assert_eq!(h.runtime.container("odac-svc").unwrap().spec.image, new_tag);
    }

    #[tokio::test]
    async fn redeploy_failure_keeps_old_image_reference_errored() {
        let h = harness();
        let before = h.supervisor.create_git(git_request("svc"), None).await.unwrap();
        let old_container_image = h.runtime.container("odac-svc").unwrap().spec.image;
        assert_eq!(Some(old_container_image.clone()), before.image);

        h.runtime.set_fail_build(true);
        let err = h.supervisor.redeploy("svc", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Deploy { phase: "build", .. }));

        let tree = h.store.read().await;
        let app = tree.apps.by_name("svc").unwrap();
        assert_eq!(app.status, AppStatus::Errored);
        // Old container untouched by the failed build.
        assert!(h.runtime.container("odac-svc").unwrap().running);
        assert_eq!(h.runtime.container("odac-svc").unwrap().spec.image, old_container_image);
    }

    #[tokio::test]
    async fn delete_removes_record_container_and_dir() {
        let h = harness();
        h.supervisor.create_git(git_request("web"), None).await.unwrap();
        let app_dir = h.store.paths().app_dir("web");
        assert!(app_dir.exists());

        h.supervisor.delete("web").await.unwrap();
        assert!(h.store.read().await.apps.by_name("web").is_none());
        assert!(h.runtime.container("odac-web").is_none());
        assert!(!app_dir.exists());
    }

    #[tokio::test]
    async fn second_redeploy_during_first_is_rejected() {
        let h = harness();
        h.supervisor.create_git(git_request("svc"), None).await.unwrap();
        let _guard = h.supervisor.guards().try_processing("svc").unwrap();
        let err = h.supervisor.redeploy("svc", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyProcessing(_)));
    }

    #[tokio::test]
    async fn script_runner_mapping() {
        assert!(script_runner("run.js").is_some());
        assert!(script_runner("a/b/run.py").is_some());
        assert!(script_runner("run.exe").is_none());
        let (image, cmd) = script_runner("srv/main.rb").unwrap();
        assert_eq!(image, "ruby:3.3-alpine");
        assert_eq!(cmd, vec!["ruby", "/app/main.rb"]);
    }
}
