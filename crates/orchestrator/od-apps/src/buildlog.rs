//! Build-output analysis and retention.
//!
//! Subprocess output passes through line by line: lines matching `error`
//! (outside node_modules paths) and `warning` (except `npm warn`) are
//! counted against the currently open phase. Each build leaves a raw
//! `<id>.log` and a `<id>.json` summary; the last ten pairs per app are
//! kept, runtime logs expire after seven days.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use od_common::OdacPaths;

const KEEP_BUILDS: usize = 10;
const RUNTIME_LOG_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub name: String,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub status: BuildStatus,
    pub errors: u32,
    pub warnings: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds.
    pub duration: i64,
    pub status: BuildStatus,
    pub errors: u32,
    pub warnings: u32,
    pub phases: Vec<PhaseSummary>,
    pub metadata: serde_json::Value,
}

pub struct BuildLog {
    id: String,
    app: String,
    paths: OdacPaths,
    file: std::fs::File,
    started: DateTime<Utc>,
    phases: Vec<PhaseSummary>,
    errors: u32,
    warnings: u32,
    metadata: serde_json::Value,
}

impl BuildLog {
    pub fn create(paths: &OdacPaths, app: &str) -> Result<Self> {
        let id = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let dir = paths.app_builds_dir(app);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file = std::fs::File::create(dir.join(format!("{id}.log")))
            .context("failed to create build log")?;
        Ok(Self {
            id,
            app: app.to_string(),
            paths: paths.clone(),
            file,
            started: Utc::now(),
            phases: Vec::new(),
            errors: 0,
            warnings: 0,
            metadata: serde_json::json!({}),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_metadata(&mut self, metadata: serde_json::Value) {
        self.metadata = metadata;
    }

    pub fn phase_start(&mut self, name: &str) {
        debug!(app = self.app, phase = name, "Build phase start");
        let _ = writeln!(self.file, "--- phase: {name} ---");
        self.phases.push(PhaseSummary {
            name: name.to_string(),
            start: Utc::now(),
            end: None,
            duration: None,
            status: BuildStatus::Running,
            errors: 0,
            warnings: 0,
        });
    }

    /// Close the open phase; a no-op when every phase already ended.
    pub fn phase_end(&mut self, success: bool) {
        if let Some(phase) = self
            .phases
            .last_mut()
            .filter(|p| p.status == BuildStatus::Running)
        {
            let end = Utc::now();
            phase.end = Some(end);
            phase.duration = Some((end - phase.start).num_milliseconds());
            phase.status = if success { BuildStatus::Success } else { BuildStatus::Failed };
            debug!(
                app = self.app,
                phase = phase.name,
                success,
                errors = phase.errors,
                "Build phase end"
            );
        }
    }

    /// Record one output line, attributing error/warning hits to the open
    /// phase.
    pub fn analyze_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
        let lower = line.to_lowercase();
        if lower.contains("error") && !lower.contains("node_modules") {
            self.errors += 1;
            if let Some(phase) = self.phases.last_mut() {
                if phase.status == BuildStatus::Running {
                    phase.errors += 1;
                }
            }
        } else if lower.contains("warning") && !lower.contains("npm warn") {
            self.warnings += 1;
            if let Some(phase) = self.phases.last_mut() {
                if phase.status == BuildStatus::Running {
                    phase.warnings += 1;
                }
            }
        }
    }

    /// Write the `<id>.json` summary and rotate old builds.
    pub fn finalize(mut self, success: bool) -> Result<BuildSummary> {
        // Close any phase the failure path left open.
        if self
            .phases
            .last()
            .is_some_and(|p| p.status == BuildStatus::Running)
        {
            self.phase_end(success);
        }
        let _ = self.file.flush();

        let summary = BuildSummary {
            id: self.id.clone(),
            timestamp: self.started,
            duration: (Utc::now() - self.started).num_milliseconds(),
            status: if success { BuildStatus::Success } else { BuildStatus::Failed },
            errors: self.errors,
            warnings: self.warnings,
            phases: self.phases.clone(),
            metadata: self.metadata.clone(),
        };

        let json_path = self
            .paths
            .app_builds_dir(&self.app)
            .join(format!("{}.json", self.id));
        std::fs::write(&json_path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("failed to write {}", json_path.display()))?;

        rotate_builds(&self.paths, &self.app);
        Ok(summary)
    }
}

/// Keep the newest `KEEP_BUILDS` summaries; delete older `.log`/`.json`
/// pairs by mtime.
pub fn rotate_builds(paths: &OdacPaths, app: &str) {
    let dir = paths.app_builds_dir(app);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };

    let mut summaries: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                Some((path, mtime))
            } else {
                None
            }
        })
        .collect();

    if summaries.len() <= KEEP_BUILDS {
        return;
    }
    summaries.sort_by_key(|(_, mtime)| *mtime);
    let excess = summaries.len() - KEEP_BUILDS;
    for (json_path, _) in summaries.into_iter().take(excess) {
        let log_path = json_path.with_extension("log");
        if let Err(e) = std::fs::remove_file(&json_path) {
            warn!(app, "Failed to rotate build summary: {e}");
        }
        let _ = std::fs::remove_file(log_path);
    }
}

/// Delete per-app runtime logs older than seven days.
pub fn purge_runtime_logs(paths: &OdacPaths, app: &str) {
    let dir = paths.app_runtime_log_dir(app);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        if now.duration_since(mtime).is_ok_and(|age| age > RUNTIME_LOG_MAX_AGE) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!(app, "Failed to purge runtime log: {e}");
            }
        }
    }
}
