//! Git operations for the deploy pipeline, driven through the `git` CLI
//! with argv arrays. Credentials travel through `GIT_CONFIG_*` environment
//! entries, never the command line.

use std::path::Path;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use od_common::validation::{
    ValidationError, validate_branch, validate_commit_sha, validate_git_url,
};

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("git {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },
}

/// A checkout target: branch tip, or a specific commit on that branch.
#[derive(Debug, Clone)]
pub struct CheckoutRef {
    pub branch: String,
    pub commit_sha: Option<String>,
}

impl CheckoutRef {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_branch(&self.branch)?;
        if let Some(sha) = &self.commit_sha {
            validate_commit_sha(sha)?;
        }
        Ok(())
    }
}

/// Seam between the deploy pipeline and the git CLI; lets supervisor
/// tests substitute an in-memory fake.
#[async_trait::async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn clone_repo(
        &self,
        url: &str,
        target: &CheckoutRef,
        dest: &Path,
        token: Option<&str>,
    ) -> Result<()>;

    async fn fetch(&self, dest: &Path, target: &CheckoutRef, token: Option<&str>) -> Result<()>;

    fn is_repo(&self, dest: &Path) -> bool;

    async fn head_sha(&self, dest: &Path) -> Result<String>;
}

pub struct GitClient;

#[async_trait::async_trait]
impl RepoFetcher for GitClient {
    async fn clone_repo(
        &self,
        url: &str,
        target: &CheckoutRef,
        dest: &Path,
        token: Option<&str>,
    ) -> Result<()> {
        GitClient::clone_repo(url, target, dest, token).await
    }

    async fn fetch(&self, dest: &Path, target: &CheckoutRef, token: Option<&str>) -> Result<()> {
        GitClient::fetch(dest, target, token).await
    }

    fn is_repo(&self, dest: &Path) -> bool {
        GitClient::is_repo(dest)
    }

    async fn head_sha(&self, dest: &Path) -> Result<String> {
        GitClient::head_sha(dest).await
    }
}

impl GitClient {
    /// Clone `url` into `dest`. `token`, when present, is injected as an
    /// `http.extraHeader` through the `GIT_CONFIG_*` environment so it
    /// never appears in argv or the process list.
    pub async fn clone_repo(
        url: &str,
        target: &CheckoutRef,
        dest: &Path,
        token: Option<&str>,
    ) -> Result<()> {
        validate_git_url(url).map_err(GitError::from)?;
        target.validate().map_err(GitError::from)?;

        let dest_str = path_str(dest)?;
        let args = vec![
            "clone",
            "--branch",
            target.branch.as_str(),
            "--single-branch",
            url,
            dest_str,
        ];
        run_git(None, &args, token, "clone").await?;

        if target.commit_sha.is_some() {
            Self::checkout(dest, target).await?;
        }
        info!(url, branch = target.branch, "Repository cloned");
        Ok(())
    }

    /// Incremental update: fetch and hard-reset onto the target. Callers
    /// fall back to a full reclone when `dest/.git` is missing.
    pub async fn fetch(dest: &Path, target: &CheckoutRef, token: Option<&str>) -> Result<()> {
        target.validate().map_err(GitError::from)?;
        run_git(
            Some(dest),
            &["fetch", "origin", target.branch.as_str()],
            token,
            "fetch",
        )
        .await?;
        Self::checkout(dest, target).await?;
        debug!(dest = %dest.display(), branch = target.branch, "Repository updated");
        Ok(())
    }

    pub fn is_repo(dest: &Path) -> bool {
        dest.join(".git").is_dir()
    }

    async fn checkout(dest: &Path, target: &CheckoutRef) -> Result<()> {
        let refname = match &target.commit_sha {
            Some(sha) => sha.clone(),
            None => format!("origin/{}", target.branch),
        };
        run_git(
            Some(dest),
            &["reset", "--hard", refname.as_str()],
            None,
            "checkout",
        )
        .await?;
        Ok(())
    }

    /// Resolved HEAD commit of a checkout.
    pub async fn head_sha(dest: &Path) -> Result<String> {
        let out = run_git(Some(dest), &["rev-parse", "HEAD"], None, "rev-parse").await?;
        let sha = out.trim().to_string();
        if sha.len() != 40 {
            bail!("unexpected rev-parse output: {sha}");
        }
        Ok(sha)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().context("non-utf8 path")
}

async fn run_git(
    cwd: Option<&Path>,
    args: &[&str],
    token: Option<&str>,
    op: &'static str,
) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    // Non-interactive always: a bad credential should fail, not hang.
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    if let Some(token) = token {
        cmd.env("GIT_CONFIG_COUNT", "1");
        cmd.env("GIT_CONFIG_KEY_0", "http.extraHeader");
        cmd.env("GIT_CONFIG_VALUE_0", format!("Authorization: Bearer {token}"));
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn git {op}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(GitError::Command { op, stderr }.into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_rejects_hostile_url_before_spawning() {
        let target = CheckoutRef { branch: "main".into(), commit_sha: None };
        let err = GitClient::clone_repo(
            "https://host/repo;rm -rf /",
            &target,
            Path::new("/tmp/nowhere"),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid git url"));
    }

    #[tokio::test]
    async fn clone_rejects_flag_branch() {
        let target = CheckoutRef { branch: "-upload-pack=/x".into(), commit_sha: None };
        let err = GitClient::clone_repo(
            "https://github.com/acme/site.git",
            &target,
            Path::new("/tmp/nowhere"),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid branch"));
    }

    #[tokio::test]
    async fn fetch_rejects_bad_sha() {
        let target = CheckoutRef {
            branch: "main".into(),
            commit_sha: Some("NOTHEX".into()),
        };
        let err = GitClient::fetch(Path::new("/tmp/nowhere"), &target, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid commit sha"));
    }
}
