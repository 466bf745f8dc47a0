//! Docker CLI backend. Every invocation is an argv array; no input ever
//! passes through a shell except the fixed port-scan script below.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{ContainerRuntime, RunSpec};

/// Constant script: no interpolation, parsed on our side.
const PORT_SCAN_SCRIPT: &str = "cat /proc/net/tcp /proc/net/tcp6 2>/dev/null";

const PORT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DockerCli;

impl DockerCli {
    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run docker {}", args.first().unwrap_or(&"")))
    }

    async fn docker_ok(args: &[&str]) -> Result<String> {
        let output = Self::docker(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker {} failed: {stderr}", args.first().unwrap_or(&""));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        for port in &spec.ports {
            if let Some(host) = port.host {
                args.push("-p".into());
                args.push(format!("{host}:{}", port.container));
            }
        }
        for vol in &spec.volumes {
            args.push("-v".into());
            args.push(format!("{}:{}", vol.host, vol.container));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = Self::docker_ok(&argv).await?;
        let id = stdout.trim().to_string();
        info!(container = spec.name, id = %&id[..id.len().min(12)], "Container started");
        Ok(id)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        Self::docker_ok(&["stop", name]).await?;
        info!(container = name, "Container stopped");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let output = Self::docker(&["rm", "-f", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                bail!("docker rm {name} failed: {stderr}");
            }
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let output = Self::docker(&["inspect", "-f", "{{.State.Running}}", name]).await?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn container_ip(&self, name: &str) -> Result<Option<String>> {
        let output = Self::docker(&[
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            name,
        ])
        .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let ip = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if ip.is_empty() { None } else { Some(ip) })
    }

    async fn listening_ports(&self, name: &str) -> Result<Vec<u16>> {
        let scan = tokio::time::timeout(
            PORT_SCAN_TIMEOUT,
            Self::docker(&["exec", name, "sh", "-c", PORT_SCAN_SCRIPT]),
        )
        .await
        .context("port scan timed out")??;

        if !scan.status.success() {
            return Ok(Vec::new());
        }
        Ok(parse_proc_net_tcp(&String::from_utf8_lossy(&scan.stdout)))
    }

    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        sink: mpsc::Sender<String>,
    ) -> Result<bool> {
        let mut child = Command::new("docker")
            .arg("build")
            .arg("-t")
            .arg(tag)
            .arg(context_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker build")?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_sink = sink.clone();
        let out_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if out_sink.send(line).await.is_err() {
                        break;
                    }
                }
            }
        });
        let err_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }
            }
        });

        let status = child.wait().await.context("docker build wait failed")?;
        let _ = out_task.await;
        let _ = err_task.await;
        debug!(tag, success = status.success(), "Image build finished");
        Ok(status.success())
    }

    async fn image_exposed_port(&self, image: &str) -> Result<Option<u16>> {
        let output = Self::docker(&[
            "inspect",
            "-f",
            "{{json .Config.ExposedPorts}}",
            image,
        ])
        .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        let map: Option<BTreeMap<String, serde_json::Value>> =
            serde_json::from_str(raw.trim()).unwrap_or(None);
        let port = map.and_then(|m| {
            m.keys()
                .filter_map(|k| k.split('/').next()?.parse::<u16>().ok())
                .min()
        });
        Ok(port)
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let output = Self::docker(&["rmi", tag]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(tag, "Image removal failed: {stderr}");
        }
        Ok(())
    }

    async fn attach_logs(&self, name: &str, sink: mpsc::Sender<String>) -> Result<()> {
        let mut child = Command::new("docker")
            .args(["logs", "-f", "--tail", "0", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker logs")?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let err_sink = sink.clone();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if err_sink.send(line).await.is_err() {
                        break;
                    }
                }
            }
        });
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }
            }
            let _ = child.wait().await;
        });
        Ok(())
    }
}

/// Parse `/proc/net/tcp{,6}` output: hex local port, state 0A = LISTEN.
fn parse_proc_net_tcp(raw: &str) -> Vec<u16> {
    let mut ports: Vec<u16> = raw
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _sl = fields.next()?;
            let local = fields.next()?;
            let _remote = fields.next()?;
            let state = fields.next()?;
            if state != "0A" {
                return None;
            }
            let port_hex = local.rsplit(':').next()?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}
