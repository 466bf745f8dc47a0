//! Narrow capability interface over the container runtime.
//!
//! The OCI runtime itself is an external collaborator; the control plane
//! only needs the handful of operations below. `DockerCli` drives the
//! `docker` binary, `MockRuntime` backs the supervisor tests.

mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use od_config::{PortMapping, VolumeMapping};

pub use docker::DockerCli;
pub use mock::MockRuntime;

/// Everything needed to launch a container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMapping>,
    pub env: BTreeMap<String, String>,
    /// Command override (script runners); empty for the image default.
    pub cmd: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container; returns the runtime's container id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Force-remove a container. Removing an absent container is not an
    /// error.
    async fn remove(&self, name: &str) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    async fn container_ip(&self, name: &str) -> Result<Option<String>>;

    /// Ports with a listening socket inside the container.
    async fn listening_ports(&self, name: &str) -> Result<Vec<u16>>;

    /// Build an image from a directory, streaming build output lines into
    /// `sink`. Returns whether the build succeeded.
    async fn build_image(
        &self,
        tag: &str,
        context_dir: &Path,
        sink: mpsc::Sender<String>,
    ) -> Result<bool>;

    /// First port the image declares via EXPOSE, if any.
    async fn image_exposed_port(&self, image: &str) -> Result<Option<u16>>;

    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Follow the container's log stream into `sink` from a background
    /// task. Returns once the stream is attached.
    async fn attach_logs(&self, name: &str, sink: mpsc::Sender<String>) -> Result<()>;
}
