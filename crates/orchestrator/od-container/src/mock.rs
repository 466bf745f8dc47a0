//! In-memory runtime used by supervisor and proxy-sync tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{ContainerRuntime, RunSpec};

#[derive(Debug, Clone, Default)]
pub struct MockContainer {
    pub spec: RunSpec,
    pub running: bool,
    pub ip: Option<String>,
    pub listening: Vec<u16>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    images: BTreeMap<String, Option<u16>>,
    build_lines: Vec<String>,
    fail_build: bool,
    fail_run: bool,
}

/// Scriptable fake: tests pre-register images, flip failure knobs and
/// inspect what the supervisor did.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image(&self, image: &str, exposed_port: Option<u16>) {
        let mut st = self.state.lock().unwrap();
        st.images.insert(image.to_string(), exposed_port);
    }

    pub fn set_build_output(&self, lines: Vec<String>) {
        self.state.lock().unwrap().build_lines = lines;
    }

    pub fn set_fail_build(&self, fail: bool) {
        self.state.lock().unwrap().fail_build = fail;
    }

    pub fn set_fail_run(&self, fail: bool) {
        self.state.lock().unwrap().fail_run = fail;
    }

    pub fn set_listening(&self, name: &str, ports: Vec<u16>) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(name) {
            c.listening = ports;
        }
    }

    pub fn set_ip(&self, name: &str, ip: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(name) {
            c.ip = Some(ip.to_string());
        }
    }

    /// Simulate a crashed container without removing it.
    pub fn kill(&self, name: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(name) {
            c.running = false;
        }
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        if st.fail_run {
            bail!("mock: run failure injected");
        }
        if st.containers.get(&spec.name).is_some_and(|c| c.running) {
            bail!("mock: container {} already running", spec.name);
        }
        let listening: Vec<u16> = spec.ports.iter().map(|p| p.container).collect();
        st.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: true,
                ip: Some("172.17.0.2".to_string()),
                listening,
            },
        );
        Ok(format!("mock-{}", spec.name))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => bail!("mock: no such container {name}"),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().containers.remove(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .is_some_and(|c| c.running))
    }

    async fn container_ip(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .and_then(|c| c.ip.clone()))
    }

    async fn listening_ports(&self, name: &str) -> Result<Vec<u16>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.listening.clone())
            .unwrap_or_default())
    }

    async fn build_image(
        &self,
        tag: &str,
        _context_dir: &Path,
        sink: mpsc::Sender<String>,
    ) -> Result<bool> {
        let (lines, fail) = {
            let st = self.state.lock().unwrap();
            (st.build_lines.clone(), st.fail_build)
        };
        for line in lines {
            let _ = sink.send(line).await;
        }
        if fail {
            return Ok(false);
        }
        self.state.lock().unwrap().images.entry(tag.to_string()).or_insert(None);
        Ok(true)
    }

    async fn image_exposed_port(&self, image: &str) -> Result<Option<u16>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .images
            .get(image)
            .copied()
            .flatten())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.state.lock().unwrap().images.remove(tag);
        Ok(())
    }

    async fn attach_logs(&self, _name: &str, _sink: mpsc::Sender<String>) -> Result<()> {
        Ok(())
    }
}
