//! In-memory runtime used by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use super::{ContainerDetails, ContainerRuntime, ContainerSpec, ExecOutput};

#[derive(Default)]
pub struct FakeState {
    pub containers: BTreeMap<String, ContainerDetails>,
    /// Digest an image resolves to once pulled.
    pub remote_digests: HashMap<String, String>,
    pub local_digests: HashMap<String, String>,
    /// `(container, path)` → file content, served to `cat` and `test -f`.
    pub files: HashMap<(String, String), String>,
    pub log_lines: Vec<String>,
    pub calls: Vec<String>,
    pub fail_pull: bool,
    pub fail_run: bool,
    pub start_stopped: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_container(self, name: &str, image: &str, digest: &str) -> Self {
        {
            let mut s = self.state();
            s.containers.insert(
                name.to_string(),
                ContainerDetails {
                    name: name.to_string(),
                    running: true,
                    image: image.to_string(),
                    image_id: digest.to_string(),
                    network_mode: "bridge".to_string(),
                    restart_policy: "unless-stopped".to_string(),
                    ..Default::default()
                },
            );
            s.local_digests.insert(image.to_string(), digest.to_string());
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        self.state()
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no such container: {}", name))
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record(format!("pull {}", image));
        let mut s = self.state();
        if s.fail_pull {
            bail!("manifest unknown");
        }
        if let Some(digest) = s.remote_digests.get(image).cloned() {
            s.local_digests.insert(image.to_string(), digest);
        }
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<String> {
        self.state()
            .local_digests
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow!("no such image: {}", image))
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop {}", name));
        match self.state().containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => bail!("no such container: {}", name),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(format!("remove {}", name));
        self.state()
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no such container: {}", name))
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("run {} {}", spec.name, spec.image));
        let mut s = self.state();
        if s.fail_run {
            bail!("port is already allocated");
        }
        let image_id = s.local_digests.get(&spec.image).cloned().unwrap_or_default();
        let running = !s.start_stopped;
        s.containers.insert(
            spec.name.clone(),
            ContainerDetails {
                name: spec.name.clone(),
                running,
                image: spec.image.clone(),
                image_id,
                created: String::new(),
                env: spec.env.clone(),
                mounts: spec.mounts.clone(),
                ports: spec.ports.clone(),
                network_mode: spec.network_mode.clone(),
                restart_policy: spec.restart_policy.clone(),
            },
        );
        Ok(())
    }

    async fn restart(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("restart {}", name));
        match self.state().containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => bail!("no such container: {}", name),
        }
    }

    async fn exec(&self, name: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let s = self.state();
        let file = match cmd {
            ["cat", path] | ["test", "-f", path] => {
                s.files.get(&(name.to_string(), path.to_string())).cloned()
            }
            _ => None,
        };
        Ok(match file {
            Some(content) if cmd[0] == "cat" => ExecOutput {
                exit_code: 0,
                stdout: content,
            },
            Some(_) => ExecOutput::default(),
            None => ExecOutput {
                exit_code: 1,
                stdout: String::new(),
            },
        })
    }

    fn tail_logs(&self, _name: &str) -> BoxStream<'static, Result<String>> {
        let lines: Vec<Result<String>> = self.state().log_lines.drain(..).map(Ok).collect();
        stream::iter(lines).boxed()
    }
}
