use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub mod docker;
pub use docker::DockerRuntime;

#[cfg(test)]
pub mod fake;

/// A bind or named-volume mount of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Volume name for named volumes, host path for binds.
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

impl Mount {
    /// `source:destination[:ro]`, the form the engine API accepts as a bind.
    pub fn as_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.destination)
        } else {
            format!("{}:{}", self.source, self.destination)
        }
    }
}

/// A published port.  `container_port` keeps its protocol suffix (`80/tcp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: String,
    pub host_ip: Option<String>,
    pub host_port: String,
}

/// What the update engine needs to know about one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub name: String,
    pub running: bool,
    /// Image reference the container was started from, e.g. `nginx:1.25`.
    pub image: String,
    /// Content digest of the image (`sha256:...`).
    pub image_id: String,
    pub created: String,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub network_mode: String,
    pub restart_policy: String,
}

/// Everything needed to recreate a container under the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub network_mode: String,
    pub restart_policy: String,
}

impl ContainerSpec {
    pub fn from_details(details: &ContainerDetails, image: &str) -> Self {
        Self {
            name: details.name.clone(),
            image: image.to_string(),
            env: details.env.clone(),
            mounts: details.mounts.clone(),
            ports: details.ports.clone(),
            network_mode: details.network_mode.clone(),
            restart_policy: details.restart_policy.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
}

/// Splits an image reference into repository and tag (or digest).
/// A reference without a tag means `latest`.
pub fn split_reference(image: &str) -> (String, String) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo.to_string(), digest.to_string());
    }
    match image.rsplit_once(':') {
        // A colon followed by a path belongs to a registry port.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of running containers.
    async fn list_running(&self) -> Result<Vec<String>>;

    async fn inspect(&self, name: &str) -> Result<ContainerDetails>;

    /// Pull `image` from its registry.
    async fn pull(&self, image: &str) -> Result<()>;

    /// Content digest of the locally stored `image`.
    async fn image_digest(&self, image: &str) -> Result<String>;

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    /// Create and start a container from an explicit spec.
    async fn run(&self, spec: &ContainerSpec) -> Result<()>;

    async fn restart(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Run a one-shot command inside `name` and capture its stdout.
    async fn exec(&self, name: &str, cmd: &[&str]) -> Result<ExecOutput>;

    /// Follow the log output of `name` from its current end, one item per
    /// line.  The stream ends when the runtime closes it.
    fn tail_logs(&self, name: &str) -> BoxStream<'static, Result<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_split_into_repo_and_tag() {
        assert_eq!(split_reference("nginx:1.25"), ("nginx".into(), "1.25".into()));
        assert_eq!(split_reference("nginx"), ("nginx".into(), "latest".into()));
        assert_eq!(
            split_reference("registry.local:5000/team/app"),
            ("registry.local:5000/team/app".into(), "latest".into())
        );
        assert_eq!(
            split_reference("app@sha256:abc"),
            ("app".into(), "sha256:abc".into())
        );
    }

    #[test]
    fn read_only_mounts_keep_their_flag() {
        let m = Mount {
            source: "data".into(),
            destination: "/data".into(),
            read_only: true,
        };
        assert_eq!(m.as_bind(), "data:/data:ro");
    }
}
