use super::{split_reference, ContainerDetails, ContainerRuntime, ContainerSpec, ExecOutput, Mount, PortMapping};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, HostConfig, MountPointTypeEnum, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::debug;
use std::collections::HashMap;
use std::time::Duration;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut names = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let id = c.id.as_ref().map(|s| s.to_string());
            match (name, id) {
                (Some(n), _) => names.push(n),
                (_, Some(id)) => names.push(id),
                _ => continue,
            }
        }
        Ok(names)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerDetails> {
        let detail = self.docker.inspect_container(name, None).await?;
        Ok(details_from(name, detail))
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_reference(image);
        let opts = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(opts), None, None);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<String> {
        self.docker
            .inspect_image(image)
            .await?
            .id
            .ok_or_else(|| anyhow!("image {} has no id", image))
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let opts = StopContainerOptions {
            t: timeout.as_secs() as _,
        };
        self.docker.stop_container(name, Some(opts)).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: false,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(opts)).await?;
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            port_bindings
                .entry(port.container_port.clone())
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: port.host_ip.clone(),
                    host_port: Some(port.host_port.clone()),
                });
            exposed_ports.insert(port.container_port.clone(), HashMap::new());
        }

        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(Mount::as_bind).collect()),
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network_mode.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(&spec.restart_policy)),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        self.docker.create_container(Some(opts), config).await?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn restart(&self, name: &str, timeout: Duration) -> Result<()> {
        let opts = RestartContainerOptions {
            t: timeout.as_secs() as _,
        };
        self.docker.restart_container(name, Some(opts)).await?;
        Ok(())
    }

    async fn exec(&self, name: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let opts = CreateExecOptions::<String> {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(name, opts).await?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                if let LogOutput::StdOut { message } = chunk? {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await?
            .exit_code
            .unwrap_or(-1);
        Ok(ExecOutput { exit_code, stdout })
    }

    fn tail_logs(&self, name: &str) -> BoxStream<'static, Result<String>> {
        let opts = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "0".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(name, Some(opts))
            .map(|chunk| match chunk {
                Ok(output) => output
                    .to_string()
                    .lines()
                    .map(|line| Ok(line.to_string()))
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(e.into())],
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

fn details_from(name: &str, detail: ContainerInspectResponse) -> ContainerDetails {
    let config = detail.config.unwrap_or_default();
    let host = detail.host_config.unwrap_or_default();

    let mounts = detail
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| {
            let destination = m.destination.filter(|d| !d.is_empty())?;
            // Only volumes and host paths can be recreated as binds.
            let source = match m.typ {
                Some(MountPointTypeEnum::VOLUME) => m.name.or(m.source),
                Some(MountPointTypeEnum::BIND) | None => m.source,
                _ => None,
            }
            .filter(|s| !s.is_empty())?;
            Some(Mount {
                source,
                destination,
                read_only: !m.rw.unwrap_or(true),
            })
        })
        .collect();

    let mut ports: Vec<PortMapping> = host
        .port_bindings
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(container_port, bindings)| {
            bindings.unwrap_or_default().into_iter().filter_map(move |b| {
                let host_port = b.host_port.filter(|p| !p.is_empty())?;
                Some(PortMapping {
                    container_port: container_port.clone(),
                    host_ip: b.host_ip.filter(|ip| !ip.is_empty()),
                    host_port,
                })
            })
        })
        .collect();
    ports.sort_by(|a, b| {
        (&a.container_port, &a.host_port).cmp(&(&b.container_port, &b.host_port))
    });

    let restart_policy = host
        .restart_policy
        .and_then(|p| p.name)
        .map(|n| n.to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unless-stopped".to_string());

    ContainerDetails {
        name: name.trim_start_matches('/').to_string(),
        running: detail.state.and_then(|s| s.running).unwrap_or(false),
        image: config.image.unwrap_or_default(),
        image_id: detail.image.unwrap_or_default(),
        created: detail.created.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        mounts,
        ports,
        network_mode: host
            .network_mode
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "bridge".to_string()),
        restart_policy,
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::MountPoint;

    fn mount(
        typ: MountPointTypeEnum,
        name: Option<&str>,
        source: &str,
        destination: &str,
    ) -> MountPoint {
        MountPoint {
            typ: Some(typ),
            name: name.map(str::to_string),
            source: Some(source.to_string()),
            destination: Some(destination.to_string()),
            rw: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn tmpfs_mounts_are_not_turned_into_binds() {
        let detail = ContainerInspectResponse {
            mounts: Some(vec![
                mount(MountPointTypeEnum::TMPFS, None, "", "/cache"),
                mount(
                    MountPointTypeEnum::VOLUME,
                    Some("webdata"),
                    "/var/lib/docker/volumes/webdata/_data",
                    "/data",
                ),
                mount(MountPointTypeEnum::BIND, None, "/srv/conf", "/etc/app"),
            ]),
            ..Default::default()
        };

        let details = details_from("/web", detail);
        let binds: Vec<String> = details.mounts.iter().map(Mount::as_bind).collect();
        assert_eq!(binds, vec!["webdata:/data", "/srv/conf:/etc/app"]);
        assert_eq!(details.name, "web");
    }

    #[test]
    fn bind_without_source_is_dropped() {
        let detail = ContainerInspectResponse {
            mounts: Some(vec![mount(MountPointTypeEnum::BIND, None, "", "/x")]),
            ..Default::default()
        };
        assert!(details_from("web", detail).mounts.is_empty());
    }
}
