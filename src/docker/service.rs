//! Docker engine adapter.
//!
//! Thin typed wrapper over bollard: container lifecycle, exec, image-id
//! comparison against the base image tag, and the init-status file reads the
//! ready-wait loop consumes. Engine errors are surfaced verbatim; a 404 maps
//! to the typed not-found variant.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    DeviceMapping, HealthStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::config::project::{parse_port_spec, ProjectConfigModel};
use crate::error::{DaemonError, Result};

use super::ready::InitProbe;
use super::{ContainerInfo, HealthState, InitPhase, InstallProgress, PROJECT_DIR_LABEL, PROJECT_LABEL};

/// Tag of the base image every project container is created from.
pub const BASE_IMAGE_TAG: &str = "boxctl-base:latest";

const INIT_PHASE_FILE: &str = "/tmp/boxctl-init-phase";
const INSTALL_PROGRESS_FILE: &str = "/tmp/install-progress.json";

/// Timeout for the short init-status probes during ready-wait.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct DockerService {
    client: Docker,
}

fn map_not_found(name: &str) -> impl FnOnce(bollard::errors::Error) -> DaemonError + '_ {
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DaemonError::ContainerNotFound(name.to_string()),
        _ => DaemonError::Engine(e),
    }
}

impl DockerService {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults().map_err(DaemonError::Engine)?;
        Ok(Self { client })
    }

    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(DaemonError::Engine)?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(DaemonError::Engine)?;
        Ok(())
    }

    /// Inspect a container; `Ok(None)` when it does not exist.
    pub async fn get_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let inspect = match self.client.inspect_container(name, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => return Err(DaemonError::Engine(e)),
        };

        let state = inspect.state.as_ref();
        Ok(Some(ContainerInfo {
            id: inspect.id.clone().unwrap_or_default(),
            name: inspect
                .name
                .clone()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: inspect.image.clone().unwrap_or_default(),
            running: state.and_then(|s| s.running).unwrap_or(false),
            status: state
                .and_then(|s| s.status)
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_default(),
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        }))
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_container(name).await?.is_some())
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .get_container(name)
            .await?
            .map(|c| c.running)
            .unwrap_or(false))
    }

    /// Engine-reported health status of a container.
    pub async fn health(&self, name: &str) -> Result<HealthState> {
        let inspect = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(map_not_found(name))?;

        let status = inspect
            .state
            .and_then(|s| s.health)
            .and_then(|h| h.status);

        Ok(match status {
            Some(HealthStatusEnum::STARTING) => HealthState::Starting,
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            _ => HealthState::None,
        })
    }

    /// Create (but do not start) a project container from the base image.
    ///
    /// The project directory is mounted at `/workspace`; extra workspaces go
    /// under `/context/<mount>`. The SSH tunnel socket is mounted so the
    /// container client can dial the host daemon.
    pub async fn create(
        &self,
        project_name: &str,
        project_dir: &Path,
        config: &ProjectConfigModel,
        ssh_socket: Option<&Path>,
    ) -> Result<String> {
        let container_name =
            crate::naming::resolve_container_name(project_dir, self.origin_of(project_dir).await?.as_deref());

        let mut labels = HashMap::new();
        labels.insert(PROJECT_DIR_LABEL.to_string(), project_dir.display().to_string());
        labels.insert(PROJECT_LABEL.to_string(), project_name.to_string());

        let mut env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("BOXCTL_PROJECT={project_name}"));

        let mut mounts = vec![Mount {
            source: Some(project_dir.display().to_string()),
            target: Some("/workspace".to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];

        for workspace in &config.workspaces {
            let mount_name = workspace.mount.clone().unwrap_or_else(|| {
                workspace
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".to_string())
            });
            mounts.push(Mount {
                source: Some(workspace.path.display().to_string()),
                target: Some(format!("/context/{mount_name}")),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(workspace.mode != "rw"),
                ..Default::default()
            });
        }

        if let Some(socket) = ssh_socket {
            mounts.push(Mount {
                source: Some(socket.display().to_string()),
                target: Some("/run/boxctl/ssh.sock".to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            });
            env.push("BOXCTL_SSH_SOCKET=/run/boxctl/ssh.sock".to_string());
        }

        if config.ssh.forward_agent {
            if let Ok(auth_sock) = std::env::var("SSH_AUTH_SOCK") {
                mounts.push(Mount {
                    source: Some(auth_sock.clone()),
                    target: Some("/run/boxctl/ssh-agent.sock".to_string()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                });
                env.push("SSH_AUTH_SOCK=/run/boxctl/ssh-agent.sock".to_string());
            }
        }

        if config.docker.as_ref().map(|d| d.enabled).unwrap_or(false) {
            mounts.push(Mount {
                source: Some("/var/run/docker.sock".to_string()),
                target: Some("/var/run/docker.sock".to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            });
        }

        if let Some(home) = dirs::home_dir() {
            if config.credentials.gh {
                mounts.push(credential_mount(&home, ".config/gh", "/home/abox/.config/gh"));
            }
            if config.credentials.glab {
                mounts.push(credential_mount(
                    &home,
                    ".config/glab-cli",
                    "/home/abox/.config/glab-cli",
                ));
            }
        }

        let devices: Vec<DeviceMapping> = config
            .devices
            .iter()
            .filter_map(|spec| parse_device_spec(spec))
            .collect();

        let mut security_opt = Vec::new();
        if let Some(seccomp) = &config.security.seccomp {
            security_opt.push(format!("seccomp={seccomp}"));
        }

        // Engine-managed port bindings only apply in docker port mode; the
        // tunnel mode wires ports over SSH after the container connects.
        let ports = config.ports_config();
        let port_bindings = if ports.mode == "docker" {
            let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            for spec in &ports.host {
                if let Some((host_port, container_port)) = parse_port_spec(spec) {
                    bindings.insert(
                        format!("{container_port}/tcp"),
                        Some(vec![PortBinding {
                            host_ip: None,
                            host_port: Some(host_port.to_string()),
                        }]),
                    );
                }
            }
            (!bindings.is_empty()).then_some(bindings)
        } else {
            None
        };
        let exposed_ports = port_bindings.as_ref().map(|bindings| {
            bindings
                .keys()
                .map(|key| (key.clone(), HashMap::new()))
                .collect::<HashMap<String, HashMap<(), ()>>>()
        });

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings,
            memory: config.resources.memory.as_deref().and_then(parse_memory),
            nano_cpus: config
                .resources
                .cpus
                .map(|c| (c * 1_000_000_000.0) as i64),
            devices: (!devices.is_empty()).then_some(devices),
            security_opt: (!security_opt.is_empty()).then_some(security_opt),
            cap_add: (!config.security.capabilities.is_empty())
                .then(|| config.security.capabilities.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(BASE_IMAGE_TAG.to_string()),
            hostname: config.hostname.clone(),
            env: Some(env),
            labels: Some(labels),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        });

        self.client
            .create_container(options, container_config)
            .await
            .map_err(DaemonError::Engine)?;

        debug!("Created container {container_name} for {}", project_dir.display());
        Ok(container_name)
    }

    /// Origin label of the container that currently owns the plain name for
    /// this project directory, if any.
    async fn origin_of(&self, project_dir: &Path) -> Result<Option<String>> {
        let plain = crate::naming::container_name(project_dir);
        Ok(self
            .get_container(&plain)
            .await?
            .and_then(|c| c.labels.get(PROJECT_DIR_LABEL).cloned()))
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.client
            .start_container::<String>(name, None)
            .await
            .map_err(map_not_found(name))?;
        Ok(())
    }

    pub async fn stop(&self, name: &str, timeout: Option<i64>) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: timeout.unwrap_or(10),
        });
        self.client
            .stop_container(name, options)
            .await
            .map_err(map_not_found(name))?;
        Ok(())
    }

    pub async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        });
        self.client
            .remove_container(name, options)
            .await
            .map_err(map_not_found(name))?;
        Ok(())
    }

    /// Run a command in the container, returning the exit code and combined
    /// stdout/stderr.
    pub async fn exec(
        &self,
        name: &str,
        argv: Vec<&str>,
        user: Option<&str>,
        env: Option<Vec<&str>>,
    ) -> Result<(i64, String)> {
        let exec = self
            .client
            .create_exec(
                name,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv),
                    user,
                    env,
                    ..Default::default()
                },
            )
            .await
            .map_err(map_not_found(name))?;

        let mut combined = String::new();
        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(DaemonError::Engine)?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(log) => combined.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                        Err(e) => return Err(DaemonError::Engine(e)),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(DaemonError::Engine)?;

        Ok((inspect.exit_code.unwrap_or(-1), combined))
    }

    /// Wait until `id -u <user>` succeeds inside the container, i.e. the
    /// init script has created the user account.
    pub async fn wait_for_user(&self, name: &str, user: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while tokio::time::Instant::now() < deadline {
            if let Ok((0, _)) = self.exec(name, vec!["id", "-u", user], None, None).await {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(false)
    }

    /// Image ID the container was created from.
    pub async fn image_id_of_container(&self, name: &str) -> Result<String> {
        let inspect = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(map_not_found(name))?;
        Ok(inspect.image.unwrap_or_default())
    }

    /// Image ID of a tag as the engine currently knows it.
    pub async fn image_id_of(&self, tag: &str) -> Result<String> {
        let inspect = self
            .client
            .inspect_image(tag)
            .await
            .map_err(DaemonError::Engine)?;
        Ok(inspect.id.unwrap_or_default())
    }

    /// Whether the container predates the current base image.
    pub async fn is_base_image_outdated(&self, name: &str) -> Result<bool> {
        let container_image = self.image_id_of_container(name).await?;
        let base_image = self.image_id_of(BASE_IMAGE_TAG).await?;
        Ok(container_image != base_image)
    }

    /// Read the init phase file from inside the container. The first line is
    /// the phase symbol; anything after it is carried as details.
    pub async fn get_container_init_status(&self, name: &str) -> Result<(InitPhase, String)> {
        let (exit, output) = self
            .exec(name, vec!["cat", INIT_PHASE_FILE], Some("root"), None)
            .await?;
        if exit != 0 {
            return Ok((InitPhase::Unknown, String::new()));
        }

        let mut lines = output.lines();
        let phase = InitPhase::parse(lines.next().unwrap_or(""));
        let details = lines.collect::<Vec<_>>().join("\n");
        Ok((phase, details))
    }

    /// Read the install-progress checklist from inside the container.
    pub async fn get_install_progress(&self, name: &str) -> Result<InstallProgress> {
        let (exit, output) = self
            .exec(name, vec!["cat", INSTALL_PROGRESS_FILE], Some("root"), None)
            .await?;
        if exit != 0 {
            return Ok(InstallProgress::default());
        }
        Ok(serde_json::from_str(&output).unwrap_or_default())
    }

    /// List containers; optionally only running ones.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = Some(ListContainersOptions::<String> {
            all,
            ..Default::default()
        });

        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(DaemonError::Engine)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: c.image.unwrap_or_default(),
                running: c.state.as_deref() == Some("running"),
                status: c.status.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    /// Name of the running container publishing `port`, if any. Used as the
    /// pre-check before adding a host port listener.
    pub async fn port_bound_by(&self, port: u16) -> Result<Option<String>> {
        let options = Some(ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        });

        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(DaemonError::Engine)?;

        for container in containers {
            let published = container
                .ports
                .iter()
                .flatten()
                .any(|p| p.public_port == Some(port));
            if published {
                let name = container
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string();
                return Ok(Some(name));
            }
        }
        Ok(None)
    }
}

fn credential_mount(home: &Path, source_rel: &str, target: &str) -> Mount {
    Mount {
        source: Some(home.join(source_rel).display().to_string()),
        target: Some(target.to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Parse a device spec `"/dev/x[:/dev/y[:perm]]"`.
fn parse_device_spec(spec: &str) -> Option<DeviceMapping> {
    let mut parts = spec.splitn(3, ':');
    let host = parts.next()?.to_string();
    if host.is_empty() {
        return None;
    }
    let container = parts.next().unwrap_or(&host).to_string();
    let permissions = parts.next().unwrap_or("rwm").to_string();
    Some(DeviceMapping {
        path_on_host: Some(host),
        path_in_container: Some(container),
        cgroup_permissions: Some(permissions),
    })
}

/// Parse a memory limit like `"4g"`, `"512m"`, or a raw byte count.
fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024i64),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}

#[async_trait]
impl InitProbe for DockerService {
    async fn is_running(&self, name: &str) -> Result<bool> {
        DockerService::is_running(self, name).await
    }

    async fn health(&self, name: &str) -> Result<HealthState> {
        DockerService::health(self, name).await
    }

    async fn init_status(&self, name: &str) -> Result<(InitPhase, String)> {
        tokio::time::timeout(PROBE_TIMEOUT, self.get_container_init_status(name))
            .await
            .unwrap_or(Err(DaemonError::Timeout))
    }

    async fn install_progress(&self, name: &str) -> Result<InstallProgress> {
        tokio::time::timeout(PROBE_TIMEOUT, self.get_install_progress(name))
            .await
            .unwrap_or(Err(DaemonError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("4g"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("banana"), None);
    }

    #[test]
    fn test_parse_device_spec() {
        let device = parse_device_spec("/dev/ttyUSB0").unwrap();
        assert_eq!(device.path_on_host.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(device.path_in_container.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(device.cgroup_permissions.as_deref(), Some("rwm"));

        let device = parse_device_spec("/dev/snd:/dev/snd:ro").unwrap();
        assert_eq!(device.cgroup_permissions.as_deref(), Some("ro"));

        assert!(parse_device_spec("").is_none());
    }
}
