//! Docker-backed container runtime
//!
//! The switchboard core only ever talks to [`ContainerRuntime`]; the bollard
//! client lives behind it so tests can substitute an in-process fake.

use crate::config::{ImageConfig, PullPolicy};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle operations the core needs from a container runtime.
///
/// `terminate` and `remove` treat "already gone" as success: they run during
/// teardown, where the only useful outcome is that the backend no longer
/// exists.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a detached backend container; returns the runtime-assigned id.
    async fn launch(&self, config: &ImageConfig) -> anyhow::Result<String>;

    /// Discover the host port the container's internal port is published on.
    async fn host_port(&self, container_id: &str, internal_port: u16) -> anyhow::Result<u16>;

    /// Forcibly stop the container.
    async fn terminate(&self, container_id: &str) -> anyhow::Result<()>;

    /// Remove the stopped container and its resources.
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}

/// Container runtime backed by the local Docker daemon
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority: explicit `docker_host` config, then the
    /// DOCKER_HOST environment variable, then the platform socket default.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Pull the image if the configured pull policy asks for it
    async fn pull_image_if_needed(&self, image: &str, policy: &PullPolicy) -> anyhow::Result<()> {
        let should_pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    anyhow::bail!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        image
                    );
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if should_pull {
            info!(image, "Pulling Docker image");
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };

            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                let progress =
                    result.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
                if let Some(error) = progress.error {
                    anyhow::bail!("Failed to pull image '{}': {}", image, error);
                }
            }
            info!(image, "Image pulled");
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, config: &ImageConfig) -> anyhow::Result<String> {
        self.pull_image_if_needed(&config.image, &config.pull_policy)
            .await?;

        let container_name = format!(
            "switchboard-{}-{}",
            config.name.replace('.', "-"),
            Uuid::new_v4().simple()
        );

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        // Publish the internal port without naming a host port; the daemon
        // assigns an ephemeral one, discovered afterwards via host_port().
        let port_key = format!("{}/tcp", config.internal_port);
        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: config.network.clone(),
            ..Default::default()
        };

        if let Some(ref memory) = config.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = config.cpus {
            let cpu_count: f64 = cpus
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;
            // NanoCPUs is CPUs * 1e9
            host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
        }

        let args = config.command_args()?;
        let cmd = if args.is_empty() { None } else { Some(args) };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd,
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    container_name,
                    config.image,
                    e
                )
            })?;

        let container_id = response.id;

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // Don't leak the created-but-never-started container
            let _ = self.remove(&container_id).await;
            anyhow::bail!(
                "Failed to start container '{}' (id: {}): {}",
                container_name,
                container_id,
                e
            );
        }

        debug!(
            image = %config.image,
            container_id,
            container_name,
            "Started container"
        );

        Ok(container_id)
    }

    async fn host_port(&self, container_id: &str, internal_port: u16) -> anyhow::Result<u16> {
        let inspect = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", container_id, e))?;

        let ports = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .ok_or_else(|| {
                anyhow::anyhow!("Container {} reports no port mappings", container_id)
            })?;

        mapped_host_port(&ports, internal_port).ok_or_else(|| {
            anyhow::anyhow!(
                "Container {} has no host mapping for port {}/tcp",
                container_id,
                internal_port
            )
        })
    }

    async fn terminate(&self, container_id: &str) -> anyhow::Result<()> {
        match self
            .client
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(container_id, "Killed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }

    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => {
                debug!(container_id, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container: {}", e)),
        }
    }
}

/// Extract the host port bound to `internal_port`/tcp from an inspect result
fn mapped_host_port(ports: &PortMap, internal_port: u16) -> Option<u16> {
    let key = format!("{}/tcp", internal_port);
    ports
        .get(&key)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        let num = limit.trim_end_matches("gb").trim_end_matches('g');
        (num, 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        let num = limit.trim_end_matches("mb").trim_end_matches('m');
        (num, 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        let num = limit.trim_end_matches("kb").trim_end_matches('k');
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port_map(key: &str, host_port: Option<&str>) -> PortMap {
        let mut ports = PortMap::new();
        ports.insert(
            key.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: host_port.map(String::from),
            }]),
        );
        ports
    }

    #[test]
    fn test_mapped_host_port() {
        let ports = port_map("22/tcp", Some("49153"));
        assert_eq!(mapped_host_port(&ports, 22), Some(49153));
    }

    #[test]
    fn test_mapped_host_port_missing_key() {
        let ports = port_map("80/tcp", Some("49153"));
        assert_eq!(mapped_host_port(&ports, 22), None);
    }

    #[test]
    fn test_mapped_host_port_unbound() {
        let mut ports = PortMap::new();
        ports.insert("22/tcp".to_string(), None);
        assert_eq!(mapped_host_port(&ports, 22), None);
    }

    #[test]
    fn test_mapped_host_port_unparsable() {
        let ports = port_map("22/tcp", Some("not-a-port"));
        assert_eq!(mapped_host_port(&ports, 22), None);
    }

    #[test]
    fn test_mapped_host_port_skips_empty_bindings() {
        let mut ports = port_map("22/tcp", None);
        // A second binding with a real port should still be found
        if let Some(Some(bindings)) = ports.get_mut("22/tcp") {
            bindings.push(PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("49200".to_string()),
            });
        }
        assert_eq!(mapped_host_port(&ports, 22), Some(49200));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
    }
}
