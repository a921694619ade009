//! Container instance lifecycle and readiness detection
//!
//! A [`ContainerInstance`] lives exactly as long as the client connection it
//! serves: launched on connect, torn down on disconnect, never reused.

use crate::config::{ImageConfig, ReadyDefaults};
use crate::docker::ContainerRuntime;
use crate::error::AcquireError;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Readiness-detection timings for one instance
#[derive(Debug, Clone)]
pub struct ReadyProbe {
    /// Total time to wait for the backend to serve its first byte
    pub total_timeout: Duration,
    /// Interval between probe attempts
    pub interval: Duration,
    /// Per-attempt connect/read timeout
    pub read_timeout: Duration,
}

impl ReadyProbe {
    pub fn from_config(image: &ImageConfig, defaults: &ReadyDefaults) -> Self {
        Self {
            total_timeout: image.ready_timeout(defaults),
            interval: image.probe_interval(defaults),
            read_timeout: image.probe_read_timeout(defaults),
        }
    }
}

/// Lifecycle state of a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Constructed, nothing launched yet
    Created,
    /// Runtime launch in progress
    Starting,
    /// Launched, waiting for the backend to serve its first byte
    Polling,
    /// Serving; eligible for relay traffic
    Ready,
    /// Launch or readiness failed; partial resources torn down
    Failed,
    /// Released after normal teardown
    Stopped,
}

/// One disposable backend container bound to a single client connection
#[derive(Debug)]
pub struct ContainerInstance {
    image: String,
    container_id: Option<String>,
    host_port: Option<u16>,
    state: InstanceState,
}

impl ContainerInstance {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            container_id: None,
            host_port: None,
            state: InstanceState::Created,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Host port the backend is reachable on, once discovered
    pub fn host_port(&self) -> Option<u16> {
        self.host_port
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Launch the backend, discover its host port, and wait until it serves.
    ///
    /// Returns the container id and host port on success. Every failure path
    /// tears down whatever was already started and leaves the instance in
    /// `Failed`.
    pub async fn start(
        &mut self,
        runtime: &dyn ContainerRuntime,
        config: &ImageConfig,
        probe: &ReadyProbe,
    ) -> Result<(String, u16), AcquireError> {
        self.state = InstanceState::Starting;

        let container_id = match runtime.launch(config).await {
            Ok(id) => id,
            Err(e) => {
                self.state = InstanceState::Failed;
                return Err(AcquireError::Launch {
                    image: self.image.clone(),
                    reason: e,
                });
            }
        };
        self.container_id = Some(container_id.clone());

        let host_port = match runtime.host_port(&container_id, config.internal_port).await {
            Ok(port) => port,
            Err(e) => {
                // The backend is already running; don't leak it
                self.stop(runtime).await;
                self.state = InstanceState::Failed;
                return Err(AcquireError::Launch {
                    image: self.image.clone(),
                    reason: e,
                });
            }
        };
        self.host_port = Some(host_port);

        self.state = InstanceState::Polling;
        debug!(
            image = %self.image,
            container_id,
            host_port,
            "Instance launched, polling for readiness"
        );

        if wait_for_ready(host_port, probe).await {
            self.state = InstanceState::Ready;
            info!(image = %self.image, container_id, host_port, "Instance ready");
            Ok((container_id, host_port))
        } else {
            warn!(
                image = %self.image,
                container_id,
                host_port,
                timeout_ms = probe.total_timeout.as_millis() as u64,
                "Instance never served a byte, tearing down"
            );
            self.stop(runtime).await;
            self.state = InstanceState::Failed;
            Err(AcquireError::ReadyTimeout {
                image: self.image.clone(),
                container_id,
                timeout: probe.total_timeout,
            })
        }
    }

    /// Terminate and remove the backend. Best-effort and non-throwing: both
    /// steps are attempted even if the first fails, and failures are logged
    /// rather than propagated, since this runs during connection teardown.
    pub async fn stop(&mut self, runtime: &dyn ContainerRuntime) {
        let Some(container_id) = self.container_id.clone() else {
            self.state = InstanceState::Stopped;
            return;
        };

        info!(
            image = %self.image,
            container_id,
            host_port = self.host_port,
            "Stopping instance"
        );

        if let Err(e) = runtime.terminate(&container_id).await {
            warn!(container_id, error = %e, "Failed to terminate instance");
        }
        if let Err(e) = runtime.remove(&container_id).await {
            warn!(container_id, error = %e, "Failed to remove instance");
        }

        self.state = InstanceState::Stopped;
    }
}

/// Probe the host port until the backend serves a byte or the total timeout
/// elapses. Returns true on readiness.
pub(crate) async fn wait_for_ready(host_port: u16, probe: &ReadyProbe) -> bool {
    let deadline = Instant::now() + probe.total_timeout;

    loop {
        if probe_once(host_port, probe.read_timeout).await {
            return true;
        }
        if Instant::now() + probe.interval >= deadline {
            return false;
        }
        sleep(probe.interval).await;
    }
}

/// A single readiness probe: connect and read at least one byte.
///
/// Connecting alone is not enough; docker-proxy accepts on the mapped port
/// as soon as it exists, while the application inside may not be serving
/// yet. The backend must actually emit data.
async fn probe_once(host_port: u16, read_timeout: Duration) -> bool {
    let addr = format!("127.0.0.1:{}", host_port);

    let mut stream = match timeout(read_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };

    let mut buf = [0u8; 1];
    matches!(
        timeout(read_timeout, stream.read(&mut buf)).await,
        Ok(Ok(n)) if n > 0
    )
}
