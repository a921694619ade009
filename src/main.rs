use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use switchboard::config::Config;
use switchboard::docker::DockerRuntime;
use switchboard::manager::InstanceManager;
use switchboard::proxy::ProxyListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchboard=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; an invalid or empty configuration is fatal
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/switchboard.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Connect to the container runtime before opening any listener
    let runtime = Arc::new(DockerRuntime::new(config.server.docker_host.as_deref()).await?);

    let mut manager = InstanceManager::new(runtime, config.defaults.clone());
    let mut images: Vec<_> = config.images.values().cloned().collect();
    images.sort_by_key(|image| image.external_port);
    for image in images {
        manager.register_image(image)?;
    }
    let manager = Arc::new(manager);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One listener per published port
    let mut listener_handles = Vec::new();
    let mut ports = manager.external_ports();
    ports.sort_unstable();
    for port in ports {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address: {}", e)
            })?;

        let listener = ProxyListener::new(addr, Arc::clone(&manager), shutdown_rx.clone());
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(port, error = %e, "Listener error");
            }
        }));
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and sweep whatever is still running
    let _ = shutdown_tx.send(true);

    info!("Stopping remaining instances...");
    manager.stop_all().await;

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in listener_handles {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting switchboard");
    info!(
        bind = %config.server.bind,
        docker_host = ?config.server.docker_host,
        "Server configuration"
    );
    info!(
        ready_timeout_secs = config.defaults.ready_timeout_secs,
        probe_interval_ms = config.defaults.probe_interval_ms,
        probe_read_timeout_ms = config.defaults.probe_read_timeout_ms,
        "Readiness defaults"
    );
    info!(
        image_count = config.images.len(),
        images = ?config.images.keys().collect::<Vec<_>>(),
        "Configured images"
    );
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
