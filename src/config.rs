use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the switchboard
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for readiness detection
    #[serde(default)]
    pub defaults: ReadyDefaults,

    /// Published images, one section per listening port
    #[serde(default)]
    pub images: HashMap<String, ImageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for all listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Docker daemon URL (default: socket auto-discovery)
    pub docker_host: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Directory whose *.toml files are merged into this configuration
    pub include: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            docker_host: None,
            pid_file: None,
            include: None,
        }
    }
}

/// Default readiness-detection timings, overridable per image
#[derive(Debug, Deserialize, Clone)]
pub struct ReadyDefaults {
    /// Total time to wait for a backend to serve its first byte, in seconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Per-probe read timeout in milliseconds
    #[serde(default = "default_probe_read_timeout")]
    pub probe_read_timeout_ms: u64,
}

impl Default for ReadyDefaults {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout(),
            probe_interval_ms: default_probe_interval(),
            probe_read_timeout_ms: default_probe_read_timeout(),
        }
    }
}

/// Image pull policy
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Configuration for a single published image
///
/// # Security Warning
///
/// Container images named here are pulled and run for every inbound
/// connection, and `command`/`env` pass straight through to the runtime.
/// Configuration files must be protected with appropriate file permissions;
/// a malicious configuration runs arbitrary containers on this host.
#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    /// Section name, filled in at load time
    #[serde(skip)]
    pub name: String,

    /// External TCP port clients connect to (unique across sections)
    pub external_port: u16,

    /// Docker image to run for each connection
    pub image: String,

    /// Port the backend listens on inside the container
    pub internal_port: u16,

    /// Maximum concurrent instances for this image (0 = unlimited)
    #[serde(default)]
    pub limit: u32,

    /// Container command, passed through to the runtime uninterpreted
    pub command: Option<String>,

    /// Environment variables for the container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Docker network to connect to (default: bridge)
    pub network: Option<String>,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Readiness timeout in seconds (overrides default)
    pub ready_timeout_secs: Option<u64>,

    /// Probe interval in milliseconds (overrides default)
    pub probe_interval_ms: Option<u64>,

    /// Per-probe read timeout in milliseconds (overrides default)
    pub probe_read_timeout_ms: Option<u64>,
}

impl ImageConfig {
    pub fn ready_timeout(&self, defaults: &ReadyDefaults) -> Duration {
        Duration::from_secs(self.ready_timeout_secs.unwrap_or(defaults.ready_timeout_secs))
    }

    pub fn probe_interval(&self, defaults: &ReadyDefaults) -> Duration {
        Duration::from_millis(self.probe_interval_ms.unwrap_or(defaults.probe_interval_ms))
    }

    pub fn probe_read_timeout(&self, defaults: &ReadyDefaults) -> Duration {
        Duration::from_millis(
            self.probe_read_timeout_ms
                .unwrap_or(defaults.probe_read_timeout_ms),
        )
    }

    /// Split the opaque command string into argv for the container
    pub fn command_args(&self) -> anyhow::Result<Vec<String>> {
        match self.command {
            Some(ref cmd) => shell_words::split(cmd)
                .map_err(|e| anyhow::anyhow!("Image '{}': invalid command: {}", self.name, e)),
            None => Ok(Vec::new()),
        }
    }

    /// Validate this image section
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.image.is_empty() {
            return Err(format!("Image '{}': 'image' must not be empty", name));
        }
        if self.external_port == 0 {
            return Err(format!(
                "Image '{}': 'external_port' must be greater than 0",
                name
            ));
        }
        if self.internal_port == 0 {
            return Err(format!(
                "Image '{}': 'internal_port' must be greater than 0",
                name
            ));
        }
        if let Some(ref cmd) = self.command {
            if shell_words::split(cmd).is_err() {
                return Err(format!("Image '{}': 'command' is not parseable", name));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ready_timeout() -> u64 {
    5 // 5 seconds total before a backend is declared dead
}

fn default_probe_interval() -> u64 {
    100 // 100ms between probes
}

fn default_probe_read_timeout() -> u64 {
    100 // 100ms to read the first byte per probe
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// If `server.include` names a directory, every `*.toml` file in it is
    /// merged on top of the base file (in file-name order) before
    /// deserialization, so image sections can be split across files.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read config file '{}': {}", path.display(), e))?;
        let mut table: toml::Table = toml::from_str(&content)?;

        if let Some(dir) = include_dir(&table) {
            let dir = match path.parent() {
                Some(parent) => parent.join(&dir),
                None => dir.into(),
            };
            for fragment in read_include_dir(&dir)? {
                merge_tables(&mut table, fragment);
            }
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        for (name, image) in config.images.iter_mut() {
            image.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.images.is_empty() {
            anyhow::bail!("Invalid configuration: no image sections");
        }

        let mut errors = Vec::new();
        let mut seen_ports = HashSet::new();

        for (name, image) in &self.images {
            if let Err(e) = image.validate(name) {
                errors.push(e);
            }
            if !seen_ports.insert(image.external_port) {
                errors.push(format!(
                    "Image '{}': external_port {} is used by another section",
                    name, image.external_port
                ));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn include_dir(table: &toml::Table) -> Option<String> {
    table
        .get("server")?
        .as_table()?
        .get("include")?
        .as_str()
        .map(String::from)
}

/// Read and parse every *.toml file in the include directory, file-name order
fn read_include_dir(dir: &Path) -> anyhow::Result<Vec<toml::Table>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("Cannot read include dir '{}': {}", dir.display(), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    paths.sort();

    let mut fragments = Vec::with_capacity(paths.len());
    for p in paths {
        let content = std::fs::read_to_string(&p)
            .map_err(|e| anyhow::anyhow!("Cannot read include file '{}': {}", p.display(), e))?;
        let table: toml::Table = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid include file '{}': {}", p.display(), e))?;
        fragments.push(table);
    }
    Ok(fragments)
}

/// Merge `overlay` into `base`; tables merge recursively, scalars from the
/// overlay win.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge_tables(existing, incoming);
                } else {
                    base.insert(key, toml::Value::Table(incoming));
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}
