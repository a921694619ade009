//! Instance registry and per-image admission control
//!
//! The manager is the single authority for instance create/destroy
//! transitions. All registry mutation happens inside `acquire` and `release`
//! (plus the shutdown sweep); nothing else touches the maps.

use crate::config::{ImageConfig, ReadyDefaults};
use crate::docker::ContainerRuntime;
use crate::error::AcquireError;
use crate::instance::{ContainerInstance, ReadyProbe};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bookkeeping for one registered (Ready) instance
struct RegisteredInstance {
    image: String,
    container_id: String,
}

/// Live-instance registry. One lock covers all three maps, so the limit
/// check, the pending reservation, and registration are mutually atomic.
#[derive(Default)]
struct Registry {
    /// Registered instances keyed by host port
    by_port: HashMap<u16, RegisteredInstance>,
    /// Host ports of registered instances, grouped by image name
    by_image: HashMap<String, HashSet<u16>>,
    /// Starts currently in flight, counted per image name
    pending: HashMap<String, u32>,
}

impl Registry {
    /// Instances counted against the limit: registered plus in-flight starts
    fn active_count(&self, image: &str) -> u32 {
        let live = self.by_image.get(image).map(|p| p.len() as u32).unwrap_or(0);
        let pending = self.pending.get(image).copied().unwrap_or(0);
        live + pending
    }

    fn reserve(&mut self, image: &str) {
        *self.pending.entry(image.to_string()).or_insert(0) += 1;
    }

    fn unreserve(&mut self, image: &str) {
        if let Some(count) = self.pending.get_mut(image) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(image);
            }
        }
    }

    fn register(&mut self, image: &str, container_id: &str, host_port: u16) {
        self.by_port.insert(
            host_port,
            RegisteredInstance {
                image: image.to_string(),
                container_id: container_id.to_string(),
            },
        );
        self.by_image
            .entry(image.to_string())
            .or_default()
            .insert(host_port);
    }

    fn unregister(&mut self, image: &str, host_port: u16) {
        self.by_port.remove(&host_port);
        let emptied = match self.by_image.get_mut(image) {
            Some(ports) => {
                ports.remove(&host_port);
                ports.is_empty()
            }
            None => false,
        };
        if emptied {
            self.by_image.remove(image);
        }
    }
}

/// Owns every live instance and enforces per-image concurrency limits
pub struct InstanceManager {
    /// Published images keyed by external port; immutable after bootstrap
    images: HashMap<u16, ImageConfig>,
    defaults: ReadyDefaults,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Mutex<Registry>,
}

impl InstanceManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, defaults: ReadyDefaults) -> Self {
        Self {
            images: HashMap::new(),
            defaults,
            runtime,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register an image for its external port. Bootstrap-only; the manager
    /// is shared immutably once listeners are running.
    pub fn register_image(&mut self, config: ImageConfig) -> anyhow::Result<()> {
        if self.images.contains_key(&config.external_port) {
            anyhow::bail!(
                "External port {} is already registered",
                config.external_port
            );
        }
        info!(
            port = config.external_port,
            name = %config.name,
            image = %config.image,
            limit = config.limit,
            "Registered image"
        );
        self.images.insert(config.external_port, config);
        Ok(())
    }

    /// All published external ports
    pub fn external_ports(&self) -> Vec<u16> {
        self.images.keys().copied().collect()
    }

    /// Number of registered (Ready, unreleased) instances for an image
    pub fn live_count(&self, image: &str) -> usize {
        self.registry
            .lock()
            .by_image
            .get(image)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Admit the connection and bring up a fresh backend for it.
    ///
    /// The limit check counts registered instances plus starts still in
    /// flight, so concurrent calls for the same image can never jointly
    /// exceed the limit. Denial has no side effects. On success the instance
    /// is registered in both maps before it is returned.
    pub async fn acquire(&self, external_port: u16) -> Result<ContainerInstance, AcquireError> {
        let config = self
            .images
            .get(&external_port)
            .ok_or(AcquireError::UnknownPort(external_port))?;

        {
            let mut registry = self.registry.lock();
            if config.limit > 0 && registry.active_count(&config.name) >= config.limit {
                info!(
                    image = %config.name,
                    limit = config.limit,
                    "Admission denied, image at its instance limit"
                );
                return Err(AcquireError::LimitReached {
                    image: config.name.clone(),
                    limit: config.limit,
                });
            }
            registry.reserve(&config.name);
        }

        let probe = ReadyProbe::from_config(config, &self.defaults);
        let mut instance = ContainerInstance::new(&config.name);
        let result = instance.start(self.runtime.as_ref(), config, &probe).await;

        let mut registry = self.registry.lock();
        registry.unreserve(&config.name);

        match result {
            Ok((container_id, host_port)) => {
                registry.register(&config.name, &container_id, host_port);
                debug!(
                    image = %config.name,
                    container_id,
                    host_port,
                    live = registry.active_count(&config.name),
                    "Instance registered"
                );
                Ok(instance)
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down a session's instance and forget it.
    ///
    /// The stop is best-effort; the instance is unregistered from both maps
    /// regardless of the stop outcome.
    pub async fn release(&self, mut instance: ContainerInstance) {
        instance.stop(self.runtime.as_ref()).await;

        if let Some(host_port) = instance.host_port() {
            let mut registry = self.registry.lock();
            registry.unregister(instance.image(), host_port);
            debug!(
                image = %instance.image(),
                host_port,
                "Instance released"
            );
        }
    }

    /// Shutdown sweep: terminate and remove anything still registered.
    pub async fn stop_all(&self) {
        let leftovers: Vec<RegisteredInstance> = {
            let mut registry = self.registry.lock();
            registry.by_image.clear();
            registry.by_port.drain().map(|(_, entry)| entry).collect()
        };

        if leftovers.is_empty() {
            return;
        }

        info!(count = leftovers.len(), "Stopping remaining instances");
        for entry in leftovers {
            if let Err(e) = self.runtime.terminate(&entry.container_id).await {
                warn!(
                    image = %entry.image,
                    container_id = %entry.container_id,
                    error = %e,
                    "Failed to terminate instance during shutdown"
                );
            }
            if let Err(e) = self.runtime.remove(&entry.container_id).await {
                warn!(
                    image = %entry.image,
                    container_id = %entry.container_id,
                    error = %e,
                    "Failed to remove instance during shutdown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Runtime whose "containers" are local listeners greeting each
    /// connection with a banner byte.
    struct FakeRuntime {
        launches: AtomicUsize,
        fail_launch: AtomicBool,
        silent: bool,
        ports: Mutex<HashMap<String, u16>>,
        terminated: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                fail_launch: AtomicBool::new(false),
                silent: false,
                ports: Mutex::new(HashMap::new()),
                terminated: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }

        fn new_silent() -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                fail_launch: AtomicBool::new(false),
                silent: true,
                ports: Mutex::new(HashMap::new()),
                terminated: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }

        fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        async fn spawn_backend(silent: bool) -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                let mut held = Vec::new();
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        break;
                    };
                    if silent {
                        held.push(stream);
                    } else {
                        let _ = stream.write_all(b"ready\n").await;
                    }
                }
            });
            port
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn launch(&self, _config: &ImageConfig) -> anyhow::Result<String> {
            if self.fail_launch.load(Ordering::SeqCst) {
                anyhow::bail!("simulated launch failure");
            }
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            let id = format!("fake-{}", n);
            let port = Self::spawn_backend(self.silent).await;
            self.ports.lock().insert(id.clone(), port);
            Ok(id)
        }

        async fn host_port(&self, container_id: &str, _internal_port: u16) -> anyhow::Result<u16> {
            self.ports
                .lock()
                .get(container_id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown container {}", container_id))
        }

        async fn terminate(&self, container_id: &str) -> anyhow::Result<()> {
            self.terminated.lock().push(container_id.to_string());
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
            self.removed.lock().push(container_id.to_string());
            Ok(())
        }
    }

    fn image_config(name: &str, external_port: u16, limit: u32) -> ImageConfig {
        let mut image: ImageConfig = toml::from_str(&format!(
            r#"
external_port = {}
image = "test/{}:latest"
internal_port = 7
limit = {}
"#,
            external_port, name, limit
        ))
        .unwrap();
        image.name = name.to_string();
        image
    }

    fn test_defaults() -> ReadyDefaults {
        ReadyDefaults {
            ready_timeout_secs: 1,
            probe_interval_ms: 20,
            probe_read_timeout_ms: 50,
        }
    }

    fn manager_with(
        runtime: Arc<FakeRuntime>,
        configs: Vec<ImageConfig>,
    ) -> Arc<InstanceManager> {
        let mut manager = InstanceManager::new(runtime, test_defaults());
        for config in configs {
            manager.register_image(config).unwrap();
        }
        Arc::new(manager)
    }

    #[test]
    fn test_register_image_rejects_duplicate_port() {
        let runtime = FakeRuntime::new();
        let mut manager = InstanceManager::new(runtime, test_defaults());
        manager.register_image(image_config("a", 2222, 0)).unwrap();
        let err = manager
            .register_image(image_config("b", 2222, 0))
            .unwrap_err();
        assert!(err.to_string().contains("2222"));
    }

    #[tokio::test]
    async fn test_acquire_unknown_port() {
        let runtime = FakeRuntime::new();
        let manager = manager_with(runtime, vec![image_config("ssh", 2222, 0)]);
        let err = manager.acquire(9999).await.unwrap_err();
        assert!(matches!(err, AcquireError::UnknownPort(9999)));
    }

    #[tokio::test]
    async fn test_limit_never_jointly_exceeded() {
        let runtime = FakeRuntime::new();
        let manager = manager_with(runtime.clone(), vec![image_config("ssh", 2222, 2)]);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.acquire(2222).await }));
        }

        let mut acquired = Vec::new();
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(instance) => acquired.push(instance),
                Err(AcquireError::LimitReached { limit, .. }) => {
                    assert_eq!(limit, 2);
                    denied += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(acquired.len(), 2);
        assert_eq!(denied, 4);
        assert_eq!(manager.live_count("ssh"), 2);
        // Denied connections never launched anything
        assert_eq!(runtime.launch_count(), 2);

        for instance in acquired {
            manager.release(instance).await;
        }
        assert_eq!(manager.live_count("ssh"), 0);
    }

    #[tokio::test]
    async fn test_limit_zero_is_unlimited() {
        let runtime = FakeRuntime::new();
        let manager = manager_with(runtime, vec![image_config("ssh", 2222, 0)]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.acquire(2222).await }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(manager.live_count("ssh"), 4);
    }

    #[tokio::test]
    async fn test_release_frees_the_slot() {
        let runtime = FakeRuntime::new();
        let manager = manager_with(runtime.clone(), vec![image_config("ssh", 2222, 1)]);

        let first = manager.acquire(2222).await.unwrap();
        assert!(matches!(
            manager.acquire(2222).await,
            Err(AcquireError::LimitReached { .. })
        ));

        let container_id = first.container_id().unwrap().to_string();
        manager.release(first).await;

        assert!(runtime.terminated.lock().contains(&container_id));
        assert!(runtime.removed.lock().contains(&container_id));
        assert_eq!(manager.live_count("ssh"), 0);

        // The slot is free again
        let third = manager.acquire(2222).await.unwrap();
        manager.release(third).await;
    }

    #[tokio::test]
    async fn test_launch_failure_releases_the_pending_slot() {
        let runtime = FakeRuntime::new();
        runtime.fail_launch.store(true, Ordering::SeqCst);
        let manager = manager_with(runtime.clone(), vec![image_config("ssh", 2222, 1)]);

        let err = manager.acquire(2222).await.unwrap_err();
        assert!(matches!(err, AcquireError::Launch { .. }));
        assert_eq!(manager.live_count("ssh"), 0);

        // A LimitReached here would mean the failed start kept its slot
        runtime.fail_launch.store(false, Ordering::SeqCst);
        let instance = manager.acquire(2222).await.unwrap();
        manager.release(instance).await;
    }

    #[tokio::test]
    async fn test_ready_timeout_tears_down_and_registers_nothing() {
        let runtime = FakeRuntime::new_silent();
        let manager = manager_with(runtime.clone(), vec![image_config("ssh", 2222, 1)]);

        let err = manager.acquire(2222).await.unwrap_err();
        assert!(matches!(err, AcquireError::ReadyTimeout { .. }));
        assert_eq!(manager.live_count("ssh"), 0);

        // The partially-started backend was terminated and removed
        assert_eq!(runtime.terminated.lock().as_slice(), &["fake-0"]);
        assert_eq!(runtime.removed.lock().as_slice(), &["fake-0"]);
    }

    #[tokio::test]
    async fn test_stop_all_sweeps_registered_instances() {
        let runtime = FakeRuntime::new();
        let manager = manager_with(runtime.clone(), vec![image_config("ssh", 2222, 0)]);

        let a = manager.acquire(2222).await.unwrap();
        let b = manager.acquire(2222).await.unwrap();
        let ids: Vec<String> = [&a, &b]
            .iter()
            .map(|i| i.container_id().unwrap().to_string())
            .collect();

        manager.stop_all().await;
        assert_eq!(manager.live_count("ssh"), 0);
        for id in &ids {
            assert!(runtime.terminated.lock().contains(id));
            assert!(runtime.removed.lock().contains(id));
        }

        // Sessions still holding their instances release them afterwards;
        // the runtime treats the second stop as already-gone.
        manager.release(a).await;
        manager.release(b).await;
    }
}
