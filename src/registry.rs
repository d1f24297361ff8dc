//! The authoritative set of instances and their persistence.
//!
//! The registry owns the name → instance map, snapshot persistence, and the
//! admission path that keeps the number of running instances under the
//! global cap, evicting the least recently used instance when allowed.

use crate::config::InstancesConfig;
use crate::instance::{
    Instance, InstanceError, InstanceOptionsRequest, InstanceSnapshot, StartGuard,
    kill_process_group,
};
use crate::lifecycle;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid instance name: {0}")]
    InvalidName(String),

    #[error("instance {0} is still running")]
    StillRunning(String),

    #[error("start already in progress for instance {0}")]
    StartInProgress(String),

    #[error("maximum number of running instances ({0}) reached")]
    CapacityExceeded(usize),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

pub struct Registry {
    config: Arc<InstancesConfig>,
    instances: DashMap<String, Arc<Instance>>,
    /// Serializes admission decisions: at most one capacity check + eviction
    /// + start sequence runs at a time.
    admission: Mutex<()>,
}

impl Registry {
    /// Create a registry, ensuring the state and log directories exist.
    pub fn new(config: InstancesConfig) -> Result<Self> {
        let snapshots = config.state_dir.join("instances");
        std::fs::create_dir_all(&snapshots)
            .with_context(|| format!("Failed to create state dir: {}", snapshots.display()))?;
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log dir: {}", config.log_dir.display()))?;

        Ok(Self {
            config: Arc::new(config),
            instances: DashMap::new(),
            admission: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &InstancesConfig {
        &self.config
    }

    /// Instance names must be usable as filesystem components.
    pub fn validate_name(name: &str) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidName("name is empty".to_string()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(RegistryError::InvalidName(format!(
                "name longer than {} characters",
                MAX_NAME_LEN
            )));
        }
        if name == "." || name == ".." {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(RegistryError::InvalidName(format!(
                "name contains path separators or control characters: {}",
                name
            )));
        }
        Ok(())
    }

    /// Create a stopped instance, applying restart-policy defaults from the
    /// global configuration, and persist it.
    pub async fn create(
        &self,
        name: &str,
        request: InstanceOptionsRequest,
    ) -> Result<Arc<Instance>, RegistryError> {
        Self::validate_name(name)?;
        let options = request.resolve(name, &self.config);

        use dashmap::mapref::entry::Entry;
        let instance = match self.instances.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::AlreadyExists(name.to_string()));
            }
            Entry::Vacant(entry) => {
                let instance =
                    Instance::new(name.to_string(), Arc::clone(&self.config), options);
                entry.insert(Arc::clone(&instance));
                instance
            }
        };

        info!(instance = name, "Instance created");
        self.persist(&instance).await;
        Ok(instance)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Instance>, RegistryError> {
        self.instances
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All instances, sorted by name.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut all: Vec<_> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub async fn running_instances(&self) -> Vec<Arc<Instance>> {
        let mut running = Vec::new();
        for instance in self.list() {
            if instance.is_running().await {
                running.push(instance);
            }
        }
        running
    }

    /// Replace an instance's options. The instance is not restarted; callers
    /// that changed host or port restart explicitly.
    pub async fn update(
        &self,
        name: &str,
        request: InstanceOptionsRequest,
    ) -> Result<Arc<Instance>, RegistryError> {
        let instance = self.get(name)?;
        let options = request.resolve(name, &self.config);
        instance.set_options(options).await;
        self.persist(&instance).await;
        Ok(instance)
    }

    /// Delete a stopped instance. Cancels any pending restart it may still
    /// hold, then removes the persisted snapshot.
    pub async fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self.get(name)?;

        if instance.is_running().await {
            return Err(RegistryError::StillRunning(name.to_string()));
        }
        // A stopped instance can still hold a pending restart timer
        if let Err(e) = instance.stop().await
            && !matches!(e, InstanceError::NotRunning(_))
        {
            return Err(e.into());
        }

        self.instances.remove(name);
        let path = self.snapshot_path(name);
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(instance = name, error = %e, "Failed to remove instance snapshot");
        }

        info!(instance = name, "Instance deleted");
        Ok(())
    }

    /// Start an instance through admission. Holds the returned [`StartGuard`]
    /// for the caller so a readiness wait can keep the start-in-progress
    /// window open; dropping the guard closes it.
    pub async fn start_instance(&self, name: &str) -> Result<StartGuard, RegistryError> {
        let instance = self.get(name)?;

        if instance.is_running().await {
            return Err(InstanceError::AlreadyRunning(name.to_string()).into());
        }
        let guard = instance
            .try_begin_start()
            .ok_or_else(|| RegistryError::StartInProgress(name.to_string()))?;

        let _admission = self.admission.lock().await;

        let running = self.running_instances().await;
        if !running.iter().any(|i| i.name() == name)
            && running.len() >= self.config.max_running_instances
        {
            if !self.config.enable_lru_eviction {
                return Err(RegistryError::CapacityExceeded(
                    self.config.max_running_instances,
                ));
            }

            let Some(victim) = lifecycle::select_victim(&running, name) else {
                return Err(RegistryError::CapacityExceeded(
                    self.config.max_running_instances,
                ));
            };

            info!(
                victim = victim.name(),
                requester = name,
                "Evicting least recently used instance"
            );
            if let Err(e) = victim.stop().await {
                error!(victim = victim.name(), error = %e, "Eviction failed");
                return Err(RegistryError::CapacityExceeded(
                    self.config.max_running_instances,
                ));
            }
            metrics::counter!("llamactl_instance_evictions_total").increment(1);
            self.persist(&victim).await;
        }

        instance.start().await?;
        // Starting counts as a use so a fresh instance is not the next victim
        instance.touch();
        self.persist(&instance).await;
        self.update_running_gauge().await;
        Ok(guard)
    }

    pub async fn stop_instance(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self.get(name)?;
        instance.stop().await?;
        self.persist(&instance).await;
        self.update_running_gauge().await;
        Ok(())
    }

    /// Restart an instance. A running instance restarts in place (its slot
    /// is already accounted for); a stopped one goes through admission.
    pub async fn restart_instance(&self, name: &str) -> Result<(), RegistryError> {
        let instance = self.get(name)?;

        if instance.is_running().await {
            instance.restart().await?;
            instance.touch();
            self.persist(&instance).await;
            Ok(())
        } else {
            self.start_instance(name).await.map(|_| ())
        }
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.config
            .state_dir
            .join("instances")
            .join(format!("{}.json", name))
    }

    /// Persist an instance snapshot. Best-effort: failures are logged and
    /// never fail the mutating operation.
    pub async fn persist(&self, instance: &Arc<Instance>) {
        let snapshot = instance.snapshot().await;
        let path = self.snapshot_path(instance.name());

        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(instance = instance.name(), error = %e, "Failed to serialize instance snapshot");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, json).await {
            warn!(
                instance = instance.name(),
                path = %path.display(),
                error = %e,
                "Failed to persist instance snapshot"
            );
        }
    }

    /// Load persisted instances from the state directory. Instances are not
    /// started here; the returned names were running at last persist, for
    /// the caller to restart when `restore_last_state` is enabled.
    pub async fn restore(&self) -> Result<Vec<String>> {
        let dir = self.config.state_dir.join("instances");
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read state dir: {}", dir.display()))?;

        let mut previously_running = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let snapshot: InstanceSnapshot = match tokio::fs::read_to_string(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable instance snapshot");
                    continue;
                }
            };

            if let Err(e) = Self::validate_name(&snapshot.name) {
                warn!(path = %path.display(), error = %e, "Skipping snapshot with invalid name");
                continue;
            }

            let options = snapshot.options.clamped(&snapshot.name);
            let instance = Instance::new(
                snapshot.name.clone(),
                Arc::clone(&self.config),
                options,
            );
            self.instances.insert(snapshot.name.clone(), instance);
            debug!(instance = %snapshot.name, "Instance restored from snapshot");

            if snapshot.running {
                previously_running.push(snapshot.name);
            }
        }

        previously_running.sort();
        info!(
            count = self.instances.len(),
            previously_running = previously_running.len(),
            "Registry restored"
        );
        Ok(previously_running)
    }

    /// Stop every running instance, waiting up to `grace` for the sweep to
    /// finish, then kill survivors by process group.
    pub async fn shutdown(&self, grace: Duration) {
        let running = self.running_instances().await;
        if running.is_empty() {
            return;
        }

        info!(count = running.len(), "Stopping all running instances");
        let stops = running.iter().map(|instance| {
            let instance = Arc::clone(instance);
            async move {
                if let Err(e) = instance.stop().await {
                    warn!(instance = instance.name(), error = %e, "Failed to stop instance during shutdown");
                }
            }
        });

        if tokio::time::timeout(grace, futures_util::future::join_all(stops))
            .await
            .is_err()
        {
            for instance in self.running_instances().await {
                if let Some(pid) = instance.pid().await {
                    warn!(instance = instance.name(), pid, "Killing surviving instance");
                    kill_process_group(pid);
                }
            }
        }
        self.update_running_gauge().await;
    }

    async fn update_running_gauge(&self) {
        let count = self.running_instances().await.len();
        metrics::gauge!("llamactl_running_instances").set(count as f64);
    }
}
