//! Fleet supervisor
//!
//! Owns one host controller per configured host and the configuration
//! itself (for persisting option updates). The HTTP control server talks
//! exclusively to this type; controllers are never reached directly.

use crate::config::Config;
use crate::control::ControlPort;
use crate::controller::{HostController, HostHandle};
use crate::error::ControlError;
use crate::messages::{HostOptionUpdate, HostState, ServiceDescriptor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Status summary for one host, as served by the control API
#[derive(Debug, Clone, serde::Serialize)]
pub struct HostSummary {
    pub name: String,
    pub state: HostState,
    pub started: bool,
    pub services: usize,
}

pub struct FleetSupervisor {
    handles: HashMap<String, HostHandle>,
    tasks: Vec<(String, JoinHandle<()>)>,
    config: Mutex<Config>,
    config_path: PathBuf,
    start_timeout: Duration,
}

impl FleetSupervisor {
    /// Spawn one controller per configured host
    pub fn new(
        config: Config,
        config_path: PathBuf,
        control: Arc<dyn ControlPort>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut handles = HashMap::new();
        let mut tasks = Vec::new();

        for (name, host_config) in &config.hosts {
            let (handle, task) = HostController::spawn(
                name.clone(),
                host_config.clone(),
                config.server.bind.clone(),
                config.defaults.clone(),
                Arc::clone(&control),
                shutdown_rx.clone(),
            );
            handles.insert(name.clone(), handle);
            tasks.push((name.clone(), task));
        }

        info!(hosts = handles.len(), "Fleet supervisor started");

        Self {
            handles,
            tasks,
            start_timeout: config.defaults.host_start_timeout(),
            config: Mutex::new(config),
            config_path,
        }
    }

    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Wake the host, bounded by the host-start timeout. `None` for unknown
    /// hosts; `Some(false)` does not cancel the in-flight attempt.
    pub async fn start_host(&self, name: &str) -> Option<bool> {
        let handle = self.handles.get(name)?;
        Some(handle.ensure_started(None, self.start_timeout).await)
    }

    /// Suspend the host. `None` for unknown hosts.
    pub async fn stop_host(&self, name: &str) -> Option<Result<(), ControlError>> {
        let handle = self.handles.get(name)?;
        Some(handle.stop().await)
    }

    pub async fn host_status(&self, name: &str) -> Option<HostState> {
        self.handles.get(name)?.status().await
    }

    pub async fn list_services(&self, name: &str) -> Option<Vec<ServiceDescriptor>> {
        self.handles.get(name)?.list_services().await
    }

    pub async fn list_hosts(&self) -> Vec<HostSummary> {
        let mut summaries = Vec::with_capacity(self.handles.len());
        for name in self.host_names() {
            let handle = &self.handles[&name];
            let state = handle.status().await.unwrap_or(HostState::Stopped);
            let services = handle.list_services().await.unwrap_or_default().len();
            summaries.push(HostSummary {
                name,
                started: state.is_started(),
                state,
                services,
            });
        }
        summaries
    }

    /// Apply an option update to the running controller and persist it.
    /// Returns `false` for unknown hosts.
    pub async fn update_option(&self, name: &str, update: HostOptionUpdate) -> anyhow::Result<bool> {
        let Some(handle) = self.handles.get(name) else {
            return Ok(false);
        };
        if !handle.update_option(update).await {
            anyhow::bail!("host controller for '{}' is gone", name);
        }

        let mut config = self.config.lock().await;
        if let Some(host) = config.hosts.get_mut(name) {
            host.options.apply(update);
        }
        config.save(&self.config_path)?;
        info!(host = name, ?update, "Host options persisted");
        Ok(true)
    }

    /// Wait for every controller to drain, bounded by `timeout`.
    /// Call after the shutdown signal was sent.
    pub async fn join(self, timeout: Duration) {
        let result = tokio::time::timeout(timeout, async {
            for (name, task) in self.tasks {
                if let Err(e) = task.await {
                    error!(host = %name, error = %e, "Host controller task failed");
                }
            }
        })
        .await;

        if result.is_err() {
            warn!("Shutdown drain timed out; abandoning remaining controllers");
        }
    }
}
