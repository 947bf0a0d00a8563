//! The service control port: every side effect a host controller performs
//! against the outside world goes through this seam.
//!
//! Controllers hold an `Arc<dyn ControlPort>`; the production implementation
//! composes the ping probe, Wake-on-LAN sender, SSH executor, Docker label
//! discovery and webhook notifier. Tests substitute a scripted port.

use crate::discovery;
use crate::error::ControlError;
use crate::messages::{HostEvent, ServiceDescriptor};
use crate::notify::Notifier;
use crate::probe;
use crate::remote::{self, SuspendTarget};
use crate::wol::{self, MacAddr};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// External actions consumed by host controllers. Implementations are
/// stateless and safely callable concurrently from multiple controllers.
#[async_trait]
pub trait ControlPort: Send + Sync {
    /// Reachability probe, bounded by the implementation's own timeout.
    /// Any probe error reports `false`; this never fails.
    async fn probe_alive(&self, addr: IpAddr) -> bool;

    /// Send a wake packet. Failure is reported but not retried here; the
    /// controller's probe polling is the retry loop.
    async fn wake(&self, mac: &MacAddr) -> Result<(), ControlError>;

    /// Execute the host's suspend command. Enforces an execution timeout
    /// distinct from connection establishment; on timeout the in-flight
    /// channel is destroyed and the call fails with `CommandTimeout`.
    async fn suspend(&self, target: &SuspendTarget) -> Result<String, ControlError>;

    /// List the host's services: the static set merged with whatever the
    /// host's Docker daemon advertises through labels. Transport failure is
    /// an `Err`; the caller keeps its previous set.
    async fn discover_services(
        &self,
        addr: IpAddr,
        docker_port: Option<u16>,
        static_services: &[ServiceDescriptor],
    ) -> Result<Vec<ServiceDescriptor>, ControlError>;

    /// Fire-and-forget outbound notification; failures are swallowed.
    async fn notify(&self, event: HostEvent);
}

/// Production control port backed by the system's network tooling
pub struct SystemControlPort {
    probe_timeout: Duration,
    suspend_timeout: Duration,
    suspend_connect_timeout: Duration,
    notifier: Notifier,
}

impl SystemControlPort {
    pub fn new(
        probe_timeout: Duration,
        suspend_timeout: Duration,
        suspend_connect_timeout: Duration,
        notifier: Notifier,
    ) -> Self {
        Self {
            probe_timeout,
            suspend_timeout,
            suspend_connect_timeout,
            notifier,
        }
    }
}

#[async_trait]
impl ControlPort for SystemControlPort {
    async fn probe_alive(&self, addr: IpAddr) -> bool {
        probe::ping_host(addr, self.probe_timeout).await
    }

    async fn wake(&self, mac: &MacAddr) -> Result<(), ControlError> {
        wol::send_magic_packet(mac)
            .await
            .map_err(|e| ControlError::Wake(e.to_string()))
    }

    async fn suspend(&self, target: &SuspendTarget) -> Result<String, ControlError> {
        remote::run_suspend(target, self.suspend_timeout, self.suspend_connect_timeout).await
    }

    async fn discover_services(
        &self,
        addr: IpAddr,
        docker_port: Option<u16>,
        static_services: &[ServiceDescriptor],
    ) -> Result<Vec<ServiceDescriptor>, ControlError> {
        let discovered = match docker_port {
            Some(port) => discovery::discover_labeled_services(addr, port).await?,
            None => Vec::new(),
        };
        Ok(discovery::merge_services(static_services, discovered))
    }

    async fn notify(&self, event: HostEvent) {
        self.notifier.send(&event).await;
    }
}
