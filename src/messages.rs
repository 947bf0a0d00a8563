//! Typed message protocol between the supervisor, host controllers and
//! proxy workers.
//!
//! Controllers and workers never share mutable state; everything crossing a
//! task boundary goes through one of the enums in this module, over a
//! per-receiver ordered channel.

use crate::error::ControlError;
use tokio::sync::oneshot;

/// Lifecycle state of a physical host
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    /// Host is not answering probes
    Stopped,
    /// Wake packet sent, waiting for the first successful probe
    Starting,
    /// Host answers probes and accepts upstream connections
    Started,
    /// Suspend issued, waiting for probes to stop answering
    Stopping,
}

impl HostState {
    pub fn is_started(&self) -> bool {
        matches!(self, HostState::Started)
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostState::Stopped => "stopped",
            HostState::Starting => "starting",
            HostState::Started => "started",
            HostState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Transport protocol of a proxied service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    /// Accepted in configuration and labels but not proxied
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// One proxied service, produced fresh on every discovery refresh.
///
/// Compared by [`id`](ServiceDescriptor::id) against the previous refresh to
/// decide which proxy workers to spawn or tear down.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub protocol: Protocol,
    /// Externally exposed port the worker listens on
    pub proxy_port: u16,
    /// Port the service listens on once the host is up
    pub backend_port: u16,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, protocol: Protocol, proxy_port: u16, backend_port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            protocol,
            proxy_port,
            backend_port: backend_port.unwrap_or(proxy_port),
        }
    }

    /// Synthetic identity used for diffing across discovery refreshes
    pub fn id(&self) -> String {
        format!("{}-{}:{}", self.name, self.proxy_port, self.backend_port)
    }
}

/// A host option change requested through the control API
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostOptionUpdate {
    /// Idle period (seconds) after which an auto-stopped host is suspended
    MaxAliveTime(u64),
    /// Whether the idle timer suspends the host at all
    AutoStop(bool),
}

/// Commands accepted by a host controller.
///
/// `StartFinished` and `StopFinished` are produced by the controller's own
/// wake/suspend attempt tasks, through a clone of the same channel, so that
/// every state mutation happens inside the controller's loop.
#[derive(Debug)]
pub enum HostCommand {
    /// Ensure the host is started, waking it if necessary. The reply carries
    /// `true` once the host answers probes. Concurrent requests during the
    /// same starting window converge on a single wake attempt.
    EnsureStarted {
        /// Originating client hint (from x-real-ip / x-forwarded-for),
        /// for logging and notifications only
        origin: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    /// Suspend the host. Replies once probes stop answering, or with the
    /// suspend failure.
    Stop {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Current lifecycle state
    Status { reply: oneshot::Sender<HostState> },
    /// A worker saw client traffic; resets the idle timer
    RecordActivity,
    /// Services known from the last discovery refresh
    ListServices {
        reply: oneshot::Sender<Vec<ServiceDescriptor>>,
    },
    /// Apply an option change to the in-memory host options
    UpdateOption {
        update: HostOptionUpdate,
        reply: oneshot::Sender<()>,
    },
    /// Start attempt finished (internal)
    StartFinished { ok: bool },
    /// Stop attempt finished (internal)
    StopFinished { result: Result<(), ControlError> },
}

/// Messages a controller sends to one of its proxy workers.
///
/// Each worker has its own ordered channel, so a worker observes status
/// transitions in the order the controller sent them.
#[derive(Debug)]
pub enum WorkerMsg {
    /// Host lifecycle changed. `started: false` also implies the worker must
    /// drop its upstream sockets.
    HostStatus { started: bool },
    /// Force-close every upstream-connected context immediately
    DestroySockets,
    /// Stop accepting, drain all contexts, release the listener and exit
    Dispose,
    /// Report the live connection table
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
}

/// Snapshot of a worker's connection table
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    /// Contexts currently tracked (buffering or relaying)
    pub connections: usize,
    /// Contexts with a live upstream socket
    pub relaying: usize,
}

/// Why a worker task returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Deliberately disposed; must not be respawned
    Disposed,
    /// The listening socket could not be bound or died
    ListenerFailed,
}

/// Outbound notification events (fire and forget)
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A wake attempt began
    HostStarting {
        host: String,
        /// Client that triggered the wake, when known
        origin: Option<String>,
    },
    /// A suspend attempt began
    HostStopping { host: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_id_includes_both_ports() {
        let svc = ServiceDescriptor::new("minecraft", Protocol::Tcp, 8080, Some(25565));
        assert_eq!(svc.id(), "minecraft-8080:25565");
    }

    #[test]
    fn test_descriptor_backend_port_defaults_to_proxy_port() {
        let svc = ServiceDescriptor::new("web", Protocol::Tcp, 8080, None);
        assert_eq!(svc.backend_port, 8080);
        assert_eq!(svc.id(), "web-8080:8080");
    }

    #[test]
    fn test_host_state_display() {
        assert_eq!(HostState::Starting.to_string(), "starting");
        assert!(HostState::Started.is_started());
        assert!(!HostState::Stopping.is_started());
    }
}
