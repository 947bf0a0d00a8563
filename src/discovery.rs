//! Container-label service discovery
//!
//! Queries the host's Docker daemon over TCP and turns `wakegate.*`
//! container labels into service descriptors. A container opts in by
//! carrying a `wakegate.port` label:
//!
//! ```text
//! wakegate.port = "8080"          # externally exposed proxy port (required)
//! wakegate.backend-port = "25565" # container port, defaults to wakegate.port
//! wakegate.name = "minecraft"     # defaults to the container name
//! wakegate.protocol = "tcp"       # tcp (default) or udp
//! ```
//!
//! Discovery runs against a machine that is frequently powered off, so
//! transport failures are expected; the caller keeps its previous set.

use crate::error::ControlError;
use crate::messages::{Protocol, ServiceDescriptor};
use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, warn};

const LABEL_PORT: &str = "wakegate.port";
const LABEL_BACKEND_PORT: &str = "wakegate.backend-port";
const LABEL_NAME: &str = "wakegate.name";
const LABEL_PROTOCOL: &str = "wakegate.protocol";

/// Connection timeout towards the remote daemon, in seconds
const DOCKER_TIMEOUT_SECS: u64 = 5;

/// List label-discovered services on the host's Docker daemon.
pub async fn discover_labeled_services(
    addr: IpAddr,
    docker_port: u16,
) -> Result<Vec<ServiceDescriptor>, ControlError> {
    let url = format!("tcp://{}:{}", addr, docker_port);
    let client = Docker::connect_with_http(&url, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        .map_err(|e| ControlError::Discovery(format!("{}: {}", url, e)))?;

    let options = ListContainersOptions::<String> {
        all: true,
        ..Default::default()
    };
    let containers = client
        .list_containers(Some(options))
        .await
        .map_err(|e| ControlError::Discovery(format!("{}: {}", url, e)))?;

    let mut services = Vec::new();
    for container in containers {
        let labels = container.labels.unwrap_or_default();
        let container_name = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        match service_from_labels(&container_name, &labels) {
            Ok(Some(service)) => services.push(service),
            Ok(None) => {}
            Err(reason) => {
                warn!(container = %container_name, reason, "Ignoring container with bad wakegate labels");
            }
        }
    }

    debug!(addr = %addr, count = services.len(), "Label discovery finished");
    Ok(services)
}

/// Interpret one container's label map. `Ok(None)` means the container does
/// not participate.
fn service_from_labels(
    container_name: &str,
    labels: &HashMap<String, String>,
) -> Result<Option<ServiceDescriptor>, String> {
    let Some(port_label) = labels.get(LABEL_PORT) else {
        return Ok(None);
    };

    let proxy_port: u16 = port_label
        .parse()
        .map_err(|_| format!("bad {}: '{}'", LABEL_PORT, port_label))?;

    let backend_port = match labels.get(LABEL_BACKEND_PORT) {
        Some(raw) => Some(
            raw.parse::<u16>()
                .map_err(|_| format!("bad {}: '{}'", LABEL_BACKEND_PORT, raw))?,
        ),
        None => None,
    };

    let protocol = match labels.get(LABEL_PROTOCOL).map(String::as_str) {
        None | Some("tcp") => Protocol::Tcp,
        Some("udp") => Protocol::Udp,
        Some(other) => return Err(format!("bad {}: '{}'", LABEL_PROTOCOL, other)),
    };

    let name = labels
        .get(LABEL_NAME)
        .cloned()
        .unwrap_or_else(|| container_name.to_string());
    if name.is_empty() {
        return Err("no service name (unnamed container without wakegate.name)".to_string());
    }

    Ok(Some(ServiceDescriptor::new(name, protocol, proxy_port, backend_port)))
}

/// Merge static and discovered services, deduplicated by id. Statically
/// configured services win on conflict.
pub fn merge_services(
    static_services: &[ServiceDescriptor],
    discovered: Vec<ServiceDescriptor>,
) -> Vec<ServiceDescriptor> {
    let mut merged: Vec<ServiceDescriptor> = static_services.to_vec();
    for service in discovered {
        if !merged.iter().any(|s| s.id() == service.id()) {
            merged.push(service);
        }
    }
    merged
}
