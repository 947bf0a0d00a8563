use crate::messages::{HostOptionUpdate, Protocol, ServiceDescriptor};
use crate::wol::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Control server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for hosts
    #[serde(default)]
    pub defaults: Defaults,

    /// Outbound notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Managed hosts, keyed by host name
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Bind address for proxy listeners and the control API (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the HTTP control API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the control API; unauthenticated when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
        }
    }
}

/// Timing defaults shared by all hosts. Individual hosts override only the
/// idle timeout, through their options.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Defaults {
    /// Idle period in seconds before an auto-stopped host is suspended
    #[serde(default = "default_max_alive_time")]
    pub max_alive_time_secs: u64,

    /// Period of the liveness/idle tick in milliseconds
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,

    /// Period of the service discovery refresh in seconds
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Hard bound on how long a proxy worker (or the control API) waits for
    /// a host start, in seconds
    #[serde(default = "default_host_start_timeout")]
    pub host_start_timeout_secs: u64,

    /// Execution timeout for the remote suspend command in milliseconds
    #[serde(default = "default_suspend_timeout")]
    pub suspend_timeout_ms: u64,

    /// SSH connection timeout for the suspend command in seconds
    #[serde(default = "default_suspend_connect_timeout")]
    pub suspend_connect_timeout_secs: u64,

    /// Grace period granted to a disposed worker before it is aborted,
    /// in milliseconds
    #[serde(default = "default_dispose_grace")]
    pub dispose_grace_ms: u64,

    /// Timeout of a single reachability probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Delay before a crashed worker is respawned, in milliseconds
    #[serde(default = "default_respawn_delay")]
    pub respawn_delay_ms: u64,

    /// Optional ceiling on the start-attempt probe loop in seconds.
    /// Unset means the loop polls until the process shuts down, since a
    /// host wake can legitimately take minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_start_poll_secs: Option<u64>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_alive_time_secs: default_max_alive_time(),
            status_poll_interval_ms: default_status_poll_interval(),
            discovery_interval_secs: default_discovery_interval(),
            host_start_timeout_secs: default_host_start_timeout(),
            suspend_timeout_ms: default_suspend_timeout(),
            suspend_connect_timeout_secs: default_suspend_connect_timeout(),
            dispose_grace_ms: default_dispose_grace(),
            probe_timeout_ms: default_probe_timeout(),
            respawn_delay_ms: default_respawn_delay(),
            max_start_poll_secs: None,
        }
    }
}

impl Defaults {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn host_start_timeout(&self) -> Duration {
        Duration::from_secs(self.host_start_timeout_secs)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    pub fn suspend_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.suspend_connect_timeout_secs)
    }

    pub fn dispose_grace(&self) -> Duration {
        Duration::from_millis(self.dispose_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    pub fn max_start_poll(&self) -> Option<Duration> {
        self.max_start_poll_secs.map(Duration::from_secs)
    }
}

/// Outbound notification settings
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NotificationConfig {
    /// Webhook URL events are POSTed to; notifications are disabled when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Identity and credentials for one physical host
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    /// Network address of the host
    pub address: IpAddr,

    /// Hardware address the wake packet is built from
    pub mac: MacAddr,

    /// SSH user the suspend command runs as
    pub username: String,

    /// SSH password; prefer `key_file` where possible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// SSH identity file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Remote command executed to suspend the host
    #[serde(default = "default_suspend_command")]
    pub suspend_command: String,

    /// Docker daemon port for label discovery; discovery is static-only
    /// when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_port: Option<u16>,

    /// Statically declared services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub options: HostOptions,
}

impl HostConfig {
    /// Descriptors for the statically declared services
    pub fn static_services(&self) -> Vec<ServiceDescriptor> {
        self.services.iter().map(ServiceConfig::to_descriptor).collect()
    }
}

/// Per-host runtime options, mutable through the control API
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostOptions {
    /// Idle period override in seconds; falls back to the global default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_alive_time_secs: Option<u64>,

    /// Suspend the host when the idle period elapses
    #[serde(default = "default_auto_stop")]
    pub auto_stop: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            max_alive_time_secs: None,
            auto_stop: default_auto_stop(),
        }
    }
}

impl HostOptions {
    pub fn max_alive_time(&self, defaults: &Defaults) -> Duration {
        Duration::from_secs(self.max_alive_time_secs.unwrap_or(defaults.max_alive_time_secs))
    }

    pub fn apply(&mut self, update: HostOptionUpdate) {
        match update {
            HostOptionUpdate::MaxAliveTime(secs) => self.max_alive_time_secs = Some(secs),
            HostOptionUpdate::AutoStop(enabled) => self.auto_stop = enabled,
        }
    }
}

/// One statically configured service
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default)]
    pub protocol: Protocol,

    /// Externally exposed port
    pub proxy_port: u16,

    /// Backend port on the host; defaults to the proxy port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
}

impl ServiceConfig {
    pub fn to_descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(self.name.clone(), self.protocol, self.proxy_port, self.backend_port)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration, used after option updates
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, host) in &self.hosts {
            if host.username.is_empty() {
                errors.push(format!("host '{}': username must not be empty", name));
            }
            let mut seen_ports = std::collections::HashSet::new();
            for service in &host.services {
                if service.proxy_port == 0 {
                    errors.push(format!(
                        "host '{}', service '{}': proxy_port must not be 0",
                        name, service.name
                    ));
                }
                if !seen_ports.insert(service.proxy_port) {
                    errors.push(format!(
                        "host '{}': duplicate proxy_port {}",
                        name, service.proxy_port
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8099
}

fn default_max_alive_time() -> u64 {
    900
}

fn default_status_poll_interval() -> u64 {
    1000
}

fn default_discovery_interval() -> u64 {
    30
}

fn default_host_start_timeout() -> u64 {
    10
}

fn default_suspend_timeout() -> u64 {
    1500
}

fn default_suspend_connect_timeout() -> u64 {
    1
}

fn default_dispose_grace() -> u64 {
    1500
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_respawn_delay() -> u64 {
    500
}

fn default_ssh_port() -> u16 {
    22
}

fn default_suspend_command() -> String {
    "sudo systemctl suspend".to_string()
}

fn default_auto_stop() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
bind = "127.0.0.1"
admin_port = 9090

[defaults]
max_alive_time_secs = 600
discovery_interval_secs = 15

[notifications]
webhook_url = "http://127.0.0.1:9999/hook"

[hosts.nas]
address = "192.168.1.50"
mac = "aa:bb:cc:dd:ee:ff"
username = "admin"
key_file = "/etc/wakegate/id_ed25519"
docker_port = 2375

[[hosts.nas.services]]
name = "minecraft"
proxy_port = 8080
backend_port = 25565

[[hosts.nas.services]]
name = "jellyfin"
proxy_port = 8096

[hosts.nas.options]
max_alive_time_secs = 300
auto_stop = true
"#;

    #[test]
    fn test_full_config_parsing() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.admin_port, 9090);
        assert_eq!(config.defaults.max_alive_time_secs, 600);
        assert_eq!(config.defaults.discovery_interval(), Duration::from_secs(15));

        let nas = config.hosts.get("nas").unwrap();
        assert_eq!(nas.address.to_string(), "192.168.1.50");
        assert_eq!(nas.mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(nas.ssh_port, 22);
        assert_eq!(nas.suspend_command, "sudo systemctl suspend");
        assert_eq!(nas.services.len(), 2);
        assert_eq!(nas.services[0].to_descriptor().id(), "minecraft-8080:25565");
        assert_eq!(nas.services[1].to_descriptor().id(), "jellyfin-8096:8096");
    }

    #[test]
    fn test_option_fallback_and_update() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let defaults = &config.defaults;
        let mut options = config.hosts.get("nas").unwrap().options.clone();

        assert_eq!(options.max_alive_time(defaults), Duration::from_secs(300));

        options.apply(HostOptionUpdate::MaxAliveTime(120));
        options.apply(HostOptionUpdate::AutoStop(false));
        assert_eq!(options.max_alive_time(defaults), Duration::from_secs(120));
        assert!(!options.auto_stop);

        let fallback = HostOptions::default();
        assert_eq!(fallback.max_alive_time(defaults), Duration::from_secs(600));
        assert!(fallback.auto_stop);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 8099);
        assert_eq!(config.defaults.host_start_timeout(), Duration::from_secs(10));
        assert_eq!(config.defaults.suspend_timeout(), Duration::from_millis(1500));
        assert_eq!(config.defaults.max_start_poll(), None);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_validation_rejects_duplicate_proxy_ports() {
        let toml = r#"
[hosts.nas]
address = "192.168.1.50"
mac = "aa:bb:cc:dd:ee:ff"
username = "admin"

[[hosts.nas.services]]
name = "a"
proxy_port = 8080

[[hosts.nas.services]]
name = "b"
proxy_port = 8080
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();

        assert_eq!(
            reloaded.hosts.get("nas").unwrap().options.max_alive_time_secs,
            Some(300)
        );
        assert_eq!(reloaded.notifications.webhook_url.as_deref(), Some("http://127.0.0.1:9999/hook"));
    }
}
