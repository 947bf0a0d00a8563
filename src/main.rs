use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::admin::{AdminServer, PKG_NAME, VERSION};
use wakegate::config::Config;
use wakegate::control::SystemControlPort;
use wakegate::notify::Notifier;
use wakegate::supervisor::FleetSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire up the control port: probe, wake, suspend, discovery, notify
    let notifier = Notifier::new(config.notifications.webhook_url.clone());
    let control = Arc::new(SystemControlPort::new(
        config.defaults.probe_timeout(),
        config.defaults.suspend_timeout(),
        config.defaults.suspend_connect_timeout(),
        notifier,
    ));

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.admin_port, error = %e, "Invalid control API bind address");
            anyhow::anyhow!("Invalid control API bind address: {}", e)
        })?;
    let admin_token = config.server.admin_token.clone();

    // One controller per host
    let supervisor = Arc::new(FleetSupervisor::new(
        config,
        config_path,
        control,
        shutdown_rx.clone(),
    ));

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&supervisor),
        shutdown_rx.clone(),
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown, then drain the control server and the controllers
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), admin_handle).await;

    match Arc::try_unwrap(supervisor) {
        Ok(supervisor) => supervisor.join(Duration::from_secs(5)).await,
        Err(_) => {
            // an in-flight admin request still holds a reference; the
            // controllers drain on their own shutdown signal regardless
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting wake-on-demand proxy");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        max_alive_time_secs = config.defaults.max_alive_time_secs,
        status_poll_interval_ms = config.defaults.status_poll_interval_ms,
        discovery_interval_secs = config.defaults.discovery_interval_secs,
        host_start_timeout_secs = config.defaults.host_start_timeout_secs,
        "Lifecycle defaults"
    );
    info!(
        suspend_timeout_ms = config.defaults.suspend_timeout_ms,
        dispose_grace_ms = config.defaults.dispose_grace_ms,
        probe_timeout_ms = config.defaults.probe_timeout_ms,
        "Timeout settings"
    );
    info!(
        host_count = config.hosts.len(),
        hosts = ?config.hosts.keys().collect::<Vec<_>>(),
        "Configured hosts"
    );
    for (name, host) in &config.hosts {
        info!(
            host = %name,
            address = %host.address,
            mac = %host.mac,
            docker_discovery = host.docker_port.is_some(),
            static_services = host.services.len(),
            auto_stop = host.options.auto_stop,
            "Host configured"
        );
    }
}
