//! Integration tests for wakegate
//!
//! Each test runs a real host controller (and workers) against loopback
//! sockets and a scripted control port, so wake/suspend/discovery behavior
//! is observable without a physical host.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use wakegate::admin::AdminServer;
use wakegate::config::{
    Config, Defaults, HostConfig, HostOptions, NotificationConfig, ServerConfig, ServiceConfig,
};
use wakegate::control::ControlPort;
use wakegate::controller::{HostController, HostHandle};
use wakegate::discovery;
use wakegate::error::ControlError;
use wakegate::messages::{
    HostCommand, HostEvent, HostState, Protocol, ServiceDescriptor, WorkerMsg, WorkerStats,
};
use wakegate::remote::SuspendTarget;
use wakegate::supervisor::FleetSupervisor;
use wakegate::wol::MacAddr;
use wakegate::worker::ProxyWorker;

// ============================================================================
// Scripted control port
// ============================================================================

/// Control port whose probe/wake/suspend behavior is driven by the test
struct MockControlPort {
    alive: AtomicBool,
    wake_calls: AtomicUsize,
    suspend_calls: AtomicUsize,
    suspend_ok: AtomicBool,
    discovered: Mutex<Vec<ServiceDescriptor>>,
}

impl MockControlPort {
    fn new(alive: bool) -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(alive),
            wake_calls: AtomicUsize::new(0),
            suspend_calls: AtomicUsize::new(0),
            suspend_ok: AtomicBool::new(true),
            discovered: Mutex::new(Vec::new()),
        })
    }

    fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn wake_calls(&self) -> usize {
        self.wake_calls.load(Ordering::SeqCst)
    }

    fn suspend_calls(&self) -> usize {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    fn set_discovered(&self, services: Vec<ServiceDescriptor>) {
        *self.discovered.lock().unwrap() = services;
    }
}

#[async_trait]
impl ControlPort for MockControlPort {
    async fn probe_alive(&self, _addr: std::net::IpAddr) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn wake(&self, _mac: &MacAddr) -> Result<(), ControlError> {
        self.wake_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn suspend(&self, _target: &SuspendTarget) -> Result<String, ControlError> {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        if self.suspend_ok.load(Ordering::SeqCst) {
            // a successful suspend powers the host off
            self.alive.store(false, Ordering::SeqCst);
            Ok(String::new())
        } else {
            Err(ControlError::Suspend("refused".to_string()))
        }
    }

    async fn discover_services(
        &self,
        _addr: std::net::IpAddr,
        _docker_port: Option<u16>,
        static_services: &[ServiceDescriptor],
    ) -> Result<Vec<ServiceDescriptor>, ControlError> {
        let discovered = self.discovered.lock().unwrap().clone();
        Ok(discovery::merge_services(static_services, discovered))
    }

    async fn notify(&self, _event: HostEvent) {}
}

// ============================================================================
// Helpers
// ============================================================================

/// Short intervals so lifecycle transitions land within test timeouts
fn fast_defaults() -> Defaults {
    Defaults {
        max_alive_time_secs: 900,
        status_poll_interval_ms: 50,
        discovery_interval_secs: 1,
        host_start_timeout_secs: 1,
        suspend_timeout_ms: 300,
        suspend_connect_timeout_secs: 1,
        dispose_grace_ms: 300,
        probe_timeout_ms: 100,
        respawn_delay_ms: 50,
        max_start_poll_secs: None,
    }
}

fn tcp_service(name: &str, proxy_port: u16, backend_port: u16) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        protocol: Protocol::Tcp,
        proxy_port,
        backend_port: Some(backend_port),
    }
}

fn host_config(services: Vec<ServiceConfig>, options: HostOptions) -> HostConfig {
    HostConfig {
        address: "127.0.0.1".parse().unwrap(),
        mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        username: "admin".to_string(),
        password: None,
        key_file: None,
        ssh_port: 22,
        suspend_command: "sudo systemctl suspend".to_string(),
        docker_port: None,
        services,
        options,
    }
}

fn spawn_host(
    config: HostConfig,
    control: Arc<MockControlPort>,
) -> (HostHandle, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, _task) = HostController::spawn(
        "testhost".to_string(),
        config,
        "127.0.0.1".to_string(),
        fast_defaults(),
        control,
        shutdown_rx,
    );
    (handle, shutdown_tx)
}

/// Wait for a port to become available (worker listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Wait until the controller reports the wanted state
async fn wait_for_state(handle: &HostHandle, wanted: HostState, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if handle.status().await == Some(wanted) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Accept one connection and forward everything it receives to the channel
fn capture_backend(listener: TcpListener, expected: usize) -> tokio::sync::oneshot::Receiver<Vec<u8>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut received = vec![0u8; expected];
        if stream.read_exact(&mut received).await.is_ok() {
            let _ = tx.send(received);
        }
    });
    rx
}

// ============================================================================
// Relay and wake behavior
// ============================================================================

#[tokio::test]
async fn test_buffered_bytes_flushed_in_order_after_wake() {
    let control = MockControlPort::new(false);
    let config = host_config(vec![tcp_service("web", 42001, 42002)], HostOptions::default());
    let (_handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    let backend = TcpListener::bind("127.0.0.1:42002").await.unwrap();
    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let captured = capture_backend(backend, request.len());

    assert!(wait_for_port(42001, Duration::from_secs(3)).await, "worker did not bind");

    let mut client = TcpStream::connect("127.0.0.1:42001").await.unwrap();
    client.write_all(request).await.unwrap();

    // the host is down: exactly one wake, nothing reaches the backend yet
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(control.wake_calls(), 1);

    control.set_alive(true);

    let received = tokio::time::timeout(Duration::from_secs(3), captured)
        .await
        .expect("backend never saw the buffered bytes")
        .unwrap();
    assert_eq!(received, request);
}

#[tokio::test]
async fn test_status_probe_never_wakes_stopped_host() {
    let control = MockControlPort::new(false);
    let config = host_config(vec![tcp_service("web", 42011, 42012)], HostOptions::default());
    let (_handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    assert!(wait_for_port(42011, Duration::from_secs(3)).await);

    let mut client = TcpStream::connect("127.0.0.1:42011").await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nstatus: true\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("probe response not terminated")
        .unwrap();

    assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");
    assert_eq!(control.wake_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_clients_share_one_wake() {
    let control = MockControlPort::new(false);
    let config = host_config(vec![tcp_service("game", 42021, 42022)], HostOptions::default());
    let (_handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    let backend = TcpListener::bind("127.0.0.1:42022").await.unwrap();
    let (payload_tx, mut payload_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(2);
    tokio::spawn(async move {
        for _ in 0..2 {
            let Ok((mut stream, _)) = backend.accept().await else {
                return;
            };
            let tx = payload_tx.clone();
            tokio::spawn(async move {
                let mut payload = vec![0u8; 9];
                if stream.read_exact(&mut payload).await.is_ok() {
                    let _ = tx.send(payload).await;
                }
            });
        }
    });

    assert!(wait_for_port(42021, Duration::from_secs(3)).await);

    // opaque (non-HTTP) first bytes also buffer and wake
    let mut first = TcpStream::connect("127.0.0.1:42021").await.unwrap();
    let mut second = TcpStream::connect("127.0.0.1:42021").await.unwrap();
    first.write_all(b"hello-one").await.unwrap();
    second.write_all(b"hello-two").await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(control.wake_calls(), 1, "concurrent starts must share one wake");

    control.set_alive(true);

    let mut payloads = Vec::new();
    for _ in 0..2 {
        let payload = tokio::time::timeout(Duration::from_secs(3), payload_rx.recv())
            .await
            .expect("client bytes never relayed")
            .unwrap();
        payloads.push(payload);
    }
    payloads.sort();
    assert_eq!(payloads, vec![b"hello-one".to_vec(), b"hello-two".to_vec()]);
}

#[tokio::test]
async fn test_host_start_timeout_abandons_client() {
    let control = MockControlPort::new(false);
    let config = host_config(vec![tcp_service("web", 42051, 42052)], HostOptions::default());
    let (_handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    assert!(wait_for_port(42051, Duration::from_secs(3)).await);

    let mut client = TcpStream::connect("127.0.0.1:42051").await.unwrap();
    client.write_all(b"data for a host that never wakes").await.unwrap();

    // the bounded wait (1s here) expires and the connection is abandoned
    let mut sink = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut sink))
        .await
        .expect("connection not released after the start timeout")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(control.wake_calls(), 1);
}

// ============================================================================
// Lifecycle: idle stop, suspend failure, upstream teardown
// ============================================================================

#[tokio::test]
async fn test_idle_host_is_auto_stopped() {
    let control = MockControlPort::new(true);
    let options = HostOptions {
        max_alive_time_secs: Some(0),
        auto_stop: true,
    };
    let (handle, _shutdown) = spawn_host(host_config(Vec::new(), options), Arc::clone(&control));

    let start = std::time::Instant::now();
    while control.suspend_calls() == 0 && start.elapsed() < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(control.suspend_calls(), 1, "idle host was not suspended");
    assert!(wait_for_state(&handle, HostState::Stopped, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_auto_stop_disabled_keeps_host_up() {
    let control = MockControlPort::new(true);
    let options = HostOptions {
        max_alive_time_secs: Some(0),
        auto_stop: false,
    };
    let (handle, _shutdown) = spawn_host(host_config(Vec::new(), options), Arc::clone(&control));

    assert!(wait_for_state(&handle, HostState::Started, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(control.suspend_calls(), 0);
    assert_eq!(handle.status().await, Some(HostState::Started));
}

#[tokio::test]
async fn test_suspend_failure_reverts_state() {
    let control = MockControlPort::new(true);
    control.suspend_ok.store(false, Ordering::SeqCst);
    let (handle, _shutdown) = spawn_host(host_config(Vec::new(), HostOptions::default()), Arc::clone(&control));

    assert!(wait_for_state(&handle, HostState::Started, Duration::from_secs(2)).await);

    let result = handle.stop().await;
    assert!(result.is_err(), "suspend failure must surface to the caller");
    assert_eq!(control.suspend_calls(), 1);

    // state reverted; no retry was issued
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status().await, Some(HostState::Started));
    assert_eq!(control.suspend_calls(), 1);
}

#[tokio::test]
async fn test_stop_destroys_upstream_sockets() {
    let control = MockControlPort::new(true);
    let config = host_config(vec![tcp_service("echo", 42031, 42032)], HostOptions::default());
    let (handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    // echo backend
    let backend = TcpListener::bind("127.0.0.1:42032").await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    assert!(wait_for_port(42031, Duration::from_secs(3)).await);
    assert!(wait_for_state(&handle, HostState::Started, Duration::from_secs(2)).await);

    let mut client = TcpStream::connect("127.0.0.1:42031").await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(3), client.read_exact(&mut echoed))
        .await
        .expect("relay did not establish")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    handle.stop().await.expect("stop failed");

    // the worker force-closed its upstream; close propagates to the client
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("client connection survived stopHost")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_worker_reports_zero_upstreams_after_destroy() {
    // drive a worker directly, with a controller stand-in that always
    // reports the host as started
    let (controller_tx, mut controller_rx) = tokio::sync::mpsc::channel(32);
    let (worker_tx, worker_rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(cmd) = controller_rx.recv().await {
            if let HostCommand::EnsureStarted { reply, .. } = cmd {
                let _ = reply.send(true);
            }
        }
    });

    let worker = ProxyWorker {
        host: "testhost".to_string(),
        descriptor: ServiceDescriptor::new("echo", Protocol::Tcp, 42071, Some(42072)),
        bind: "127.0.0.1".to_string(),
        backend: "127.0.0.1:42072".parse().unwrap(),
        start_timeout: Duration::from_secs(1),
        controller_tx,
        rx: worker_rx,
        host_started: true,
        restart_delay: None,
    };
    tokio::spawn(worker.run());

    // echo backend
    let backend = TcpListener::bind("127.0.0.1:42072").await.unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    assert!(wait_for_port(42071, Duration::from_secs(3)).await);

    let mut client = TcpStream::connect("127.0.0.1:42071").await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();

    let start = std::time::Instant::now();
    loop {
        let stats = query_stats(&worker_tx).await;
        if stats.relaying == 1 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "relaying context never showed up in the table"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    worker_tx.send(WorkerMsg::DestroySockets).await.unwrap();

    // the context drains out of the table once its upstream dies
    let start = std::time::Instant::now();
    loop {
        let stats = query_stats(&worker_tx).await;
        if stats.relaying == 0 && stats.connections == 0 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "upstream sockets survived the destroy signal"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    worker_tx.send(WorkerMsg::Dispose).await.unwrap();
}

async fn query_stats(worker_tx: &tokio::sync::mpsc::Sender<WorkerMsg>) -> WorkerStats {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    worker_tx
        .send(WorkerMsg::Stats { reply: reply_tx })
        .await
        .unwrap();
    reply_rx.await.unwrap()
}

// ============================================================================
// Discovery refresh
// ============================================================================

#[tokio::test]
async fn test_discovery_adds_and_removes_workers() {
    let control = MockControlPort::new(false);
    let (_handle, _shutdown) = spawn_host(host_config(Vec::new(), HostOptions::default()), Arc::clone(&control));

    // no services yet: nothing listens
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect("127.0.0.1:42041").await.is_err());

    control.set_discovered(vec![ServiceDescriptor::new(
        "found",
        Protocol::Tcp,
        42041,
        Some(42042),
    )]);
    assert!(
        wait_for_port(42041, Duration::from_secs(3)).await,
        "discovered service never got a worker"
    );

    // the service disappears: its worker is disposed and the port released
    control.set_discovered(Vec::new());
    let start = std::time::Instant::now();
    let mut released = false;
    while start.elapsed() < Duration::from_secs(4) {
        if TcpStream::connect("127.0.0.1:42041").await.is_err() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(released, "removed service still has a listening worker");
}

#[tokio::test]
async fn test_failed_worker_is_respawned() {
    let control = MockControlPort::new(false);
    let config = host_config(vec![tcp_service("web", 42081, 42082)], HostOptions::default());

    // occupy the proxy port so the worker's bind fails and the controller
    // keeps respawning it
    let occupier = TcpListener::bind("127.0.0.1:42081").await.unwrap();
    let (_handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    tokio::time::sleep(Duration::from_millis(400)).await;
    drop(occupier);

    assert!(
        wait_for_port(42081, Duration::from_secs(3)).await,
        "worker was not respawned after its listener failed"
    );
}

#[tokio::test]
async fn test_udp_services_are_skipped() {
    let control = MockControlPort::new(false);
    let config = host_config(
        vec![ServiceConfig {
            name: "dns".to_string(),
            protocol: Protocol::Udp,
            proxy_port: 42045,
            backend_port: None,
        }],
        HostOptions::default(),
    );
    let (handle, _shutdown) = spawn_host(config, Arc::clone(&control));

    tokio::time::sleep(Duration::from_millis(500)).await;
    // the descriptor is known but no worker listens for it
    let services = handle.list_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert!(TcpStream::connect("127.0.0.1:42045").await.is_err());
}

// ============================================================================
// Control API
// ============================================================================

async fn http_request(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_control_api_round_trip() {
    let control = MockControlPort::new(true);
    let mut config = Config {
        server: ServerConfig {
            bind: "127.0.0.1".to_string(),
            admin_port: 42061,
            admin_token: None,
        },
        defaults: fast_defaults(),
        notifications: NotificationConfig::default(),
        hosts: std::collections::HashMap::new(),
    };
    config
        .hosts
        .insert("nas".to_string(), host_config(Vec::new(), HostOptions::default()));

    let dir = tempfile::tempdir().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Arc::new(FleetSupervisor::new(
        config,
        dir.path().join("config.toml"),
        control,
        shutdown_rx.clone(),
    ));

    let admin = AdminServer::new(
        "127.0.0.1:42061".parse().unwrap(),
        Arc::clone(&supervisor),
        shutdown_rx,
        None,
    );
    tokio::spawn(admin.run());
    assert!(wait_for_port(42061, Duration::from_secs(3)).await);

    let health = http_request(
        42061,
        "GET /health HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(health.starts_with("HTTP/1.1 200"));

    let start = http_request(
        42061,
        "POST /hosts/nas/start HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(start.starts_with("HTTP/1.1 200"));
    assert!(start.contains(r#""started":true"#));

    let unknown = http_request(
        42061,
        "GET /hosts/basement HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(unknown.starts_with("HTTP/1.1 404"));

    let options = http_request(
        42061,
        "POST /hosts/nas/options HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: 36\r\nConnection: close\r\n\r\n{\"key\":\"max_alive_time\",\"value\":120}",
    )
    .await;
    assert!(options.starts_with("HTTP/1.1 200"), "got: {}", options);

    // the update was persisted
    let saved = Config::load(dir.path().join("config.toml")).unwrap();
    assert_eq!(
        saved.hosts.get("nas").unwrap().options.max_alive_time_secs,
        Some(120)
    );

    let _ = shutdown_tx.send(true);
}
