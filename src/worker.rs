//! Per-service proxy worker
//!
//! One worker owns one service's listening socket for its whole lifetime
//! and runs as its own task, so a fault while handling one service's
//! clients cannot take down its siblings or the host controller. Client
//! connections get their own child tasks; the worker fans controller
//! messages out to them through a watch (host lifecycle) and a broadcast
//! (destroy signal).

use crate::messages::{HostCommand, ServiceDescriptor, WorkerExit, WorkerMsg, WorkerStats};
use crate::relay::{self, ClientConn, ConnEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct ProxyWorker {
    pub host: String,
    pub descriptor: ServiceDescriptor,
    /// Local address the listener binds to
    pub bind: String,
    /// Where the service lives once the host is up
    pub backend: SocketAddr,
    /// Hard bound each connection waits for a host start
    pub start_timeout: Duration,
    pub controller_tx: mpsc::Sender<HostCommand>,
    /// The worker's own ordered message channel
    pub rx: mpsc::Receiver<WorkerMsg>,
    /// Host lifecycle as of spawn time
    pub host_started: bool,
    /// Set when this worker replaces a crashed one
    pub restart_delay: Option<Duration>,
}

impl ProxyWorker {
    /// Run until disposed. The return value tells the controller whether
    /// this exit was deliberate.
    pub async fn run(mut self) -> (String, WorkerExit) {
        let id = self.descriptor.id();

        if let Some(delay) = self.restart_delay {
            tokio::time::sleep(delay).await;
        }

        let addr = format!("{}:{}", self.bind, self.descriptor.proxy_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(service = %id, addr = %addr, error = %e, "Failed to bind proxy listener");
                return (id, WorkerExit::ListenerFailed);
            }
        };
        info!(host = %self.host, service = %id, addr = %addr, "Proxy worker listening");

        let (host_up_tx, host_up_rx) = watch::channel(self.host_started);
        let (destroy_tx, _) = broadcast::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel::<ConnEvent>(64);

        // connection table: key -> upstream connected
        let mut connections: HashMap<String, bool> = HashMap::new();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let key = peer.to_string();
                        debug!(service = %id, key = %key, "Accepted client connection");
                        connections.insert(key.clone(), false);
                        tasks.spawn(relay::handle_client(ClientConn {
                            key,
                            service: id.clone(),
                            stream,
                            backend: self.backend,
                            host_up: host_up_rx.clone(),
                            destroy: destroy_tx.subscribe(),
                            controller_tx: self.controller_tx.clone(),
                            start_timeout: self.start_timeout,
                            events: event_tx.clone(),
                        }));
                    }
                    Err(e) => {
                        warn!(service = %id, error = %e, "Accept failed");
                    }
                },
                msg = self.rx.recv() => match msg {
                    Some(WorkerMsg::HostStatus { started }) => {
                        debug!(service = %id, started, "Host status update");
                        host_up_tx.send_replace(started);
                        if !started {
                            let _ = destroy_tx.send(());
                        }
                    }
                    Some(WorkerMsg::DestroySockets) => {
                        debug!(service = %id, "Destroying upstream sockets");
                        let _ = destroy_tx.send(());
                    }
                    Some(WorkerMsg::Stats { reply }) => {
                        let relaying = connections.values().filter(|connected| **connected).count();
                        let _ = reply.send(WorkerStats {
                            connections: connections.len(),
                            relaying,
                        });
                    }
                    // a vanished controller is equivalent to disposal
                    Some(WorkerMsg::Dispose) | None => break,
                },
                Some(event) = event_rx.recv() => match event {
                    ConnEvent::Connected { key } => {
                        if let Some(connected) = connections.get_mut(&key) {
                            *connected = true;
                        }
                    }
                    ConnEvent::Closed { key } => {
                        connections.remove(&key);
                    }
                },
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(service = %id, error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        // Dispose: stop accepting, tear down every context, release the port
        drop(listener);
        let _ = destroy_tx.send(());
        tasks.shutdown().await;
        info!(host = %self.host, service = %id, "Proxy worker disposed");

        (id, WorkerExit::Disposed)
    }
}
