//! Host lifecycle controller
//!
//! One controller task per physical host. It owns the host's state machine
//! (`Stopped -> Starting -> Started -> Stopping -> Stopped`), the idle
//! timer, periodic liveness probing, the periodic service-list refresh and
//! the supervision of the host's proxy workers. Nothing outside the
//! controller mutates any of this; everything arrives as a [`HostCommand`]
//! on the controller's channel, including the completions of its own wake
//! and suspend attempt tasks.

use crate::config::{Defaults, HostConfig, HostOptions};
use crate::control::ControlPort;
use crate::error::ControlError;
use crate::messages::{
    HostCommand, HostEvent, HostOptionUpdate, HostState, Protocol, ServiceDescriptor, WorkerExit,
    WorkerMsg,
};
use crate::remote::SuspendTarget;
use crate::worker::ProxyWorker;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Extra slack granted to the suspend call beyond the command's own
/// execution timeout
const SUSPEND_GRACE: Duration = Duration::from_millis(500);

/// Command channel depth per controller and per worker
const CHANNEL_DEPTH: usize = 32;

/// Cloneable entry point to a running controller
#[derive(Clone)]
pub struct HostHandle {
    name: String,
    tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensure the host is started, waking it if necessary. Bounded by
    /// `timeout`; a `false` does not cancel the in-flight attempt.
    pub async fn ensure_started(&self, origin: Option<String>, timeout: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(HostCommand::EnsureStarted {
                origin,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(started)) => started,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(host = %self.name, timeout_secs = timeout.as_secs(), "Host start wait timed out");
                false
            }
        }
    }

    /// Suspend the host, resolving once it stops answering probes
    pub async fn stop(&self) -> Result<(), ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Stop { reply: reply_tx })
            .await
            .map_err(|_| ControlError::Suspend("host controller is gone".to_string()))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ControlError::Suspend("host controller is gone".to_string())))
    }

    pub async fn status(&self) -> Option<HostState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Status { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn list_services(&self) -> Option<Vec<ServiceDescriptor>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::ListServices { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn update_option(&self, update: HostOptionUpdate) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(HostCommand::UpdateOption {
                update,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.is_ok()
    }
}

/// One supervised proxy worker
struct WorkerHandle {
    descriptor: ServiceDescriptor,
    tx: mpsc::Sender<WorkerMsg>,
    abort: AbortHandle,
    /// Deliberately shutting down; exits are expected and final
    disposing: bool,
}

pub struct HostController {
    name: String,
    config: HostConfig,
    /// Working copy; the persisted copy lives with the supervisor
    options: HostOptions,
    bind: String,
    defaults: Defaults,
    control: Arc<dyn ControlPort>,

    state: HostState,
    /// State to restore when a suspend attempt fails
    revert_state: HostState,
    last_packet: Instant,

    start_waiters: Vec<oneshot::Sender<bool>>,
    stop_waiters: Vec<oneshot::Sender<Result<(), ControlError>>>,
    start_attempt: Option<JoinHandle<()>>,

    workers: HashMap<String, WorkerHandle>,
    task_index: HashMap<tokio::task::Id, String>,
    worker_tasks: JoinSet<(String, WorkerExit)>,
    known_services: Vec<ServiceDescriptor>,
    skipped_udp: HashSet<String>,

    tx: mpsc::Sender<HostCommand>,
    rx: mpsc::Receiver<HostCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HostController {
    /// Spawn the controller task for one host
    pub fn spawn(
        name: String,
        config: HostConfig,
        bind: String,
        defaults: Defaults,
        control: Arc<dyn ControlPort>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (HostHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let handle = HostHandle {
            name: name.clone(),
            tx: tx.clone(),
        };

        let controller = Self {
            options: config.options.clone(),
            name,
            config,
            bind,
            defaults,
            control,
            state: HostState::Stopped,
            revert_state: HostState::Stopped,
            last_packet: Instant::now(),
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            start_attempt: None,
            workers: HashMap::new(),
            task_index: HashMap::new(),
            worker_tasks: JoinSet::new(),
            known_services: Vec::new(),
            skipped_udp: HashSet::new(),
            tx,
            rx,
            shutdown_rx,
        };

        let task = tokio::spawn(controller.run());
        (handle, task)
    }

    async fn run(mut self) {
        info!(host = %self.name, address = %self.config.address, "Host controller started");

        let mut status_tick = tokio::time::interval(self.defaults.status_poll_interval());
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery_tick = tokio::time::interval(self.defaults.discovery_interval());
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(cmd) = self.rx.recv() => self.handle_command(cmd),
                _ = status_tick.tick() => self.on_status_tick().await,
                _ = discovery_tick.tick() => self.refresh_services().await,
                Some(finished) = self.worker_tasks.join_next_with_id(), if !self.worker_tasks.is_empty() => {
                    self.on_worker_exit(finished);
                }
                changed = self.shutdown_rx.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    fn handle_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::EnsureStarted { origin, reply } => match self.state {
                HostState::Started => {
                    let _ = reply.send(true);
                }
                HostState::Starting => self.start_waiters.push(reply),
                HostState::Stopping => {
                    debug!(host = %self.name, "Start requested while stopping; refusing");
                    let _ = reply.send(false);
                }
                HostState::Stopped => {
                    self.start_waiters.push(reply);
                    self.begin_start(origin);
                }
            },
            HostCommand::Stop { reply } => match self.state {
                HostState::Stopped => {
                    let _ = reply.send(Ok(()));
                }
                HostState::Stopping => self.stop_waiters.push(reply),
                HostState::Started | HostState::Starting => {
                    self.stop_waiters.push(reply);
                    self.begin_stop();
                }
            },
            HostCommand::Status { reply } => {
                let _ = reply.send(self.state);
            }
            HostCommand::RecordActivity => {
                self.last_packet = Instant::now();
            }
            HostCommand::ListServices { reply } => {
                let _ = reply.send(self.known_services.clone());
            }
            HostCommand::UpdateOption { update, reply } => {
                info!(host = %self.name, ?update, "Applying option update");
                self.options.apply(update);
                let _ = reply.send(());
            }
            HostCommand::StartFinished { ok } => self.on_start_finished(ok),
            HostCommand::StopFinished { result } => self.on_stop_finished(result),
        }
    }

    fn set_state(&mut self, next: HostState) {
        if self.state != next {
            debug!(host = %self.name, from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    /// Begin the single wake attempt for the current Starting window
    fn begin_start(&mut self, origin: Option<String>) {
        info!(host = %self.name, origin = origin.as_deref(), "Waking host");
        self.set_state(HostState::Starting);
        self.notify(HostEvent::HostStarting {
            host: self.name.clone(),
            origin,
        });

        let control = Arc::clone(&self.control);
        let tx = self.tx.clone();
        let name = self.name.clone();
        let mac = self.config.mac;
        let addr = self.config.address;
        let poll = self.defaults.status_poll_interval();
        let ceiling = self.defaults.max_start_poll();
        let mut shutdown_rx = self.shutdown_rx.clone();

        self.start_attempt = Some(tokio::spawn(async move {
            if let Err(e) = control.wake(&mac).await {
                // the probe loop below is the only retry the wake gets
                warn!(host = %name, error = %e, "Wake packet send failed");
            }

            let begun = Instant::now();
            let ok = loop {
                if control.probe_alive(addr).await {
                    break true;
                }
                if let Some(limit) = ceiling {
                    if begun.elapsed() >= limit {
                        warn!(host = %name, limit_secs = limit.as_secs(), "Start attempt reached poll ceiling");
                        break false;
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            };

            let _ = tx.send(HostCommand::StartFinished { ok }).await;
        }));
    }

    fn on_start_finished(&mut self, ok: bool) {
        if self.state != HostState::Starting {
            // stale completion from an attempt a stop already aborted
            return;
        }
        self.start_attempt = None;

        if ok {
            info!(host = %self.name, "Host started");
            self.last_packet = Instant::now();
            self.set_state(HostState::Started);
            self.broadcast_status(true);
        } else {
            warn!(host = %self.name, "Host did not start");
            self.set_state(HostState::Stopped);
        }

        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(ok);
        }
    }

    /// Begin the single suspend attempt for the current Stopping window
    fn begin_stop(&mut self) {
        if self.state == HostState::Starting {
            if let Some(attempt) = self.start_attempt.take() {
                attempt.abort();
            }
            for waiter in self.start_waiters.drain(..) {
                let _ = waiter.send(false);
            }
            // the start was cancelled, so a failed suspend lands on Stopped
            self.revert_state = HostState::Stopped;
        } else {
            self.revert_state = self.state;
        }

        info!(host = %self.name, "Suspending host");
        self.set_state(HostState::Stopping);
        self.notify(HostEvent::HostStopping {
            host: self.name.clone(),
        });

        let control = Arc::clone(&self.control);
        let tx = self.tx.clone();
        let addr = self.config.address;
        let poll = self.defaults.status_poll_interval();
        let suspend_deadline = self.defaults.suspend_timeout() + SUSPEND_GRACE;
        let target = SuspendTarget {
            addr,
            ssh_port: self.config.ssh_port,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            key_file: self.config.key_file.clone(),
            command: self.config.suspend_command.clone(),
        };
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(suspend_deadline, control.suspend(&target)).await
            {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ControlError::CommandTimeout(suspend_deadline)),
            };

            if let Err(e) = result {
                let _ = tx.send(HostCommand::StopFinished { result: Err(e) }).await;
                return;
            }

            // the suspend took; wait until the host stops answering
            loop {
                if !control.probe_alive(addr).await {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }

            let _ = tx.send(HostCommand::StopFinished { result: Ok(()) }).await;
        });
    }

    fn on_stop_finished(&mut self, result: Result<(), ControlError>) {
        if self.state != HostState::Stopping {
            return;
        }

        match &result {
            Ok(()) => {
                info!(host = %self.name, "Host stopped");
                self.set_state(HostState::Stopped);
                self.broadcast_status(false);
                self.broadcast_destroy();
            }
            Err(e) => {
                error!(host = %self.name, error = %e, "Suspend failed; reverting state");
                let revert = self.revert_state;
                self.set_state(revert);
            }
        }

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    async fn on_status_tick(&mut self) {
        match self.state {
            HostState::Started | HostState::Stopped => {
                let alive = self.control.probe_alive(self.config.address).await;
                if alive && self.state == HostState::Stopped {
                    info!(host = %self.name, "Host answered a probe; marking started");
                    self.last_packet = Instant::now();
                    self.set_state(HostState::Started);
                    self.broadcast_status(true);
                } else if !alive && self.state == HostState::Started {
                    warn!(host = %self.name, "Host stopped answering probes");
                    self.set_state(HostState::Stopped);
                    self.broadcast_status(false);
                }
            }
            // the in-flight attempt owns the polling
            HostState::Starting | HostState::Stopping => {}
        }

        if self.state == HostState::Started && self.options.auto_stop {
            let idle = self.last_packet.elapsed();
            let limit = self.options.max_alive_time(&self.defaults);
            if idle >= limit {
                info!(host = %self.name, idle_secs = idle.as_secs(), "Idle limit reached; auto-stopping");
                self.begin_stop();
            }
        }
    }

    /// Re-run discovery and reconcile the worker set against it
    async fn refresh_services(&mut self) {
        let static_services = self.config.static_services();
        let services = match self
            .control
            .discover_services(self.config.address, self.config.docker_port, &static_services)
            .await
        {
            Ok(services) => services,
            Err(e) => {
                debug!(host = %self.name, error = %e, "Service discovery failed; keeping previous set");
                if self.known_services.is_empty() {
                    static_services
                } else {
                    return;
                }
            }
        };

        let mut desired: HashMap<String, ServiceDescriptor> = HashMap::new();
        for service in &services {
            match service.protocol {
                Protocol::Tcp => {
                    desired.insert(service.id(), service.clone());
                }
                Protocol::Udp => {
                    if self.skipped_udp.insert(service.id()) {
                        warn!(host = %self.name, service = %service.id(), "UDP proxying is not implemented; skipping service");
                    }
                }
            }
        }

        for (id, descriptor) in &desired {
            if !self.workers.contains_key(id) {
                self.spawn_worker(descriptor.clone(), None);
            }
        }

        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|(id, handle)| !handle.disposing && !desired.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            self.dispose_worker(&id);
        }

        self.known_services = services;
    }

    fn spawn_worker(&mut self, descriptor: ServiceDescriptor, restart_delay: Option<Duration>) {
        let id = descriptor.id();
        let (worker_tx, worker_rx) = mpsc::channel(CHANNEL_DEPTH);

        let worker = ProxyWorker {
            host: self.name.clone(),
            descriptor: descriptor.clone(),
            bind: self.bind.clone(),
            backend: SocketAddr::new(self.config.address, descriptor.backend_port),
            start_timeout: self.defaults.host_start_timeout(),
            controller_tx: self.tx.clone(),
            rx: worker_rx,
            host_started: self.state.is_started(),
            restart_delay,
        };

        let abort = self.worker_tasks.spawn(worker.run());
        self.task_index.insert(abort.id(), id.clone());
        self.workers.insert(
            id.clone(),
            WorkerHandle {
                descriptor,
                tx: worker_tx,
                abort,
                disposing: false,
            },
        );
        info!(host = %self.name, service = %id, "Spawned proxy worker");
    }

    /// Ask a worker to shut down; force-terminate it after the grace period
    fn dispose_worker(&mut self, id: &str) {
        let Some(handle) = self.workers.get_mut(id) else {
            return;
        };
        info!(host = %self.name, service = %id, "Disposing proxy worker");
        handle.disposing = true;
        let _ = handle.tx.try_send(WorkerMsg::Dispose);

        let abort = handle.abort.clone();
        let grace = self.defaults.dispose_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // no-op if the worker already exited
            abort.abort();
        });
    }

    fn on_worker_exit(&mut self, finished: Result<(tokio::task::Id, (String, WorkerExit)), JoinError>) {
        match finished {
            Ok((task_id, (service_id, exit))) => {
                self.task_index.remove(&task_id);
                let disposing = self
                    .workers
                    .remove(&service_id)
                    .map(|handle| handle.disposing)
                    .unwrap_or(true);

                if disposing || exit == WorkerExit::Disposed {
                    debug!(host = %self.name, service = %service_id, "Worker shut down");
                } else {
                    self.maybe_respawn(&service_id, "exited");
                }
            }
            Err(join_err) => {
                let Some(service_id) = self.task_index.remove(&join_err.id()) else {
                    return;
                };
                let disposing = self
                    .workers
                    .remove(&service_id)
                    .map(|handle| handle.disposing)
                    .unwrap_or(true);

                if join_err.is_cancelled() || disposing {
                    debug!(host = %self.name, service = %service_id, "Worker force-terminated");
                } else {
                    error!(host = %self.name, service = %service_id, error = %join_err, "Worker crashed");
                    self.maybe_respawn(&service_id, "crashed");
                }
            }
        }
    }

    fn maybe_respawn(&mut self, service_id: &str, reason: &str) {
        let descriptor = self
            .known_services
            .iter()
            .find(|s| s.id() == service_id && s.protocol == Protocol::Tcp)
            .cloned();
        match descriptor {
            Some(descriptor) => {
                warn!(host = %self.name, service = %service_id, reason, "Worker exited unexpectedly; respawning");
                self.spawn_worker(descriptor, Some(self.defaults.respawn_delay()));
            }
            None => {
                debug!(host = %self.name, service = %service_id, "Not respawning worker for unconfigured service");
            }
        }
    }

    fn broadcast_status(&self, started: bool) {
        for handle in self.workers.values() {
            if handle.disposing {
                continue;
            }
            if handle.tx.try_send(WorkerMsg::HostStatus { started }).is_err() {
                // a wedged worker must not stall the controller
                warn!(host = %self.name, service = %handle.descriptor.id(), "Worker is not draining its queue");
            }
        }
    }

    fn broadcast_destroy(&self) {
        for handle in self.workers.values() {
            if handle.disposing {
                continue;
            }
            if handle.tx.try_send(WorkerMsg::DestroySockets).is_err() {
                warn!(host = %self.name, service = %handle.descriptor.id(), "Worker is not draining its queue");
            }
        }
    }

    fn notify(&self, event: HostEvent) {
        let control = Arc::clone(&self.control);
        tokio::spawn(async move {
            control.notify(event).await;
        });
    }

    /// Graceful shutdown: fail pending waiters, dispose every worker
    async fn drain(mut self) {
        if let Some(attempt) = self.start_attempt.take() {
            attempt.abort();
        }
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(false);
        }
        self.stop_waiters.clear();

        let ids: Vec<String> = self.workers.keys().cloned().collect();
        for id in ids {
            if let Some(handle) = self.workers.get_mut(&id) {
                handle.disposing = true;
                let _ = handle.tx.try_send(WorkerMsg::Dispose);
            }
        }

        let grace = self.defaults.dispose_grace();
        let _ = tokio::time::timeout(grace, async {
            while self.worker_tasks.join_next().await.is_some() {}
        })
        .await;
        self.worker_tasks.shutdown().await;

        info!(host = %self.name, "Host controller stopped");
    }
}
