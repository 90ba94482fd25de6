//! Async driver of the election state machine.
//!
//! One task owns the [`ElectionMachine`] and feeds it beacons, the window
//! timer and the host heartbeat deadline. Side effects go through an
//! [`ElectionDriver`], so the same loop runs against real sockets in the
//! daemon and against an in-memory network in tests.

use super::machine::{ConnectTarget, ElectionAction, ElectionMachine, ElectionParams, Role};
use crate::discovery::BeaconEvent;
use crate::error::ElectionError;
use crate::telemetry::spans;
use async_trait::async_trait;
use meshsync_proto::PeerInfo;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Side effects of the election.
#[async_trait]
pub trait ElectionDriver: Send + Sync + 'static {
    /// Stop any previous listener and start a fresh one.
    async fn listen(&self) -> Result<broadcast::Receiver<BeaconEvent>, ElectionError>;
    async fn start_relay(&self) -> Result<(), ElectionError>;
    async fn stop_relay(&self);
    async fn start_beacon(&self);
    async fn stop_beacon(&self);
    async fn connect(&self, target: ConnectTarget) -> Result<(), ElectionError>;
    async fn disconnect(&self);
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub params: ElectionParams,
    /// Silence from the followed host after which it is presumed lost.
    pub host_timeout: Duration,
}

#[derive(Debug)]
enum Command {
    Restart,
}

/// Handle to the running election.
pub struct ElectionService {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    role: watch::Receiver<Role>,
    host: watch::Receiver<Option<PeerInfo>>,
}

impl std::fmt::Debug for ElectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionService")
            .field("role", &*self.role.borrow())
            .finish()
    }
}

impl ElectionService {
    /// Spawn the election task and run `startElection` right away.
    pub fn start(config: ElectionConfig, driver: Arc<dyn ElectionDriver>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (role_tx, role) = watch::channel(Role::Idle);
        let (host_tx, host) = watch::channel(None);
        let cancel = CancellationToken::new();
        let span = spans::election(&config.params.device_id);
        let runner = Runner {
            machine: ElectionMachine::new(config.params),
            driver,
            host_timeout: config.host_timeout,
            beacons: None,
            window: None,
            followed: None,
            last_heartbeat: Instant::now(),
            role_tx,
            host_tx,
        };
        let task = tokio::spawn(runner.run(command_rx, cancel.clone()).instrument(span));
        Self {
            commands,
            cancel,
            task: Mutex::new(Some(task)),
            role,
            host,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    pub fn role_updates(&self) -> watch::Receiver<Role> {
        self.role.clone()
    }

    /// Host being followed, when a client.
    pub fn current_host(&self) -> Option<PeerInfo> {
        self.host.borrow().clone()
    }

    /// Throw away the current role and elect again.
    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    /// Stop the election, tearing down relay, beacon and LAN connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ElectionService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Runner {
    machine: ElectionMachine,
    driver: Arc<dyn ElectionDriver>,
    host_timeout: Duration,
    beacons: Option<broadcast::Receiver<BeaconEvent>>,
    /// Pending window: generation and deadline.
    window: Option<(u64, Instant)>,
    /// Device id of the host the heartbeat refers to.
    followed: Option<String>,
    last_heartbeat: Instant,
    role_tx: watch::Sender<Role>,
    host_tx: watch::Sender<Option<PeerInfo>>,
}

impl Runner {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let actions = self.machine.start();
        self.execute(actions).await;

        loop {
            let window = self.window;
            let heartbeat_deadline = (self.machine.role() == Role::Client)
                .then(|| self.last_heartbeat + self.host_timeout);

            let actions = tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Restart) => {
                        info!("Election restart requested");
                        self.machine.start()
                    }
                    None => break,
                },
                event = recv_beacon(&mut self.beacons) => {
                    let from_followed = self
                        .machine
                        .current_host()
                        .is_some_and(|h| h.device_id == event.peer.device_id);
                    if from_followed {
                        self.last_heartbeat = Instant::now();
                    }
                    self.machine.on_beacon(event.peer)
                }
                generation = wait_window(window) => {
                    self.window = None;
                    self.machine.on_window_elapsed(generation)
                }
                _ = wait_deadline(heartbeat_deadline) => self.machine.on_host_lost(),
            };
            self.execute(actions).await;
        }

        let actions = self.machine.stop();
        self.execute(actions).await;
        debug!("Election stopped");
    }

    async fn execute(&mut self, actions: Vec<ElectionAction>) {
        let mut queue: VecDeque<ElectionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            debug!(action = ?action, "Election action");
            match action {
                ElectionAction::CancelTimer => self.window = None,
                ElectionAction::Listen => match self.driver.listen().await {
                    Ok(rx) => self.beacons = Some(rx),
                    Err(e) => {
                        warn!(error = %e, "Could not listen for beacons");
                        self.beacons = None;
                    }
                },
                ElectionAction::ScheduleWindow { generation, after } => {
                    self.window = Some((generation, Instant::now() + after));
                }
                ElectionAction::StartRelay => {
                    if let Err(e) = self.driver.start_relay().await {
                        warn!(error = %e, "Could not start local relay");
                        queue.clear();
                        queue.extend(self.machine.on_relay_failed());
                    }
                }
                ElectionAction::StopRelay => self.driver.stop_relay().await,
                ElectionAction::StartBeacon => self.driver.start_beacon().await,
                ElectionAction::StopBeacon => self.driver.stop_beacon().await,
                ElectionAction::Connect(target) => {
                    if let Err(e) = self.driver.connect(target).await {
                        warn!(error = %e, "LAN connect refused");
                    }
                }
                ElectionAction::DisconnectLan => self.driver.disconnect().await,
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        let role = self.machine.role();
        let changed = self.role_tx.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            *current = role;
            true
        });
        if changed {
            info!(role = role.as_str(), "Election role changed");
            crate::metrics::record_role(role.as_str());
        }

        let host = self.machine.current_host().cloned();
        let host_id = host.as_ref().map(|h| h.device_id.clone());
        if host_id != self.followed {
            // A newly followed host gets a full heartbeat window.
            self.last_heartbeat = Instant::now();
            self.followed = host_id;
        }
        self.host_tx.send_if_modified(|current| {
            if *current == host {
                return false;
            }
            *current = host;
            true
        });
    }
}

async fn recv_beacon(rx: &mut Option<broadcast::Receiver<BeaconEvent>>) -> BeaconEvent {
    let Some(receiver) = rx else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

async fn wait_window(window: Option<(u64, Instant)>) -> u64 {
    match window {
        Some((generation, at)) => {
            tokio::time::sleep_until(at).await;
            generation
        }
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
