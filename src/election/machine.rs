//! LAN host election state machine.
//!
//! ```text
//! ┌──────┐ start ┌───────────┐ window, no hosts ┌──────┐
//! │ Idle ├──────►│ Listening ├─────────────────►│ Host │
//! └──────┘       └─────┬─────┘                  └──┬───┘
//!                      │ window, host heard        │ beacon from lower id
//!                      ▼                           ▼
//!                  ┌────────┐◄─────────────────────┘
//!                  │ Client │── host silent ──► Listening
//!                  └────────┘
//! ```
//!
//! Pure: every input returns the side effects to perform, in order. Timers
//! are identified by a generation so a stale window can never fire into a
//! later election.

use meshsync_proto::PeerInfo;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Idle,
    Listening,
    Host,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Host => "host",
            Self::Client => "client",
        }
    }
}

/// Where the LAN strategy should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// The relay this device hosts.
    OwnRelay,
    /// A relay announced by another device.
    Host(PeerInfo),
    /// The relay address from configuration.
    Configured { address: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionAction {
    CancelTimer,
    /// (Re)start the beacon listener.
    Listen,
    ScheduleWindow { generation: u64, after: Duration },
    StartRelay,
    StopRelay,
    StartBeacon,
    StopBeacon,
    Connect(ConnectTarget),
    DisconnectLan,
}

/// Static inputs of one device's election.
#[derive(Debug, Clone)]
pub struct ElectionParams {
    pub device_id: String,
    /// Whether this platform may run the relay.
    pub can_host: bool,
    pub window: Duration,
    /// Upper bound of the random delay added to every window.
    pub jitter: Duration,
    /// Relay to try when this device cannot host.
    pub configured: Option<(String, u16)>,
}

#[derive(Debug)]
pub struct ElectionMachine {
    params: ElectionParams,
    can_host: bool,
    role: Role,
    generation: u64,
    window_open: bool,
    /// Hosts heard while the window was open, in arrival order.
    discovered: Vec<PeerInfo>,
    host: Option<PeerInfo>,
}

impl ElectionMachine {
    pub fn new(params: ElectionParams) -> Self {
        let can_host = params.can_host;
        Self {
            params,
            can_host,
            role: Role::Idle,
            generation: 0,
            window_open: false,
            discovered: Vec::new(),
            host: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn device_id(&self) -> &str {
        &self.params.device_id
    }

    /// Host this device follows, when a client.
    pub fn current_host(&self) -> Option<&PeerInfo> {
        self.host.as_ref()
    }

    pub fn can_host(&self) -> bool {
        self.can_host
    }

    fn window_length(&self) -> Duration {
        let jitter_ms = self.params.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.params.window;
        }
        self.params.window + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Tear down whatever role is held, then listen afresh.
    pub fn start(&mut self) -> Vec<ElectionAction> {
        let mut actions = vec![ElectionAction::CancelTimer];
        actions.extend(self.leave_role());
        actions.push(ElectionAction::Listen);

        self.generation += 1;
        self.discovered.clear();
        self.host = None;
        self.role = Role::Listening;

        if self.can_host {
            self.window_open = true;
            let after = self.window_length();
            debug!(device_id = %self.params.device_id, window_ms = after.as_millis() as u64, "Election window opened");
            actions.push(ElectionAction::ScheduleWindow {
                generation: self.generation,
                after,
            });
        } else {
            self.window_open = false;
            debug!(device_id = %self.params.device_id, "Cannot host; listening only");
            if let Some((address, port)) = &self.params.configured {
                actions.push(ElectionAction::Connect(ConnectTarget::Configured {
                    address: address.clone(),
                    port: *port,
                }));
            }
        }
        actions
    }

    /// Stop everything and go idle.
    pub fn stop(&mut self) -> Vec<ElectionAction> {
        let mut actions = vec![ElectionAction::CancelTimer];
        actions.extend(self.leave_role());
        if self.role == Role::Listening && !self.can_host && self.params.configured.is_some() {
            actions.push(ElectionAction::DisconnectLan);
        }
        self.generation += 1;
        self.window_open = false;
        self.discovered.clear();
        self.host = None;
        self.role = Role::Idle;
        actions
    }

    fn leave_role(&self) -> Vec<ElectionAction> {
        match self.role {
            Role::Host => vec![
                ElectionAction::StopBeacon,
                ElectionAction::StopRelay,
                ElectionAction::DisconnectLan,
            ],
            Role::Client => vec![ElectionAction::DisconnectLan],
            Role::Idle | Role::Listening => Vec::new(),
        }
    }

    fn follow(&mut self, host: PeerInfo) -> ElectionAction {
        info!(device_id = %self.params.device_id, host = %host.device_id, "Following LAN host");
        self.role = Role::Client;
        self.host = Some(host.clone());
        ElectionAction::Connect(ConnectTarget::Host(host))
    }

    /// A beacon from another device arrived.
    pub fn on_beacon(&mut self, peer: PeerInfo) -> Vec<ElectionAction> {
        if peer.device_id == self.params.device_id {
            return Vec::new();
        }
        match self.role {
            Role::Idle => Vec::new(),
            Role::Listening if self.window_open => {
                if !self.discovered.iter().any(|p| p.device_id == peer.device_id) {
                    debug!(host = %peer.device_id, "Host discovered during window");
                    self.discovered.push(peer);
                }
                Vec::new()
            }
            Role::Listening => {
                let mut actions = Vec::new();
                if self.params.configured.is_some() {
                    actions.push(ElectionAction::DisconnectLan);
                }
                actions.push(self.follow(peer));
                actions
            }
            Role::Host => {
                if peer.device_id.as_str() < self.params.device_id.as_str() {
                    info!(
                        device_id = %self.params.device_id,
                        winner = %peer.device_id,
                        "Split brain: yielding to lower device id"
                    );
                    crate::metrics::record_split_brain("yielded");
                    let mut actions = vec![
                        ElectionAction::StopBeacon,
                        ElectionAction::StopRelay,
                        ElectionAction::DisconnectLan,
                    ];
                    actions.push(self.follow(peer));
                    actions
                } else {
                    debug!(other = %peer.device_id, "Split brain: keeping host role");
                    crate::metrics::record_split_brain("kept");
                    Vec::new()
                }
            }
            Role::Client => {
                // Two hosts visible: converge on the one that will survive.
                let switch = self
                    .host
                    .as_ref()
                    .is_some_and(|h| peer.device_id.as_str() < h.device_id.as_str());
                if switch {
                    vec![ElectionAction::DisconnectLan, self.follow(peer)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// The election window timer fired.
    pub fn on_window_elapsed(&mut self, generation: u64) -> Vec<ElectionAction> {
        if generation != self.generation || !self.window_open || self.role != Role::Listening {
            return Vec::new();
        }
        self.window_open = false;
        if self.discovered.is_empty() {
            info!(device_id = %self.params.device_id, "No host found; hosting");
            self.role = Role::Host;
            return vec![
                ElectionAction::StartRelay,
                ElectionAction::StartBeacon,
                ElectionAction::Connect(ConnectTarget::OwnRelay),
            ];
        }
        let first = self.discovered.remove(0);
        self.discovered.clear();
        vec![self.follow(first)]
    }

    /// The relay could not be started; fall back to listening for this run.
    pub fn on_relay_failed(&mut self) -> Vec<ElectionAction> {
        if self.role != Role::Host {
            return Vec::new();
        }
        self.can_host = false;
        self.role = Role::Listening;
        vec![ElectionAction::StopBeacon, ElectionAction::DisconnectLan]
    }

    /// The followed host's beacons stopped. Re-elect from scratch.
    pub fn on_host_lost(&mut self) -> Vec<ElectionAction> {
        if self.role != Role::Client {
            return Vec::new();
        }
        info!(
            device_id = %self.params.device_id,
            host = ?self.host.as_ref().map(|h| h.device_id.as_str()),
            "Host heartbeat lost; re-electing"
        );
        self.start()
    }
}
