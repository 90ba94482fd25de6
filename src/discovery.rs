//! LAN discovery over UDP multicast.
//!
//! A hosting device sends a beacon every `beacon_interval`; every device
//! listens on the group and surfaces beacons from *other* devices as
//! [`BeaconEvent`]s. Malformed datagrams are dropped.

use meshsync_proto::{DiscoveryMessage, PeerInfo};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_SIZE: usize = 64;
const MAX_DATAGRAM: usize = 2048;

/// A beacon heard from another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconEvent {
    pub peer: PeerInfo,
    pub from: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub device_id: String,
    pub multicast_group: Ipv4Addr,
    pub port: u16,
}

/// Parse a datagram, ignoring our own beacons.
pub fn parse_beacon(own_device_id: &str, datagram: &[u8]) -> Option<PeerInfo> {
    match DiscoveryMessage::from_slice(datagram) {
        Ok(msg) => {
            let peer = msg.peer_info();
            (peer.device_id != own_device_id).then(|| peer.clone())
        }
        Err(e) => {
            crate::metrics::record_decode_fault("beacon");
            debug!(error = %e, "Dropping malformed discovery datagram");
            None
        }
    }
}

fn bind_multicast(group: Ipv4Addr, port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several processes on one host may listen on the same group.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket.into())
}

/// Address of the interface that routes off-host traffic. No packet is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Beacon listener plus an optional beaconing task.
#[derive(Debug)]
pub struct Discovery {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    events: broadcast::Sender<BeaconEvent>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    beacon: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Join the multicast group and start listening.
    pub fn start(config: DiscoveryConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(bind_multicast(
            config.multicast_group,
            config.port,
        )?)?);
        let target = SocketAddr::from((config.multicast_group, config.port));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        info!(group = %config.multicast_group, port = config.port, "Discovery listening");

        let listener = {
            let socket = Arc::clone(&socket);
            let events = events.clone();
            let cancel = cancel.clone();
            let device_id = config.device_id;
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let (len, from) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = socket.recv_from(&mut buf) => match received {
                            Ok(received) => received,
                            Err(e) => {
                                warn!(error = %e, "Discovery receive failed");
                                continue;
                            }
                        },
                    };
                    if let Some(peer) = parse_beacon(&device_id, &buf[..len]) {
                        let _ = events.send(BeaconEvent { peer, from });
                    }
                }
            })
        };

        Ok(Self {
            socket,
            target,
            events,
            cancel,
            listener: Mutex::new(Some(listener)),
            beacon: Mutex::new(None),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<BeaconEvent> {
        self.events.subscribe()
    }

    /// Send one beacon now.
    pub async fn send_beacon(&self, info: &PeerInfo) -> io::Result<()> {
        let datagram = DiscoveryMessage::beacon(info.clone()).to_vec();
        self.socket.send_to(&datagram, self.target).await.map(|_| ())
    }

    /// Beacon `info` every `interval` until [`Discovery::stop_beacon`].
    pub fn start_beacon(&self, info: PeerInfo, interval: Duration) {
        self.stop_beacon();
        let socket = Arc::clone(&self.socket);
        let target = self.target;
        let cancel = self.cancel.clone();
        let datagram = DiscoveryMessage::beacon(info).to_vec();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&datagram, target).await {
                            debug!(error = %e, "Beacon send failed");
                        }
                    }
                }
            }
        });
        *self.beacon.lock() = Some(task);
    }

    pub fn stop_beacon(&self) {
        if let Some(task) = self.beacon.lock().take() {
            task.abort();
        }
    }

    pub fn is_beaconing(&self) -> bool {
        self.beacon.lock().is_some()
    }

    /// Stop listening and beaconing.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.stop_beacon();
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(device_id: &str) -> Vec<u8> {
        DiscoveryMessage::beacon(PeerInfo {
            device_id: device_id.into(),
            name: "laptop".into(),
            ip: "10.0.0.5".into(),
            port: 4444,
        })
        .to_vec()
    }

    #[test]
    fn test_own_beacon_is_filtered() {
        assert!(parse_beacon("aaa", &beacon("aaa")).is_none());
        let peer = parse_beacon("aaa", &beacon("bbb")).unwrap();
        assert_eq!(peer.device_id, "bbb");
        assert_eq!(peer.port, 4444);
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        assert!(parse_beacon("aaa", b"\x00\x01garbage").is_none());
        assert!(parse_beacon("aaa", br#"{"type":"hello"}"#).is_none());
    }
}
