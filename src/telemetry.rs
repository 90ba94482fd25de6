//! Tracing span constructors shared by the replication and election code.

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for one peer session inside a provider.
    pub fn peer_session(room: &str, peer: &str) -> Span {
        info_span!("peer_session", room = %room, peer = %peer)
    }

    /// Span for a connection strategy.
    pub fn strategy(strategy: &str, room: Option<&str>) -> Span {
        if let Some(room) = room {
            info_span!("strategy", strategy = %strategy, room = %room)
        } else {
            info_span!("strategy", strategy = %strategy)
        }
    }

    /// Span for the LAN election service.
    pub fn election(device_id: &str) -> Span {
        info_span!("election", device_id = %device_id)
    }

    /// Span for one websocket client of the local relay.
    pub fn relay_client(addr: &str) -> Span {
        info_span!("relay_client", addr = %addr)
    }
}
