//! Prometheus metrics collection for meshsync.
//!
//! Exposed on the HTTP endpoint (see [`crate::http`]). Tracks replication
//! traffic, decode faults, election role changes and transport recovery.
//!
//! ## Replication Metrics
//!
//! - `meshsync_frames_received_total{kind}` - Peer frames by kind
//! - `meshsync_decode_faults_total{source}` - Dropped malformed input
//! - `meshsync_fanout_recipients` - Peers reached per broadcast (histogram)
//! - `meshsync_peer_sessions` - Live peer sessions across all providers

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Peer frames received, by kind.
pub static FRAMES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Malformed or undecryptable input dropped, by source.
pub static DECODE_FAULTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Individual peer sends performed by fan-out.
pub static FANOUT_SENDS: OnceLock<IntCounter> = OnceLock::new();

/// Peer sends that failed (peer mid-disconnect).
pub static SEND_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Joins refused because the provider was at capacity.
pub static JOINS_REFUSED: OnceLock<IntCounter> = OnceLock::new();

/// Election role transitions, by new role.
pub static ROLE_TRANSITIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Split-brain resolutions, by outcome for this device.
pub static SPLIT_BRAIN: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconnect attempts, by strategy.
pub static RECONNECT_ATTEMPTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Strategy faults, by strategy and error code.
pub static STRATEGY_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Live peer sessions across every provider.
pub static PEER_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

/// Websocket clients connected to the local relay.
pub static RELAY_CLIENTS: OnceLock<IntGauge> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

/// Recipients per broadcast.
pub static FANOUT_RECIPIENTS: OnceLock<Histogram> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Call once at startup before recording. Recording before `init()` is a
/// no-op.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(FRAMES_RECEIVED, IntCounterVec::new(Opts::new("meshsync_frames_received_total", "Peer frames received by kind"), &["kind"]));
    register!(DECODE_FAULTS, IntCounterVec::new(Opts::new("meshsync_decode_faults_total", "Malformed input dropped by source"), &["source"]));
    register!(FANOUT_SENDS, IntCounter::new("meshsync_fanout_sends_total", "Peer sends performed by fan-out"));
    register!(SEND_FAILURES, IntCounter::new("meshsync_send_failures_total", "Peer sends that failed"));
    register!(JOINS_REFUSED, IntCounter::new("meshsync_joins_refused_total", "Joins refused at capacity"));
    register!(ROLE_TRANSITIONS, IntCounterVec::new(Opts::new("meshsync_election_role_transitions_total", "Election role transitions"), &["role"]));
    register!(SPLIT_BRAIN, IntCounterVec::new(Opts::new("meshsync_split_brain_resolutions_total", "Split-brain resolutions"), &["outcome"]));
    register!(RECONNECT_ATTEMPTS, IntCounterVec::new(Opts::new("meshsync_reconnect_attempts_total", "Reconnect attempts"), &["strategy"]));
    register!(STRATEGY_ERRORS, IntCounterVec::new(Opts::new("meshsync_strategy_errors_total", "Strategy faults"), &["strategy", "error"]));
    register!(PEER_SESSIONS, IntGauge::new("meshsync_peer_sessions", "Live peer sessions"));
    register!(RELAY_CLIENTS, IntGauge::new("meshsync_relay_clients", "Clients connected to the local relay"));
    register!(FANOUT_RECIPIENTS, Histogram::with_opts(
        HistogramOpts::new("meshsync_fanout_recipients", "Recipients per broadcast")
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0])));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Recording helpers
// ============================================================================

#[inline]
pub fn record_frame(kind: &str) {
    if let Some(c) = FRAMES_RECEIVED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

#[inline]
pub fn record_decode_fault(source: &str) {
    if let Some(c) = DECODE_FAULTS.get() {
        c.with_label_values(&[source]).inc();
    }
}

/// Record one broadcast: how many peers it reached and how many sends failed.
#[inline]
pub fn record_fanout(recipients: usize, failures: usize) {
    if let Some(h) = FANOUT_RECIPIENTS.get() {
        h.observe(recipients as f64);
    }
    if let Some(c) = FANOUT_SENDS.get() {
        c.inc_by(recipients as u64);
    }
    if failures > 0
        && let Some(c) = SEND_FAILURES.get()
    {
        c.inc_by(failures as u64);
    }
}

#[inline]
pub fn record_join_refused() {
    if let Some(c) = JOINS_REFUSED.get() {
        c.inc();
    }
}

#[inline]
pub fn session_opened() {
    if let Some(g) = PEER_SESSIONS.get() {
        g.inc();
    }
}

#[inline]
pub fn session_closed() {
    if let Some(g) = PEER_SESSIONS.get() {
        g.dec();
    }
}

#[inline]
pub fn record_role(role: &str) {
    if let Some(c) = ROLE_TRANSITIONS.get() {
        c.with_label_values(&[role]).inc();
    }
}

#[inline]
pub fn record_split_brain(outcome: &str) {
    if let Some(c) = SPLIT_BRAIN.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

#[inline]
pub fn record_reconnect(strategy: &str) {
    if let Some(c) = RECONNECT_ATTEMPTS.get() {
        c.with_label_values(&[strategy]).inc();
    }
}

#[inline]
pub fn record_strategy_error(strategy: &str, error: &str) {
    if let Some(c) = STRATEGY_ERRORS.get() {
        c.with_label_values(&[strategy, error]).inc();
    }
}

#[inline]
pub fn relay_client_connected() {
    if let Some(g) = RELAY_CLIENTS.get() {
        g.inc();
    }
}

#[inline]
pub fn relay_client_disconnected() {
    if let Some(g) = RELAY_CLIENTS.get() {
        g.dec();
    }
}
