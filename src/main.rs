//! meshsyncd - replicates one document and presence table over the LAN and
//! the internet at the same time.

use meshsync::aggregator::{AggregatorPolicy, StrategyAggregator};
use meshsync::config::{Config, validate};
use meshsync::discovery::{self, DiscoveryConfig};
use meshsync::election::{
    ElectionConfig, ElectionParams, ElectionService, LanDriver, LanDriverConfig,
};
use meshsync::http::{self, HttpState};
use meshsync::presence::{ClientId, PresenceTable};
use meshsync::replica::SharedDocument;
use meshsync::room::{SignalingConnector, WsConnector};
use meshsync::strategy::{
    ConnectionStrategy, InternetStrategy, LanStrategy, StrategyConfig, StrategySettings,
};
use meshsync::sync::LocalBus;
use meshsync_proto::PeerInfo;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MESHSYNC_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    if let Err(errors) = validate(&config) {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path);
    }

    info!(
        device = %config.device.id,
        name = %config.device.name,
        room = %config.room.name,
        lan = config.lan.enable,
        internet = config.internet.enable,
        "Starting meshsyncd"
    );

    meshsync::metrics::init();

    // Shared replica and presence table
    let client_id: ClientId = rand::random();
    let replica = Arc::new(SharedDocument::new(client_id));
    let presence = Arc::new(PresenceTable::new(client_id));
    let lan_ip = discovery::local_ipv4().map(|ip| ip.to_string());
    presence.set_local_state(Some(json!({
        "user": {
            "name": config.device.name,
            "deviceId": config.device.id,
            "ip": lan_ip,
        }
    })));

    let shutdown = CancellationToken::new();
    let connector: Arc<dyn SignalingConnector> = Arc::new(WsConnector::default());
    let aggregator = StrategyAggregator::new(AggregatorPolicy::default());
    let settings = StrategySettings {
        max_peers: config.room.max_peers,
        reconnect_base: config.lan.reconnect_base(),
        reconnect_max: config.lan.reconnect_max(),
        ..StrategySettings::default()
    };
    let mut strategies: Vec<Arc<dyn ConnectionStrategy>> = Vec::new();

    // Internet strategy
    if config.internet.enable {
        let internet = Arc::new(InternetStrategy::new(
            Arc::clone(&connector),
            StrategySettings {
                local_bus: config.room.broadcast_local.then(LocalBus::new),
                ..settings.clone()
            },
        ));
        internet.initialize(replica.clone(), presence.clone());
        aggregator.register(internet.as_ref());
        let strategy_config = StrategyConfig {
            enable: true,
            secret: config.room.secret.clone(),
            discovery_relay_address: config.internet.discovery_relay_address.clone(),
            credentials: config.internet.credentials.clone(),
            ..StrategyConfig::default()
        };
        if let Err(e) = internet.connect(&config.room.name, strategy_config).await {
            warn!(error = %e, code = e.error_code(), "Internet strategy did not start");
        }
        strategies.push(internet);
    }

    // LAN strategy driven by the host election
    let election = if config.lan.enable {
        let lan = Arc::new(LanStrategy::new(Arc::clone(&connector), settings.clone()));
        lan.initialize(replica.clone(), presence.clone());
        aggregator.register(lan.as_ref());

        let driver_config = LanDriverConfig {
            room: config.room.name.clone(),
            strategy: StrategyConfig {
                enable: true,
                secret: config.room.secret.clone(),
                ..StrategyConfig::default()
            },
            discovery: DiscoveryConfig {
                device_id: config.device.id.clone(),
                multicast_group: config.lan.multicast_group,
                port: config.lan.discovery_port,
            },
            relay_port: config.lan.relay_port,
            beacon_interval: config.lan.beacon_interval(),
            info: PeerInfo {
                device_id: config.device.id.clone(),
                name: config.device.name.clone(),
                ip: lan_ip.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                port: config.lan.relay_port,
            },
        };
        let driver = Arc::new(LanDriver::new(driver_config, lan.clone()));
        let service = ElectionService::start(
            ElectionConfig {
                params: ElectionParams {
                    device_id: config.device.id.clone(),
                    can_host: config.device.can_host,
                    window: config.lan.election_window(),
                    jitter: config.lan.election_window() / 4,
                    configured: config.lan.configured_relay(),
                },
                host_timeout: config.lan.peer_timeout(),
            },
            driver,
        );
        strategies.push(lan);
        Some(service)
    } else {
        None
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // HTTP endpoint
    if config.metrics.port != 0 {
        let state = HttpState {
            aggregator: Arc::clone(&aggregator),
            role: election.as_ref().map(ElectionService::role_updates),
        };
        tasks.push(tokio::spawn(http::run_http_server(
            config.metrics.port,
            state,
            shutdown.clone(),
        )));
    }

    // Presence renewal and expiry
    {
        let presence = Arc::clone(&presence);
        let renew = config.presence.renew_interval();
        let outdated = config.presence.outdated_timeout();
        let cancel = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew.min(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        presence.renew_local(renew);
                        let expired = presence.remove_outdated(outdated);
                        if !expired.is_empty() {
                            info!(count = expired.len(), "Expired silent peers");
                        }
                    }
                }
            }
        }));
    }
    info!("Presence liveness task started");

    // Log aggregated peer changes
    {
        let mut peers = aggregator.peer_updates();
        let cancel = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = peers.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let list = peers.borrow_and_update().clone();
                        for peer in &list {
                            info!(
                                client = peer.client_id,
                                name = %peer.name,
                                source = ?peer.source,
                                "Peer"
                            );
                        }
                        info!(count = list.len(), "Peer list changed");
                    }
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Tell peers we are leaving while the transports are still up.
    presence.set_local_state(None);
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    if let Some(election) = &election {
        election.stop().await;
    }
    for strategy in &strategies {
        strategy.destroy().await;
    }
    aggregator.shutdown();
    for task in tasks {
        let _ = task.await;
    }

    info!("meshsyncd stopped");
    Ok(())
}
