//! Peer aggregation across the LAN and internet strategies.

mod common;

use common::{TestDevice, fast_settings, start_relay, wait_until};
use meshsync::aggregator::PeerSource;
use meshsync::room::MemoryBroker;
use meshsync::strategy::{ConnectionStatus, ConnectionStrategy, StrategySettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_peer_on_both_transports_is_listed_once_as_both() {
    let broker = MemoryBroker::new();
    let relay = start_relay().await;
    let a = TestDevice::new(&broker, 1, "alice");
    let b = TestDevice::new(&broker, 2, "bob");

    a.join_lan(&relay).await;
    b.join_lan(&relay).await;
    wait_until("bob seen over lan", || a.source_of(2) == Some(PeerSource::Local)).await;

    a.join_internet(None).await;
    b.join_internet(None).await;
    wait_until("bob seen over both", || a.source_of(2) == Some(PeerSource::Both)).await;
    wait_until("alice seen over both", || b.source_of(1) == Some(PeerSource::Both)).await;

    let peers = a.aggregator.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "bob");
    wait_until("connected", || a.aggregator.status() == ConnectionStatus::Connected).await;

    // Withdrawing one report downgrades, never duplicates.
    b.internet.disconnect().await;
    wait_until("bob back to lan only", || a.source_of(2) == Some(PeerSource::Local)).await;
    assert_eq!(a.aggregator.peers().len(), 1);

    b.lan.disconnect().await;
    wait_until("bob gone", || a.source_of(2).is_none()).await;
    assert!(a.aggregator.peers().is_empty());

    a.destroy().await;
    b.destroy().await;
    relay.shutdown();
}

#[tokio::test]
async fn test_internet_only_peer() {
    let broker = MemoryBroker::new();
    let a = TestDevice::new(&broker, 1, "alice");
    let b = TestDevice::new(&broker, 2, "bob");

    a.join_internet(None).await;
    b.join_internet(None).await;
    wait_until("bob seen over internet", || {
        a.source_of(2) == Some(PeerSource::Internet)
    })
    .await;
    assert!(a.lan.get_peers().is_empty());

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test]
async fn test_disconnect_twice_is_harmless() {
    let broker = MemoryBroker::new();
    let relay = start_relay().await;
    let a = TestDevice::new(&broker, 1, "alice");
    let b = TestDevice::new(&broker, 2, "bob");

    a.join_internet(None).await;
    b.join_internet(None).await;
    a.join_lan(&relay).await;
    b.join_lan(&relay).await;
    wait_until("peers listed", || a.source_of(2) == Some(PeerSource::Both)).await;

    let strategies: [Arc<dyn ConnectionStrategy>; 2] = [a.internet.clone(), a.lan.clone()];
    for strategy in strategies {
        strategy.disconnect().await;
        assert!(strategy.get_peers().is_empty());
        assert!(!strategy.is_connected());
        strategy.disconnect().await;
        assert!(strategy.get_peers().is_empty());
        assert!(!strategy.is_connected());
    }

    wait_until("aggregate emptied", || {
        a.aggregator.peers().is_empty()
            && a.aggregator.status() == ConnectionStatus::Disconnected
    })
    .await;
    // Only bob's broker connection is left.
    assert_eq!(broker.connections(), 1);

    a.destroy().await;
    b.destroy().await;
    relay.shutdown();
}

#[tokio::test]
async fn test_dropping_one_transport_downgrades_without_a_gap() {
    let broker = MemoryBroker::new();
    let relay = start_relay().await;
    let a = TestDevice::new(&broker, 1, "alice");
    let b = TestDevice::new(&broker, 2, "bob");
    a.join_lan(&relay).await;
    b.join_lan(&relay).await;
    a.join_internet(None).await;
    b.join_internet(None).await;
    wait_until("bob seen over both", || a.source_of(2) == Some(PeerSource::Both)).await;

    // Record every aggregate value and presence sample while bob drops one
    // transport.
    let stop = CancellationToken::new();
    let recorder = {
        let mut updates = a.aggregator.peer_updates();
        let presence = a.presence.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut sources = Vec::new();
            let mut gaps = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let source = updates
                            .borrow_and_update()
                            .iter()
                            .find(|p| p.client_id == 2)
                            .map(|p| p.source);
                        sources.push(source);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(2)) => {
                        if !presence.contains(2) {
                            gaps += 1;
                        }
                    }
                }
            }
            (sources, gaps)
        })
    };

    b.internet.disconnect().await;
    wait_until("bob back to lan only", || a.source_of(2) == Some(PeerSource::Local)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.cancel();
    let (sources, gaps) = recorder.await.unwrap();

    assert!(!sources.contains(&None), "bob vanished before downgrading: {sources:?}");
    assert_eq!(sources.last(), Some(&Some(PeerSource::Local)));
    assert_eq!(gaps, 0);
    assert!(b.presence.contains(1));
    assert_eq!(a.source_of(2), Some(PeerSource::Local));

    a.destroy().await;
    b.destroy().await;
    relay.shutdown();
}

#[tokio::test]
async fn test_second_transport_is_credited_without_reconciliation() {
    let broker = MemoryBroker::new();
    let relay = start_relay().await;
    let settings = StrategySettings {
        reconcile_interval: Duration::from_secs(3600),
        ..fast_settings()
    };
    let a = TestDevice::with_settings(&broker, 1, "alice", settings.clone());
    let b = TestDevice::with_settings(&broker, 2, "bob", settings);

    a.join_lan(&relay).await;
    b.join_lan(&relay).await;
    wait_until("bob seen over lan", || a.source_of(2) == Some(PeerSource::Local)).await;

    a.join_internet(None).await;
    b.join_internet(None).await;
    wait_until("bob seen over both", || a.source_of(2) == Some(PeerSource::Both)).await;
    wait_until("alice seen over both", || b.source_of(1) == Some(PeerSource::Both)).await;

    a.destroy().await;
    b.destroy().await;
    relay.shutdown();
}
