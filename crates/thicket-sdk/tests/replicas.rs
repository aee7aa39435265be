//! End-to-end tests: replicas on an in-memory network with lossy gossip.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thicket_sdk::prelude::*;

/// Counts applied messages per replica.
#[derive(Clone, Default)]
struct Tally(Arc<Mutex<usize>>);

#[async_trait::async_trait]
impl Consumer<String> for Tally {
    type Output = usize;

    async fn apply(
        &self,
        _id: &Id,
        _signature: Option<&Signature>,
        _message: &Message<String>,
    ) -> Result<usize, BoxError> {
        let mut count = self.0.lock();
        *count += 1;
        Ok(*count)
    }
}

type TestReplica = Replica<String, Tally, MemoryStore, MemoryTransport>;

fn scheduler() -> SchedulerConfigBuilder {
    SchedulerConfigBuilder::new()
        .cooldown(Duration::ZERO)
        .initial_delay(Duration::from_millis(10))
        .retry_interval(Duration::from_millis(20))
}

fn spawn(transports: &[MemoryTransport], config: SchedulerConfig, signed: bool) -> Vec<(TestReplica, Tally)> {
    transports
        .iter()
        .map(|transport| {
            let tally = Tally::default();
            let log_config = LogConfig::builder("stress").signatures(signed).build();
            let log = Log::open(log_config, tally.clone(), MemoryStore::new()).unwrap();
            let replica = Replica::start(log, Arc::new(transport.clone()), config.clone()).unwrap();
            (replica, tally)
        })
        .collect()
}

async fn wait_converged(replicas: &[(TestReplica, Tally)], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let first = replicas[0].0.log().root().unwrap();
        if replicas.iter().all(|(r, _)| r.log().root().unwrap() == first) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_repairs_lossy_gossip() {
    let transports = create_network(4);
    let replicas = spawn(&transports, scheduler().build(), false);
    for transport in &transports {
        transport.set_loss(0.5);
    }

    join_all(replicas.iter().enumerate().map(|(i, (replica, _))| async move {
        for n in 0..25 {
            replica.append(format!("{}-{}", i, n), None).await.unwrap();
        }
    }))
    .await;

    // Let the rounds from the initial connections finish first.
    while replicas.iter().any(|(r, _)| r.scheduler().queued() > 0) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Reconnecting fires connection events, which schedule sync rounds.
    for i in 0..transports.len() {
        for j in (i + 1)..transports.len() {
            transports[i].disconnect_from(&transports[j]);
            transports[i].connect_to(&transports[j]);
        }
    }

    assert!(wait_converged(&replicas, Duration::from_secs(10)).await);
    for (replica, tally) in &replicas {
        assert_eq!(*tally.0.lock(), 100);
        assert_eq!(replica.log().pending().await, 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_repairs_without_reconnect() {
    let transports = create_network(3);
    for transport in &transports {
        transport.set_loss(1.0);
    }
    let config = scheduler().heartbeat(Duration::from_millis(50)).build();
    let replicas = spawn(&transports, config, true);

    let signer = Ed25519Signer::generate();
    for (i, (replica, _)) in replicas.iter().enumerate() {
        for n in 0..5 {
            replica
                .append(format!("{}-{}", i, n), Some(&signer))
                .await
                .unwrap();
        }
    }

    assert!(wait_converged(&replicas, Duration::from_secs(10)).await);
    for (_, tally) in &replicas {
        assert_eq!(*tally.0.lock(), 15);
    }
}

#[tokio::test]
async fn test_commit_events_follow_gossip() {
    let transports = create_network(2);
    let replicas = spawn(&transports, scheduler().build(), false);
    let mut events = replicas[1].0.log().subscribe();

    let appended = replicas[0].0.append("ping".into(), None).await.unwrap();
    assert_eq!(appended.result, Some(1));

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(LogEvent::Message { id, result, .. }) = events.recv().await {
                return (id, result);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, (appended.id, 1));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let transports = create_network(2);
    let replicas = spawn(&transports, SchedulerConfig::default(), false);
    for (replica, _) in &replicas {
        replica.shutdown().await;
        replica.shutdown().await;
    }
    assert!(matches!(
        replicas[0].0.append("late".into(), None).await,
        Err(SdkError::Stopped)
    ));
}
