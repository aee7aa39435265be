//! Deciding when to sync with which peer.
//!
//! A [`SyncScheduler`] owns one FIFO queue and a single worker, so at most one
//! sync round per log runs at a time. A peer is queued when a connection to it
//! is reported, unless it is already queued, the queue is full, or the last
//! round with it ended within the cooldown window.

use crate::error::SdkError;
use crate::network::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for sync scheduling.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Minimum time between the end of one round with a peer and the next.
    pub cooldown: Duration,
    /// Maximum number of queued peers.
    pub capacity: usize,
    /// Attempts per round before giving up.
    pub max_attempts: u32,
    /// Base wait between attempts, randomized to 50-150 %. Only retryable
    /// errors are retried.
    pub retry_interval: Duration,
    /// Upper bound of the random wait the lesser peer observes before starting.
    pub initial_delay: Duration,
    /// Re-queue every connected peer this often. `None` disables it.
    pub heartbeat: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(20),
            capacity: 32,
            max_attempts: 5,
            retry_interval: Duration::from_secs(1),
            initial_delay: Duration::from_millis(500),
            heartbeat: None,
        }
    }
}

/// Builder for scheduler configuration.
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity.max(1);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat = Some(interval);
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the scheduler can run a sync round against.
#[async_trait]
pub trait SyncTarget: Send + Sync + 'static {
    async fn sync_with(&self, peer: &PeerId) -> Result<(), SdkError>;
}

/// Why a peer was not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Skipped {
    AlreadyQueued,
    QueueFull,
    CoolingDown,
    Stopped,
}

#[derive(Default)]
struct SchedulerState {
    queued: HashSet<PeerId>,
    finished: HashMap<PeerId, Instant>,
}

/// Per-log sync queue with a single worker.
#[derive(Clone)]
pub struct SyncScheduler {
    config: SchedulerConfig,
    queue: mpsc::Sender<PeerId>,
    state: Arc<Mutex<SchedulerState>>,
    cancel: CancellationToken,
}

impl SyncScheduler {
    /// Start the worker. It runs until `cancel` fires.
    pub fn spawn<T: SyncTarget>(
        local: PeerId,
        config: SchedulerConfig,
        target: Arc<T>,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.capacity.max(1));
        let state = Arc::new(Mutex::new(SchedulerState::default()));

        let worker = Worker {
            local,
            config: config.clone(),
            target,
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(rx));

        SyncScheduler {
            config,
            queue,
            state,
            cancel,
        }
    }

    /// Queue a round with `peer`.
    pub fn schedule(&self, peer: PeerId) -> Result<(), Skipped> {
        if self.cancel.is_cancelled() {
            return Err(Skipped::Stopped);
        }

        let mut state = self.state.lock();
        if state.queued.contains(&peer) {
            return Err(Skipped::AlreadyQueued);
        }
        if let Some(finished) = state.finished.get(&peer) {
            if finished.elapsed() < self.config.cooldown {
                return Err(Skipped::CoolingDown);
            }
        }

        match self.queue.try_send(peer.clone()) {
            Ok(()) => {
                debug!(%peer, "sync queued");
                state.queued.insert(peer);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(Skipped::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Skipped::Stopped),
        }
    }

    /// Peers waiting or being synced.
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_queued(&self, peer: &PeerId) -> bool {
        self.state.lock().queued.contains(peer)
    }

    /// Stop the worker. Queued rounds are dropped and retries end quietly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

struct Worker<T> {
    local: PeerId,
    config: SchedulerConfig,
    target: Arc<T>,
    state: Arc<Mutex<SchedulerState>>,
    cancel: CancellationToken,
}

impl<T: SyncTarget> Worker<T> {
    async fn run(self, mut rx: mpsc::Receiver<PeerId>) {
        loop {
            let peer = tokio::select! {
                _ = self.cancel.cancelled() => break,
                peer = rx.recv() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };

            // Both sides see the connection at once. Making the lesser id
            // wait lets the other side go first and hit our cooldown.
            if self.local < peer && !self.pause(jitter(Duration::ZERO, self.config.initial_delay)).await {
                break;
            }

            if !self.round(&peer).await {
                break;
            }

            let mut state = self.state.lock();
            state.queued.remove(&peer);
            state.finished.insert(peer, Instant::now());
        }
        debug!(local = %self.local, "sync worker stopped");
    }

    /// Run one round with retries. Returns false if cancelled.
    async fn round(&self, peer: &PeerId) -> bool {
        for attempt in 1..=self.config.max_attempts {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                result = self.target.sync_with(peer) => result,
            };

            match result {
                Ok(()) => {
                    info!(%peer, attempt, "sync round finished");
                    return true;
                }
                Err(err) if attempt < self.config.max_attempts && err.is_retryable() => {
                    debug!(%peer, attempt, error = %err, "sync attempt failed, retrying");
                    let base = self.config.retry_interval;
                    if !self.pause(jitter(base / 2, base * 3 / 2)).await {
                        return false;
                    }
                }
                Err(err) => {
                    warn!(%peer, attempts = attempt, error = %err, "giving up on sync round");
                    break;
                }
            }
        }
        true
    }

    /// Sleep unless cancelled first. Returns false if cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, records every call.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        peers: Mutex<Vec<PeerId>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Flaky {
                failures,
                calls: AtomicUsize::new(0),
                peers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SyncTarget for Flaky {
        async fn sync_with(&self, peer: &PeerId) -> Result<(), SdkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.peers.lock().push(peer.clone());
            if call < self.failures {
                Err(SdkError::Network(crate::network::NetworkError::Disconnected))
            } else {
                Ok(())
            }
        }
    }

    fn fast() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
            .initial_delay(Duration::ZERO)
            .retry_interval(Duration::from_millis(10))
    }

    async fn settle(scheduler: &SyncScheduler) {
        for _ in 0..200 {
            if scheduler.queued() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler did not drain");
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.cooldown, Duration::from_secs(20));
        assert_eq!(config.capacity, 32);
        assert_eq!(config.max_attempts, 5);
        assert!(config.heartbeat.is_none());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(50), Duration::from_millis(150));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
        assert_eq!(jitter(Duration::ZERO, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_and_cooldown_skipped() {
        let target = Flaky::new(0);
        let scheduler = SyncScheduler::spawn(
            PeerId::new("b"),
            fast().build(),
            Arc::clone(&target),
            CancellationToken::new(),
        );

        let peer = PeerId::new("a");
        assert_eq!(scheduler.schedule(peer.clone()), Ok(()));
        assert_eq!(scheduler.schedule(peer.clone()), Err(Skipped::AlreadyQueued));

        settle(&scheduler).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.schedule(peer), Err(Skipped::CoolingDown));
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let target = Flaky::new(0);
        let config = fast().cooldown(Duration::from_millis(20)).build();
        let scheduler =
            SyncScheduler::spawn(PeerId::new("b"), config, Arc::clone(&target), CancellationToken::new());

        scheduler.schedule(PeerId::new("a")).unwrap();
        settle(&scheduler).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.schedule(PeerId::new("a")), Ok(()));
        settle(&scheduler).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let target = Flaky::new(2);
        let scheduler = SyncScheduler::spawn(
            PeerId::new("b"),
            fast().build(),
            Arc::clone(&target),
            CancellationToken::new(),
        );
        scheduler.schedule(PeerId::new("a")).unwrap();
        settle(&scheduler).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_fatal() {
        let target = Flaky::new(usize::MAX);
        let config = fast().max_attempts(3).cooldown(Duration::ZERO).build();
        let scheduler =
            SyncScheduler::spawn(PeerId::new("b"), config, Arc::clone(&target), CancellationToken::new());

        scheduler.schedule(PeerId::new("a")).unwrap();
        settle(&scheduler).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);

        // The worker is still alive.
        scheduler.schedule(PeerId::new("c")).unwrap();
        settle(&scheduler).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 6);
    }

    struct Stopped(AtomicUsize);

    #[async_trait]
    impl SyncTarget for Stopped {
        async fn sync_with(&self, _peer: &PeerId) -> Result<(), SdkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SdkError::Stopped)
        }
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let target = Arc::new(Stopped(AtomicUsize::new(0)));
        let scheduler = SyncScheduler::spawn(
            PeerId::new("b"),
            fast().build(),
            Arc::clone(&target),
            CancellationToken::new(),
        );
        scheduler.schedule(PeerId::new("a")).unwrap();
        settle(&scheduler).await;
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let target = Flaky::new(0);
        let scheduler = SyncScheduler::spawn(
            PeerId::new("0"),
            fast().build(),
            Arc::clone(&target),
            CancellationToken::new(),
        );
        let peers: Vec<PeerId> = ["x", "y", "z"].into_iter().map(PeerId::new).collect();
        for peer in &peers {
            scheduler.schedule(peer.clone()).unwrap();
        }
        settle(&scheduler).await;
        assert_eq!(*target.peers.lock(), peers);
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let target = Flaky::new(0);
        let cancel = CancellationToken::new();
        // A long initial delay keeps the first peer in flight.
        let config = SchedulerConfigBuilder::new()
            .capacity(1)
            .initial_delay(Duration::from_secs(60))
            .build();
        let scheduler = SyncScheduler::spawn(PeerId::new("a"), config, Arc::clone(&target), cancel.clone());

        scheduler.schedule(PeerId::new("b")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.schedule(PeerId::new("c")).unwrap();
        assert_eq!(scheduler.schedule(PeerId::new("d")), Err(Skipped::QueueFull));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_worker() {
        let target = Flaky::new(usize::MAX);
        let config = fast().retry_interval(Duration::from_secs(60)).build();
        let scheduler =
            SyncScheduler::spawn(PeerId::new("b"), config, Arc::clone(&target), CancellationToken::new());

        scheduler.schedule(PeerId::new("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.schedule(PeerId::new("c")), Err(Skipped::Stopped));
    }
}
