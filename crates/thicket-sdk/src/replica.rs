//! A log wired to a transport.
//!
//! The replica runs one event loop per log:
//!
//! - gossip on the log's topic is inserted; failures are logged and dropped
//! - new connections are handed to the [`SyncScheduler`]
//! - inbound streams for the log's sync protocol are served in their own task
//!
//! Locally appended messages are published as soon as they commit.

use crate::error::{Result, SdkError};
use crate::network::{PeerId, Transport, TransportEvent};
use crate::scheduler::{SchedulerConfig, SyncScheduler, SyncTarget};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thicket_log::{Appended, Consumer, Log, Payload, Signer, Status, SyncOutcome};
use thicket_merkle::{protocol_name, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs sync rounds by dialing peers on the log's protocol.
struct Syncer<P: Payload, C: Consumer<P>, S: Store, T: Transport> {
    log: Arc<Log<P, C, S>>,
    transport: Arc<T>,
    protocol: String,
}

impl<P: Payload, C: Consumer<P>, S: Store, T: Transport> Syncer<P, C, S, T> {
    async fn round(&self, peer: &PeerId) -> Result<SyncOutcome> {
        let stream = self.transport.dial(peer, &self.protocol).await?;
        let outcome = self.log.sync_stream(peer.as_str(), stream).await?;
        debug!(
            topic = %self.log.topic(),
            %peer,
            fetched = outcome.fetched,
            applied = outcome.applied,
            "sync round complete"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl<P, C, S, T> SyncTarget for Syncer<P, C, S, T>
where
    P: Payload,
    C: Consumer<P>,
    S: Store,
    T: Transport,
{
    async fn sync_with(&self, peer: &PeerId) -> Result<()> {
        self.round(peer).await.map(|_| ())
    }
}

/// A replicated log attached to a transport.
pub struct Replica<P: Payload, C: Consumer<P>, S: Store, T: Transport> {
    syncer: Arc<Syncer<P, C, S, T>>,
    scheduler: SyncScheduler,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P, C, S, T> Replica<P, C, S, T>
where
    P: Payload,
    C: Consumer<P>,
    S: Store,
    T: Transport,
{
    /// Take the transport's events and start the background tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(log: Log<P, C, S>, transport: Arc<T>, config: SchedulerConfig) -> Result<Self> {
        let events = transport.subscribe()?;
        let cancel = CancellationToken::new();

        let syncer = Arc::new(Syncer {
            protocol: protocol_name(log.topic()),
            log: Arc::new(log),
            transport,
        });
        let scheduler = SyncScheduler::spawn(
            syncer.transport.local_id().clone(),
            config.clone(),
            Arc::clone(&syncer),
            cancel.clone(),
        );

        let mut tasks = vec![tokio::spawn(run_events(
            Arc::clone(&syncer),
            scheduler.clone(),
            events,
            cancel.clone(),
        ))];
        if let Some(interval) = config.heartbeat {
            tasks.push(tokio::spawn(heartbeat(
                Arc::clone(&syncer.transport),
                scheduler.clone(),
                interval,
                cancel.clone(),
            )));
        }

        info!(
            topic = %syncer.log.topic(),
            local = %syncer.transport.local_id(),
            "replica started"
        );

        Ok(Replica {
            syncer,
            scheduler,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn log(&self) -> &Arc<Log<P, C, S>> {
        &self.syncer.log
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.syncer.transport
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn local_id(&self) -> &PeerId {
        self.syncer.transport.local_id()
    }

    /// Append locally and gossip the committed entry.
    ///
    /// A failed publish is only logged; sync repairs it later.
    pub async fn append(
        &self,
        payload: P,
        signer: Option<&dyn Signer>,
    ) -> Result<Appended<P, C::Output>> {
        if self.cancel.is_cancelled() {
            return Err(SdkError::Stopped);
        }

        let appended = self.syncer.log.append(payload, signer).await?;
        match self
            .syncer
            .transport
            .publish(self.syncer.log.topic(), appended.value.clone())
            .await
        {
            Ok(recipients) => debug!(id = %appended.id, recipients, "published"),
            Err(err) => warn!(id = %appended.id, error = %err, "publish failed"),
        }
        Ok(appended)
    }

    /// Run one sync round with `peer` now, bypassing the scheduler.
    pub async fn sync_with(&self, peer: &PeerId) -> Result<SyncOutcome> {
        if self.cancel.is_cancelled() {
            return Err(SdkError::Stopped);
        }
        self.syncer.round(peer).await
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "replica task failed");
            }
        }
        debug!(local = %self.local_id(), "replica stopped");
    }
}

impl<P: Payload, C: Consumer<P>, S: Store, T: Transport> Drop for Replica<P, C, S, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_events<P, C, S, T>(
    syncer: Arc<Syncer<P, C, S, T>>,
    scheduler: SyncScheduler,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
) where
    P: Payload,
    C: Consumer<P>,
    S: Store,
    T: Transport,
{
    let log = &syncer.log;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::Connected(peer) => {
                if let Err(skipped) = scheduler.schedule(peer.clone()) {
                    debug!(%peer, ?skipped, "sync not scheduled");
                }
            }
            TransportEvent::Disconnected(peer) => {
                debug!(%peer, "peer disconnected");
            }
            TransportEvent::Message { from, topic, data } if topic == log.topic() => {
                match log.insert_encoded(data).await {
                    Ok(inserted) if inserted.status == Status::Pending => {
                        debug!(%from, id = %inserted.id, "gossip waiting for parents");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%from, %topic, error = %err, "dropping gossip"),
                }
            }
            TransportEvent::Message { .. } => {}
            TransportEvent::Stream {
                from,
                protocol,
                stream,
            } if protocol == syncer.protocol => {
                let log = Arc::clone(log);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        served = log.serve_stream(from.as_str(), stream) => match served {
                            Ok(requests) => debug!(%from, requests, "sync stream closed"),
                            Err(err) => warn!(%from, error = %err, "sync stream failed"),
                        },
                    }
                });
            }
            TransportEvent::Stream { from, protocol, .. } => {
                debug!(%from, %protocol, "refusing stream");
            }
        }
    }
}

async fn heartbeat<T: Transport>(
    transport: Arc<T>,
    scheduler: SyncScheduler,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; connection events already cover it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for peer in transport.connected_peers().await {
                    let _ = scheduler.schedule(peer.id);
                }
            }
        }
    }
}
