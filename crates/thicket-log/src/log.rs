//! The replicated log and its apply/commit pipeline.
//!
//! Every message, whether appended locally, received by gossip or pulled by
//! sync, goes through the same steps:
//!
//! 1. **Validate**: clock and parents match the log's sequencing mode, the
//!    signature verifies and the consumer accepts the payload
//! 2. **Deduplicate**: inside the write transaction that would store it
//! 3. **Check dependencies**: a message with uncommitted parents is parked in
//!    the mempool
//! 4. **Apply**: the consumer runs, then the entry and its head markers commit
//!    atomically
//! 5. **Release**: pending dependents are committed in turn
//!
//! All commits of one log are serialized by a single async mutex.

use crate::config::LogConfig;
use crate::error::{BoxError, LogError, Result};
use crate::frontier::Frontier;
use crate::id::{get_clock, Id};
use crate::mempool::Mempool;
use crate::message::{decode_value, signed_bytes, Message, SignedMessage};
use crate::signature::{Ed25519Verifier, Signature, Signer, Verifier};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use thicket_merkle::{
    serve, Client, Driver, Hash, ReadTransaction, Server, Source, Store, SyncError,
    WriteTransaction,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the event channel. Slow subscribers miss events rather than
/// block commits.
pub const EVENT_CAPACITY: usize = 1024;

/// Anything that can be carried as a message payload.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Downstream state machine fed by the log.
#[async_trait]
pub trait Consumer<P: Payload>: Send + Sync + 'static {
    /// Value returned by `apply`, reported in events and to the author.
    type Output: Clone + Send + Sync + 'static;

    /// Cheap structural check, run before anything is stored.
    fn validate(&self, _payload: &P) -> bool {
        true
    }

    /// Called at most once per id on this replica, in causal order.
    async fn apply(
        &self,
        id: &Id,
        signature: Option<&Signature>,
        message: &Message<P>,
    ) -> std::result::Result<Self::Output, BoxError>;
}

/// Broadcast to subscribers after the fact. Never retried.
#[derive(Clone, Debug)]
pub enum LogEvent<P, O> {
    Message {
        id: Id,
        signature: Option<Signature>,
        message: Message<P>,
        result: O,
    },
    Commit {
        root: Hash,
    },
    Sync {
        peer: String,
        outcome: SyncOutcome,
    },
}

/// What happened to an inserted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Committed,
    /// Parked until its parents are committed.
    Pending,
    /// Already committed.
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inserted {
    pub id: Id,
    pub status: Status,
}

/// A locally authored message.
#[derive(Clone, Debug)]
pub struct Appended<P, O> {
    pub id: Id,
    pub signature: Option<Signature>,
    pub message: Message<P>,
    /// Encoded entry, ready to publish.
    pub value: Vec<u8>,
    /// `None` if an identical message was already in the log.
    pub result: Option<O>,
}

/// Counters for one sync round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Local root after the round.
    pub root: Hash,
    /// Entries the peer had and we lacked.
    pub fetched: usize,
    /// Messages committed, including dependents released from the mempool.
    pub applied: usize,
    /// Messages parked because their parents were still missing.
    pub mempooled: usize,
    /// Messages rejected by validation or by the consumer.
    pub failed: usize,
}

enum Outcome<O> {
    Committed(O),
    Pending,
    Duplicate,
}

struct LogState<P> {
    frontier: Frontier,
    mempool: Mempool<SignedMessage<P>>,
}

pub struct Log<P: Payload, C: Consumer<P>, S: Store> {
    config: LogConfig,
    consumer: C,
    store: S,
    verifiers: HashMap<String, Arc<dyn Verifier>>,
    state: Mutex<LogState<P>>,
    events: broadcast::Sender<LogEvent<P, C::Output>>,
}

impl<P: Payload, C: Consumer<P>, S: Store> Log<P, C, S> {
    /// Open a log over `store`, restoring the frontier from its head markers.
    pub fn open(config: LogConfig, consumer: C, store: S) -> Result<Self> {
        config.validate()?;
        let frontier = if config.sequencing {
            Frontier::load(&store.read()?)?
        } else {
            Frontier::default()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut verifiers: HashMap<String, Arc<dyn Verifier>> = HashMap::new();
        verifiers.insert(Ed25519Verifier.scheme().to_string(), Arc::new(Ed25519Verifier));

        debug!(topic = %config.topic, heads = frontier.len(), "log opened");
        Ok(Log {
            config,
            consumer,
            store,
            verifiers,
            state: Mutex::new(LogState {
                frontier,
                mempool: Mempool::new(),
            }),
            events,
        })
    }

    /// Accept signatures of another scheme.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifiers.insert(verifier.scheme().to_string(), verifier);
        self
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent<P, C::Output>> {
        self.events.subscribe()
    }

    pub fn root(&self) -> Result<Hash> {
        Ok(self.store.read()?.root()?.hash)
    }

    /// Clock and parents the next local message would get.
    pub async fn clock(&self) -> (u64, Vec<Id>) {
        if !self.config.sequencing {
            return (0, Vec::new());
        }
        self.state.lock().await.frontier.current()
    }

    /// Number of messages waiting for their parents.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.mempool.len()
    }

    /// Create, sign and commit a message on top of the current frontier.
    pub async fn append(
        &self,
        payload: P,
        signer: Option<&dyn Signer>,
    ) -> Result<Appended<P, C::Output>> {
        let mut state = self.state.lock().await;

        let (clock, parents) = if self.config.sequencing {
            state.frontier.current()
        } else {
            (0, Vec::new())
        };
        let message = Message::new(clock, parents, payload);

        let signature = match (signer, self.config.signatures) {
            (Some(signer), true) => Some(signer.sign(&signed_bytes(&self.config.topic, &message)?)?),
            (None, false) => None,
            (None, true) => {
                return Err(LogError::Signature(format!(
                    "log {} requires a signer",
                    self.config.topic
                )))
            }
            (Some(_), false) => {
                return Err(LogError::Validation(format!(
                    "log {} is unsigned",
                    self.config.topic
                )))
            }
        };

        let signed = SignedMessage::encode(signature, message)?;
        self.validate(&signed)?;

        let id = signed.id;
        let appended = Appended {
            id,
            signature: signed.signature.clone(),
            message: signed.message.clone(),
            value: signed.value.clone(),
            result: None,
        };

        match self.process(&mut state, signed).await? {
            Outcome::Committed(result) => {
                self.release(&mut state, id).await?;
                Ok(Appended {
                    result: Some(result),
                    ..appended
                })
            }
            Outcome::Duplicate | Outcome::Pending => Ok(appended),
        }
    }

    /// Insert a message authored elsewhere. Idempotent.
    pub async fn insert(
        &self,
        signature: Option<Signature>,
        message: Message<P>,
    ) -> Result<Inserted> {
        let signed = SignedMessage::encode(signature, message)?;
        self.insert_signed(signed).await
    }

    /// Insert an entry exactly as it was published.
    pub async fn insert_encoded(&self, value: Vec<u8>) -> Result<Inserted> {
        let signed = SignedMessage::decode(value)?;
        self.insert_signed(signed).await
    }

    async fn insert_signed(&self, signed: SignedMessage<P>) -> Result<Inserted> {
        self.validate(&signed)?;
        let id = signed.id;

        let mut state = self.state.lock().await;
        let status = match self.process(&mut state, signed).await? {
            Outcome::Committed(_) => {
                self.release(&mut state, id).await?;
                Status::Committed
            }
            Outcome::Pending => Status::Pending,
            Outcome::Duplicate => Status::Duplicate,
        };
        Ok(Inserted { id, status })
    }

    pub fn get(&self, id: &Id) -> Result<Option<(Option<Signature>, Message<P>)>> {
        match self.store.read()?.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode_value(&value)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: &Id) -> Result<bool> {
        Ok(self.store.read()?.contains(id.as_bytes())?)
    }

    /// Committed messages in id order (causal order), lazily decoded from a
    /// snapshot taken now.
    pub fn iterate(
        &self,
        lower: Bound<Id>,
        upper: Bound<Id>,
        reverse: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<SignedMessage<P>>> + Send>> {
        let entries = self
            .store
            .read()?
            .entries(id_bound(lower), id_bound(upper), reverse)?;
        Ok(Box::new(entries.map(|entry| {
            let (_, value) = entry?;
            SignedMessage::decode(value)
        })))
    }

    /// A read-only sync source over the current state.
    pub fn serve(&self, peer: &str) -> Result<Server<S::Read>> {
        debug!(topic = %self.config.topic, peer, "serving sync");
        Ok(Server::new(self.store.read()?))
    }

    /// Answer sync requests on `stream` until the peer closes it.
    pub async fn serve_stream<T>(&self, peer: &str, stream: T) -> Result<usize>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let server = self.serve(peer)?;
        Ok(serve(&server, stream).await?)
    }

    /// Sync over a byte stream connected to a peer's [`Log::serve_stream`].
    pub async fn sync_stream<T>(&self, peer: &str, stream: T) -> Result<SyncOutcome>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = Client::new(stream);
        self.sync(peer, &mut client).await
    }

    /// Pull every entry `source` holds that this replica lacks.
    ///
    /// A malformed entry aborts the round. Entries that fail validation or
    /// application are counted and skipped.
    pub async fn sync<R: Source>(&self, peer: &str, source: &mut R) -> Result<SyncOutcome> {
        let entries = {
            let snapshot = self.store.read()?;
            Driver::new(&snapshot, source).collect().await?
        };

        let mut applied = 0;
        let mut mempooled = 0;
        let mut failed = 0;
        let fetched = entries.len();

        for (key, value) in entries {
            let signed = decode_synced(&key, value)?;
            if let Err(err) = self.validate(&signed) {
                warn!(topic = %self.config.topic, peer, id = %signed.id, error = %err, "rejecting synced message");
                failed += 1;
                continue;
            }

            let id = signed.id;
            let mut state = self.state.lock().await;
            match self.process(&mut state, signed).await {
                Ok(Outcome::Committed(_)) => applied += 1 + self.release(&mut state, id).await?,
                Ok(Outcome::Pending) => mempooled += 1,
                Ok(Outcome::Duplicate) => {}
                Err(LogError::Apply(err)) => {
                    warn!(topic = %self.config.topic, peer, %id, error = %err, "synced message not applied");
                    failed += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let outcome = SyncOutcome {
            root: self.root()?,
            fetched,
            applied,
            mempooled,
            failed,
        };
        info!(
            topic = %self.config.topic,
            peer,
            fetched,
            applied,
            mempooled,
            failed,
            root = %outcome.root.short(),
            "sync complete"
        );
        let _ = self.events.send(LogEvent::Sync {
            peer: peer.to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    fn validate(&self, signed: &SignedMessage<P>) -> Result<()> {
        let message = &signed.message;

        if self.config.sequencing {
            if !message.parents.windows(2).all(|w| w[0] < w[1]) {
                return Err(LogError::Validation("parents must be sorted and unique".into()));
            }
            let expected = get_clock(&message.parents).ok_or_else(|| {
                LogError::Validation("parent clock leaves no room for a child".into())
            })?;
            if message.clock != expected {
                return Err(LogError::Validation(format!(
                    "clock {} does not follow parents, expected {}",
                    message.clock, expected
                )));
            }
        } else if message.clock != 0 || !message.parents.is_empty() {
            return Err(LogError::Validation(
                "unsequenced messages carry no clock or parents".into(),
            ));
        }

        match (&signed.signature, self.config.signatures) {
            (Some(signature), true) => {
                let verifier = self.verifiers.get(&signature.scheme).ok_or_else(|| {
                    LogError::Signature(format!("unknown scheme {}", signature.scheme))
                })?;
                verifier.verify(signature, &signed_bytes(&self.config.topic, message)?)?;
            }
            (None, false) => {}
            (None, true) => return Err(LogError::Signature("missing signature".into())),
            (Some(_), false) => {
                return Err(LogError::Signature("unsigned log got a signature".into()))
            }
        }

        if !self.consumer.validate(&message.payload) {
            return Err(LogError::Validation("payload rejected".into()));
        }
        Ok(())
    }

    /// Deduplicate, check dependencies, apply and commit one validated message.
    async fn process(
        &self,
        state: &mut LogState<P>,
        signed: SignedMessage<P>,
    ) -> Result<Outcome<C::Output>> {
        let mut txn = self.store.write().await?;
        let id = signed.id;

        if txn.contains(id.as_bytes())? {
            return Ok(Outcome::Duplicate);
        }
        if state.mempool.contains(&id) {
            return Ok(Outcome::Pending);
        }

        let mut missing = BTreeSet::new();
        for parent in &signed.message.parents {
            if !txn.contains(parent.as_bytes())? {
                missing.insert(*parent);
            }
        }
        if !missing.is_empty() {
            debug!(topic = %self.config.topic, %id, missing = missing.len(), "message waiting for parents");
            state.mempool.insert(id, signed, missing);
            return Ok(Outcome::Pending);
        }

        let result = self
            .consumer
            .apply(&id, signed.signature.as_ref(), &signed.message)
            .await
            .map_err(LogError::Apply)?;

        txn.set(id.as_bytes(), &signed.value)?;
        if self.config.sequencing {
            state.frontier.stage(&mut txn, &id, &signed.message.parents)?;
        }
        let root = txn.commit()?;
        if self.config.sequencing {
            state.frontier.update(id, &signed.message.parents);
        }

        debug!(topic = %self.config.topic, %id, root = %root.hash.short(), "committed");
        let _ = self.events.send(LogEvent::Message {
            id,
            signature: signed.signature,
            message: signed.message,
            result: result.clone(),
        });
        let _ = self.events.send(LogEvent::Commit { root: root.hash });
        Ok(Outcome::Committed(result))
    }

    /// Commit everything that was only waiting for `committed`, transitively.
    /// Returns how many messages were committed.
    async fn release(&self, state: &mut LogState<P>, committed: Id) -> Result<usize> {
        let mut work: VecDeque<SignedMessage<P>> = state
            .mempool
            .resolve(&committed)
            .into_iter()
            .map(|(_, signed)| signed)
            .collect();
        let mut released = 0;

        while let Some(signed) = work.pop_front() {
            let id = signed.id;
            match self.process(state, signed).await {
                Ok(Outcome::Committed(_)) => {
                    released += 1;
                    work.extend(state.mempool.resolve(&id).into_iter().map(|(_, s)| s));
                }
                Ok(_) => {}
                Err(LogError::Apply(err)) => {
                    warn!(topic = %self.config.topic, %id, error = %err, "released message not applied");
                }
                Err(err) => return Err(err),
            }
        }

        if released > 0 {
            debug!(topic = %self.config.topic, released, "mempool released");
        }
        Ok(released)
    }
}

fn decode_synced<P: Payload>(key: &[u8], value: Vec<u8>) -> Result<SignedMessage<P>> {
    let protocol = |msg: String| LogError::SyncProtocol(SyncError::Protocol(msg));
    let id = Id::decode(key).map_err(|e| protocol(e.to_string()))?;
    let signed = SignedMessage::decode(value).map_err(|e| protocol(e.to_string()))?;
    if signed.id != id {
        return Err(protocol(format!("entry {} does not match its key", id)));
    }
    Ok(signed)
}

fn id_bound(bound: Bound<Id>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(id) => Bound::Included(id.as_bytes().to_vec()),
        Bound::Excluded(id) => Bound::Excluded(id.as_bytes().to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
