//! Request/response framing for the sync protocol.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes of
//! JSON. A client sends one [`Request`] and waits for exactly one
//! [`Response`] before sending the next, so no request ids are needed.

use crate::node::Node;
use crate::store::ReadTransaction;
use crate::syncer::{Server, Source, SyncError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Largest frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Prefix of the stream protocol name. The log topic is appended.
pub const PROTOCOL_PREFIX: &str = "/thicket/sync/v1/";

/// Stream protocol name for a topic.
pub fn protocol_name(topic: &str) -> String {
    format!("{}{}", PROTOCOL_PREFIX, topic)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Request {
    Root,
    Node {
        level: u8,
        #[serde(with = "crate::node::hex_bytes")]
        key: Vec<u8>,
    },
    Children {
        level: u8,
        #[serde(with = "crate::node::hex_bytes")]
        key: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    Root(Node),
    Node(Option<Node>),
    Children(Vec<Node>),
    Error(String),
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), SyncError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "outgoing frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// Returns `None` if the stream ends cleanly before a new frame starts.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, SyncError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if size > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit",
            size
        )));
    }
    let mut buffer = vec![0u8; size];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

/// A [`Source`] that forwards queries to a remote [`serve`] loop.
pub struct Client<S> {
    stream: S,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Client { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn call(&mut self, request: Request) -> Result<Response, SyncError> {
        trace!(?request, "sync request");
        write_frame(&mut self.stream, &request).await?;
        match read_frame(&mut self.stream).await? {
            Some(Response::Error(msg)) => Err(SyncError::Remote(msg)),
            Some(response) => Ok(response),
            None => Err(SyncError::Closed),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> SyncError {
    SyncError::Protocol(format!("expected {} response, got {:?}", expected, got))
}

#[async_trait]
impl<S> Source for Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn root(&mut self) -> Result<Node, SyncError> {
        match self.call(Request::Root).await? {
            Response::Root(node) => Ok(node),
            other => Err(unexpected("root", &other)),
        }
    }

    async fn node(&mut self, level: u8, key: &[u8]) -> Result<Option<Node>, SyncError> {
        let request = Request::Node {
            level,
            key: key.to_vec(),
        };
        match self.call(request).await? {
            Response::Node(node) => Ok(node),
            other => Err(unexpected("node", &other)),
        }
    }

    async fn children(&mut self, level: u8, key: &[u8]) -> Result<Vec<Node>, SyncError> {
        let request = Request::Children {
            level,
            key: key.to_vec(),
        };
        match self.call(request).await? {
            Response::Children(children) => Ok(children),
            other => Err(unexpected("children", &other)),
        }
    }
}

/// Answer requests on `stream` from `server` until the peer closes it.
///
/// Returns the number of requests served.
pub async fn serve<S, T>(server: &Server<T>, mut stream: S) -> Result<usize, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: ReadTransaction,
{
    let mut served = 0;
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = server.handle(request);
        write_frame(&mut stream, &response).await?;
        served += 1;
    }
    debug!(served, "sync stream closed");
    Ok(served)
}
