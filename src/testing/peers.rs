//! Peer connections that record notifications instead of sending them.

use crate::cluster::{PeerClient, PeerConnector, PeerEndpoint, ReplyReceiver};
use crate::error::{Error, NetworkError, RemoteError, RemoteErrorKind, Result};
use crate::network::{CacheReply, CacheRequest};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// How a [`RecordingPeer`] answers the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge.
    Ack,
    /// Answer with an error.
    Fail,
    /// Drop the reply sender without answering.
    Drop,
    /// Keep the reply sender and never answer.
    Hold,
    /// Refuse to dispatch the request.
    Reject,
}

/// A fake peer. Answers follow the script and default to [`AckMode::Ack`].
#[derive(Debug)]
pub struct RecordingPeer {
    endpoint: String,
    received: Mutex<Vec<CacheRequest>>,
    script: Mutex<VecDeque<AckMode>>,
    held: Mutex<Vec<oneshot::Sender<Result<CacheReply>>>>,
}

impl RecordingPeer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            received: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue answers for the next requests.
    pub fn script(&self, modes: impl IntoIterator<Item = AckMode>) {
        self.script.lock().extend(modes);
    }

    /// Requests dispatched to this peer, in order. Rejected ones are not
    /// recorded.
    pub fn received(&self) -> Vec<CacheRequest> {
        self.received.lock().clone()
    }
}

impl PeerClient for RecordingPeer {
    fn submit(&self, request: CacheRequest) -> Result<ReplyReceiver> {
        let mode = self.script.lock().pop_front().unwrap_or(AckMode::Ack);
        if mode == AckMode::Reject {
            return Err(NetworkError::SendFailed(format!("{}: rejected", self.endpoint)).into());
        }

        self.received.lock().push(request);
        let (tx, rx) = oneshot::channel();
        match mode {
            AckMode::Ack => {
                let _ = tx.send(Ok(CacheReply::Empty));
            }
            AckMode::Fail => {
                let _ = tx.send(Err(Error::Remote(RemoteError {
                    kind: RemoteErrorKind::Internal,
                    message: "scripted failure".to_string(),
                    code: 0,
                    raiser: self.endpoint.clone(),
                })));
            }
            AckMode::Hold => self.held.lock().push(tx),
            AckMode::Drop | AckMode::Reject => drop(tx),
        }
        Ok(rx)
    }
}

/// Hands out one [`RecordingPeer`] per endpoint and remembers them.
#[derive(Debug, Default)]
pub struct RecordingConnector {
    peers: Mutex<HashMap<String, Arc<RecordingPeer>>>,
    connects: AtomicUsize,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(&self, endpoint: &str) -> Option<Arc<RecordingPeer>> {
        self.peers.lock().get(endpoint).cloned()
    }

    /// Number of connections created.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl PeerConnector for RecordingConnector {
    fn connect(&self, endpoint: &PeerEndpoint) -> Result<Arc<dyn PeerClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let peer = self
            .peers
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RecordingPeer::new(endpoint.to_string())))
            .clone();
        Ok(peer)
    }
}
