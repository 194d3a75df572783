//! Outbound RPC connections.

use crate::cluster::{PeerClient, PeerConnector, PeerEndpoint, ReplyReceiver};
use crate::config::ClusterConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_message, write_message, CacheReply, CacheRequest, Message};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Connection settings for [`RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Time allowed for writing a request and reading its response.
    pub request_timeout: Duration,
    /// Requests that may wait for the connection before submits fail.
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            queue_depth: 1024,
        }
    }
}

impl From<&ClusterConfig> for ClientConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.notify_timeout,
            queue_depth: config.queue_depth.max(1),
        }
    }
}

struct Outbound {
    request_id: u64,
    request: CacheRequest,
    reply: oneshot::Sender<Result<CacheReply>>,
}

/// Client for one remote node.
///
/// Requests are queued and sent one at a time over a single connection that
/// is opened on first use and reopened after a failure. The connection task
/// exits once the client is dropped.
pub struct RpcClient {
    endpoint: String,
    tx: mpsc::Sender<Outbound>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `endpoint`. Must be called within a tokio runtime.
    pub fn new(endpoint: impl Into<String>, config: ClientConfig) -> Self {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        tokio::spawn(run_connection(endpoint.clone(), config, rx));

        Self {
            endpoint,
            tx,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue a request. Fails immediately if the queue is full or the
    /// connection task is gone.
    pub fn submit(&self, request: CacheRequest) -> Result<ReplyReceiver> {
        let (reply, rx) = oneshot::channel();
        let outbound = Outbound {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            request,
            reply,
        };

        self.tx.try_send(outbound).map_err(|e| {
            NetworkError::SendFailed(format!("{}: request queue unavailable: {}", self.endpoint, e))
        })?;
        Ok(rx)
    }

    /// Send a request and wait for its reply.
    pub async fn call(&self, request: CacheRequest) -> Result<CacheReply> {
        self.submit(request)?
            .await
            .map_err(|_| Error::Network(NetworkError::ConnectionClosed))?
    }
}

impl PeerClient for RpcClient {
    fn submit(&self, request: CacheRequest) -> Result<ReplyReceiver> {
        RpcClient::submit(self, request)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

async fn run_connection(endpoint: String, config: ClientConfig, mut rx: mpsc::Receiver<Outbound>) {
    let mut stream: Option<TcpStream> = None;

    while let Some(outbound) = rx.recv().await {
        // The caller already gave up on this one.
        if outbound.reply.is_closed() {
            trace!(endpoint = %endpoint, request_id = outbound.request_id, "Skipping abandoned request");
            continue;
        }

        if stream.is_none() {
            match connect(&endpoint, config.connect_timeout).await {
                Ok(s) => stream = Some(s),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Failed to connect");
                    let _ = outbound.reply.send(Err(e));
                    continue;
                }
            }
        }

        let Some(conn) = stream.as_mut() else {
            continue;
        };

        let result = match tokio::time::timeout(
            config.request_timeout,
            exchange(conn, outbound.request_id, outbound.request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        if let Err(e) = &result {
            if !matches!(e, Error::Remote(_)) {
                debug!(endpoint = %endpoint, error = %e, "Dropping connection after failure");
                stream = None;
            }
        }

        let _ = outbound.reply.send(result);
    }

    trace!(endpoint = %endpoint, "Connection task finished");
}

async fn connect(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| NetworkError::ConnectionFailed {
            addr: endpoint.to_string(),
            reason: "connect timed out".to_string(),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            addr: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn exchange(stream: &mut TcpStream, request_id: u64, request: CacheRequest) -> Result<CacheReply> {
    write_message(stream, &Message::Request { request_id, request }).await?;

    match read_message(stream).await? {
        Some(Message::Response {
            request_id: id,
            result,
        }) if id == request_id => result.map_err(Error::Remote),
        Some(_) => Err(NetworkError::ReceiveFailed("unexpected message".to_string()).into()),
        None => Err(NetworkError::ConnectionClosed.into()),
    }
}

/// [`PeerConnector`] opening [`RpcClient`]s over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: ClientConfig,
}

impl TcpConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl PeerConnector for TcpConnector {
    fn connect(&self, endpoint: &PeerEndpoint) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(RpcClient::new(endpoint.to_string(), self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::{MessageHandler, NetworkServer};
    use async_trait::async_trait;

    struct EchoStatus;

    #[async_trait]
    impl MessageHandler for EchoStatus {
        async fn handle(&self, msg: Message) -> Option<Message> {
            match msg {
                Message::Request { request_id, request } => Some(Message::Response {
                    request_id,
                    result: match request {
                        CacheRequest::Status => Ok(CacheReply::Status(Default::default())),
                        _ => Ok(CacheReply::Empty),
                    },
                }),
                Message::Response { .. } => None,
            }
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (server, shutdown_tx) =
            NetworkServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(EchoStatus))
                .await
                .unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());

        let client = RpcClient::new(addr.to_string(), ClientConfig::default());
        assert!(matches!(client.call(CacheRequest::Status).await, Ok(CacheReply::Status(_))));
        assert!(matches!(
            client.call(CacheRequest::RefreshCluster).await,
            Ok(CacheReply::Empty)
        ));

        let _ = shutdown_tx.send(()).await;
    }

    /// Accepts connections and reads whatever arrives, never answering.
    async fn silent_listener() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_abandoned_requests_are_not_sent() {
        let addr = silent_listener().await;
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(200),
            queue_depth: 8,
        };
        let client = RpcClient::new(addr.to_string(), config);

        let first = client.submit(CacheRequest::Status).unwrap();
        for _ in 0..5 {
            drop(client.submit(CacheRequest::Status).unwrap());
        }
        let last = client.submit(CacheRequest::Status).unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(first.await.unwrap(), Err(Error::Timeout)));
        assert!(matches!(last.await.unwrap(), Err(Error::Timeout)));

        // Only the two awaited requests spend a request timeout each.
        assert!(
            started.elapsed() < Duration::from_millis(900),
            "{:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_reply() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RpcClient::new(addr.to_string(), ClientConfig::default());
        let rx = client.submit(CacheRequest::Status).unwrap();
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::Network(NetworkError::ConnectionFailed { .. }))
        ));
    }
}
