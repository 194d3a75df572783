//! TCP server for client requests and peer notifications.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_message, write_message, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// TCP server dispatching framed messages to a [`MessageHandler`].
pub struct NetworkServer {
    listener: TcpListener,

    local_addr: SocketAddr,

    handler: Arc<dyn MessageHandler>,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind the listening socket. The server does not accept connections
    /// until [`run`](Self::run) is called.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr).await.map_err(NetworkError::Io)?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            local_addr,
            handler,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(addr = %self.local_addr, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let _ = stream.set_nodelay(true);

        while let Some(msg) = read_message(&mut stream).await? {
            if let Some(response) = handler.handle(msg).await {
                write_message(&mut stream, &response).await?;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{CacheReply, CacheRequest};

    struct StatusHandler;

    #[async_trait]
    impl MessageHandler for StatusHandler {
        async fn handle(&self, msg: Message) -> Option<Message> {
            match msg {
                Message::Request { request_id, .. } => Some(Message::Response {
                    request_id,
                    result: Ok(CacheReply::Empty),
                }),
                Message::Response { .. } => None,
            }
        }
    }

    #[tokio::test]
    async fn test_server_answers_requests() {
        let (server, shutdown_tx) =
            NetworkServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(StatusHandler))
                .await
                .unwrap();
        let addr = server.local_addr();
        let server_handle = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = Message::Request {
            request_id: 11,
            request: CacheRequest::Status,
        };
        write_message(&mut stream, &request).await.unwrap();

        match read_message(&mut stream).await.unwrap() {
            Some(Message::Response {
                request_id: 11,
                result: Ok(CacheReply::Empty),
            }) => {}
            other => panic!("unexpected response: {:?}", other),
        }

        let _ = shutdown_tx.send(()).await;
        assert!(server_handle.await.unwrap().is_ok());
    }
}
