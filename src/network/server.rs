//! TCP server for incoming peer messages.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message, RemoteError};
use crate::types::PeerId;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and return the response.
    async fn handle(&self, msg: Message) -> Message;
}

/// TCP server for peer communication.
pub struct PeerServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    peer_id: PeerId,
}

impl PeerServer {
    /// Bind to `addr`. Port 0 picks a free port; see [`PeerServer::local_addr`].
    pub async fn bind(addr: SocketAddr, peer_id: PeerId) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        Ok(Self {
            listener,
            local_addr,
            peer_id,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, shutdown: CancellationToken) {
        info!(peer_id = self.peer_id, addr = %self.local_addr, "Peer server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            debug!(peer = %remote, "Accepted connection");
                            let handler = handler.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                let handled =
                                    Self::handle_connection(stream, handler, shutdown).await;
                                if let Err(e) = handled {
                                    debug!(peer = %remote, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(peer_id = self.peer_id, "Peer server shutting down");
                    break;
                }
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(
        self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(handler, shutdown))
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        loop {
            let msg = tokio::select! {
                frame = read_frame(&mut stream) => frame,
                _ = shutdown.cancelled() => return Ok(()),
            };
            let response = match msg {
                Ok(Some(msg)) => handler.handle(msg).await,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Answer once so the client does not wait, then hang up.
                    let reply = Message::Error(RemoteError::from(&e));
                    let _ = write_frame(&mut stream, &reply).await;
                    return Err(e);
                }
            };
            write_frame(&mut stream, &response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{PingRequest, PongResponse};

    struct PongHandler;

    #[async_trait]
    impl MessageHandler for PongHandler {
        async fn handle(&self, msg: Message) -> Message {
            match msg {
                Message::Ping(ping) => Message::Pong(PongResponse {
                    peer_id: 7,
                    addr: ping.addr,
                }),
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_server_answers_ping() {
        let server = PeerServer::bind("127.0.0.1:0".parse().unwrap(), 7)
            .await
            .unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let shutdown = CancellationToken::new();
        let handle = server.spawn(Arc::new(PongHandler), shutdown.clone());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..2 {
            let ping = Message::Ping(PingRequest {
                peer_id: 1,
                addr: "127.0.0.1:1".into(),
            });
            write_frame(&mut stream, &ping).await.unwrap();
            match read_frame(&mut stream).await.unwrap() {
                Some(Message::Pong(pong)) => assert_eq!(pong.peer_id, 7),
                other => panic!("unexpected reply {:?}", other),
            }
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
