//! Encrypting WebSocket transport: wraps every outbound frame in the AEAD
//! envelope from `crypto.rs` and symmetrically unwraps every inbound frame.
//! Frames that fail authentication are dropped with a warning and never
//! reach the Shared Document.
//!
//! Grounded on `examples/other_examples/c8d38162_vauchi-desktop__src-tauri-src-commands-sync.rs.rs`'s
//! timeout-guarded connect/send/receive phases and fail-closed drain loop.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::crypto::{self, CryptoError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to relay timed out")]
    ConnectTimeout,
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay closed the connection")]
    Closed,
}

/// A websocket connection to the relay with every frame AEAD-sealed under
/// the room's derived encryption key.
pub struct EncryptingTransport<S> {
    ws: WebSocketStream<S>,
    key: [u8; 32],
}

impl EncryptingTransport<MaybeTlsStream<TcpStream>> {
    pub async fn connect(url: &str, key: [u8; 32]) -> Result<Self, TransportError> {
        let connect = tokio_tungstenite::connect_async(url);
        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        Ok(Self { ws, key })
    }
}

impl<S> EncryptingTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn from_stream(ws: WebSocketStream<S>, key: [u8; 32]) -> Self {
        Self { ws, key }
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        let sealed = crypto::seal_frame(&self.key, plaintext);
        self.ws.send(Message::Binary(sealed)).await?;
        Ok(())
    }

    /// Read the next application frame, transparently answering pings and
    /// dropping any frame that fails to authenticate. Returns `Ok(None)` on
    /// a clean close.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let message = match self.ws.next().await {
                Some(m) => m?,
                None => return Ok(None),
            };
            match message {
                Message::Binary(bytes) => match crypto::open_frame(&self.key, &bytes) {
                    Ok(plaintext) => return Ok(Some(plaintext)),
                    Err(CryptoError::AuthenticationFailed) | Err(CryptoError::FrameTooShort) => {
                        tracing::warn!("dropping frame that failed to authenticate");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed frame");
                        continue;
                    }
                },
                Message::Ping(payload) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                    continue;
                }
                Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
                Message::Text(_) | Message::Frame(_) => continue,
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_encryption_key;

    async fn connected_pair(key: [u8; 32]) -> (
        EncryptingTransport<tokio::io::DuplexStream>,
        EncryptingTransport<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client_fut = tokio_tungstenite::client_async("ws://local/room", client_io);
        let server_fut = tokio_tungstenite::accept_async(server_io);
        let (client_res, server_res) = tokio::join!(client_fut, server_fut);
        let (client_ws, _) = client_res.unwrap();
        let server_ws = server_res.unwrap();
        (
            EncryptingTransport::from_stream(client_ws, key),
            EncryptingTransport::from_stream(server_ws, key),
        )
    }

    #[tokio::test]
    async fn send_and_recv_round_trips_plaintext() {
        let key = derive_encryption_key("room-1", "correct-horse", 1000).unwrap();
        let (mut client, mut server) = connected_pair(key).await;

        client.send(b"hello relay").await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received, b"hello relay");
    }

    #[tokio::test]
    async fn corrupt_frame_never_reaches_the_caller() {
        let key = derive_encryption_key("room-1", "correct-horse", 1000).unwrap();
        let (mut client, mut server) = connected_pair(key).await;

        // Send one corrupt raw binary frame, then a real one; recv() must skip
        // the corrupt frame silently and return the next valid payload.
        client
            .ws
            .send(Message::Binary(vec![0u8; 4]))
            .await
            .unwrap();
        client.send(b"still works").await.unwrap();

        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received, b"still works");
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let key = derive_encryption_key("room-1", "correct-horse", 1000).unwrap();
        let (mut client, mut server) = connected_pair(key).await;
        client.close().await.unwrap();
        assert!(server.recv().await.unwrap().is_none());
    }
}
