//! Server message types
//!
//! The accept loops and external controllers talk to the server through one
//! channel, so the dispatcher owns all connection bookkeeping without locks.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::common::{ProxyError, Result};

/// Messages that can be sent to the server
#[derive(Debug)]
pub enum ServerMessage {
    /// A listener accepted a connection
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    /// Stop accepting and drain in-flight connections
    Shutdown,
}

/// Server control handle
#[derive(Debug, Clone)]
pub struct ServerHandle {
    sender: mpsc::Sender<ServerMessage>,
}

impl ServerHandle {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self { sender }
    }

    /// Send a message to the server
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProxyError::Other("Failed to send message to server".to_string()))
    }

    /// Ask the server to shut down gracefully
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ServerMessage::Shutdown).await
    }

    /// Whether the server has stopped receiving messages
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Create a new server message channel
pub fn create_channel() -> (ServerHandle, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(100);
    (ServerHandle::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_message() {
        let (handle, mut rx) = create_channel();
        handle.shutdown().await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Shutdown)));

        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.shutdown().await.is_err());
    }
}
