// Live connection registry and per-connection stream pump

use crate::chatserver::protocol::{ClientEvent, ServerEvent};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// An open connection's server-side endpoint: the channel outbound pushes
/// travel through.
pub struct LiveConnection {
    pub handle: String,
    pub user_id: i64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl LiveConnection {
    pub fn new(user_id: i64, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            handle: Uuid::new_v4().to_string(),
            user_id,
            tx,
        }
    }

    pub fn push(&self, event: ServerEvent) -> Result<()> {
        self.tx
            .send(event)
            .context("Failed to push event to connection")
    }
}

/// All open connections, keyed by connection handle.
///
/// The handle is what the presence directory stores; a push to an unknown
/// handle is how "recipient offline" shows up after a stale lookup.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, LiveConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection: LiveConnection) -> String {
        let handle = connection.handle.clone();
        let mut connections = self.connections.write().await;
        connections.insert(handle.clone(), connection);
        tracing::info!("Connection {} registered", handle);
        handle
    }

    pub async fn deregister(&self, handle: &str) {
        let mut connections = self.connections.write().await;
        if connections.remove(handle).is_some() {
            tracing::info!("Connection {} deregistered", handle);
        }
    }

    /// Push an event to a specific connection. `false` means the handle is
    /// gone or its writer has shut down; callers treat that as offline.
    pub async fn push(&self, handle: &str, event: ServerEvent) -> bool {
        let connections = self.connections.read().await;
        match connections.get(handle) {
            Some(connection) => connection.push(event).is_ok(),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump a connection's transport: spawn a writer for outbound events and
/// read newline-delimited frames until EOF or error.
///
/// Garbled frames are logged and dropped; the connection survives them.
/// Returns when the transport is torn down. The writer task is aborted on
/// return, cancelling any in-flight push to this connection.
pub async fn pump_connection_stream(
    stream: TcpStream,
    mut outgoing_rx: mpsc::UnboundedReceiver<ServerEvent>,
    incoming_tx: mpsc::UnboundedSender<ClientEvent>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let write_task = tokio::spawn(async move {
        while let Some(event) = outgoing_rx.recv().await {
            if let Ok(bytes) = event.to_bytes() {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                match ClientEvent::from_bytes(trimmed.as_bytes()) {
                    Ok(event) => {
                        if incoming_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse client frame: {}", e);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error reading from connection: {}", e);
                break;
            }
        }
    }

    write_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_register_push_deregister() {
        let registry = ConnectionRegistry::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = LiveConnection::new(7, tx);
        let handle = registry.register(connection).await;

        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.push(&handle, ServerEvent::Pong).await);
        assert!(matches!(rx.recv().await, Some(ServerEvent::Pong)));

        registry.deregister(&handle).await;
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.push(&handle, ServerEvent::Pong).await);
    }

    #[tokio::test]
    async fn test_push_to_closed_receiver_reports_failure() {
        let registry = ConnectionRegistry::new();

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = registry.register(LiveConnection::new(7, tx)).await;

        assert!(!registry.push(&handle, ServerEvent::Pong).await);
    }
}
