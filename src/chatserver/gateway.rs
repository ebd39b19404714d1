// Connection gateway: TCP listener, auth handshake, presence lifecycle
//
// Per-connection state machine: Connecting -> Authenticated -> Open ->
// Closed. The first frame must authenticate within the deadline or the
// transport is torn down without further processing.

use crate::chatserver::connection::{pump_connection_stream, ConnectionRegistry, LiveConnection};
use crate::chatserver::presence::PresenceDirectory;
use crate::chatserver::protocol::{ClientEvent, ServerEvent};
use crate::chatserver::router::{DeliveryRouter, RouterCommand, RouterHandle};
use crate::chatserver::session::SessionManager;
use crate::chatserver::store::ChatStore;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// A running chat server: listener, registry, and routing task.
pub struct ChatServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    router_handle: RouterHandle,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl ChatServer {
    /// Bind the listener and spawn the router and accept loop.
    pub async fn start(
        listen: SocketAddr,
        store: Arc<ChatStore>,
        sessions: Arc<SessionManager>,
        presence: PresenceDirectory,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind {}", listen))?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let (router, router_handle) =
            DeliveryRouter::new(store, presence.clone(), registry.clone());

        tokio::spawn(router.run());

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

        let accept_registry = registry.clone();
        let accept_router = router_handle.clone();
        tokio::spawn(async move {
            tracing::info!("Listening on {}", local_addr);

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tracing::debug!("Transport handshake from {}", peer);
                                let registry = accept_registry.clone();
                                let sessions = sessions.clone();
                                let presence = presence.clone();
                                let router = accept_router.clone();

                                // One lightweight task per connection; a
                                // failure in one never reaches the others.
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(
                                        stream, registry, sessions, presence, router,
                                    )
                                    .await
                                    {
                                        tracing::error!("Connection error from {}: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            registry,
            router_handle,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.router_handle
            .send_command(RouterCommand::Shutdown)
            .context("Failed to send router shutdown")?;
        self.shutdown_tx
            .send(())
            .context("Failed to send listener shutdown")?;
        Ok(())
    }
}

/// Drive one connection from handshake to teardown.
async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
    presence: PresenceDirectory,
    router: RouterHandle,
) -> Result<()> {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

    let pump = tokio::spawn(pump_connection_stream(stream, outgoing_rx, incoming_tx));

    // Connecting: the first frame must be a valid session reference.
    let user_id = match authenticate(&sessions, &mut incoming_rx).await {
        Some(user_id) => user_id,
        None => {
            // Terminal: flush the rejection and drop the transport.
            let _ = outgoing_tx.send(ServerEvent::Error {
                message: "authentication required".to_string(),
            });
            drop(outgoing_tx);
            pump.abort();
            return Ok(());
        }
    };

    // Authenticated: register the duplex channel and bind presence.
    let connection = LiveConnection::new(user_id, outgoing_tx.clone());
    let handle = registry.register(connection).await;
    presence.bind(user_id, &handle).await;

    let _ = outgoing_tx.send(ServerEvent::AuthOk { user_id });
    tracing::info!("User {} open on connection {}", user_id, handle);

    // Open: inbound events route, outbound pushes flow through the registry.
    while let Some(event) = incoming_rx.recv().await {
        match event {
            ClientEvent::SendMsg {
                receiver_id,
                content,
                kind,
            } => {
                if router
                    .send_command(RouterCommand::SendMessage {
                        sender_id: user_id,
                        sender_handle: handle.clone(),
                        receiver_id,
                        content,
                        kind,
                    })
                    .is_err()
                {
                    break;
                }
            }
            ClientEvent::FetchHistory {
                conversation_id,
                limit,
            } => {
                if router
                    .send_command(RouterCommand::FetchHistory {
                        user_id,
                        handle: handle.clone(),
                        conversation_id,
                        limit,
                    })
                    .is_err()
                {
                    break;
                }
            }
            ClientEvent::Ping => {
                if outgoing_tx.send(ServerEvent::Pong).is_err() {
                    break;
                }
            }
            ClientEvent::Auth { .. } | ClientEvent::Login { .. } => {
                tracing::warn!("Duplicate auth on open connection {}", handle);
            }
        }
    }

    // Closed: deregister, then release the binding only if it is still ours.
    registry.deregister(&handle).await;
    presence.unbind_handle(user_id, &handle).await;
    tracing::info!("User {} closed connection {}", user_id, handle);

    Ok(())
}

/// Resolve the first frame to an authenticated identity, or None if it is
/// missing, late, or invalid.
async fn authenticate(
    sessions: &SessionManager,
    incoming_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Option<i64> {
    let first = tokio::time::timeout(AUTH_DEADLINE, incoming_rx.recv())
        .await
        .ok()??;

    match first {
        ClientEvent::Auth { token } => match sessions.resolve(&token).await {
            Some(user_id) => Some(user_id),
            None => {
                tracing::warn!("Rejected connection: unknown session token");
                None
            }
        },
        ClientEvent::Login { username, password } => {
            match sessions.login(&username, &password).await {
                Ok((user_id, _token)) => Some(user_id),
                Err(e) => {
                    tracing::warn!("Rejected login for '{}': {}", username, e);
                    None
                }
            }
        }
        other => {
            tracing::warn!("Rejected connection: first frame was {:?}", other);
            None
        }
    }
}
