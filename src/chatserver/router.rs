// Delivery router: persist first, then deliver to whoever is connected
//
// A single task owns all routing decisions. Every send is durable before any
// delivery attempt; delivery is a side effect of a persisted fact, never a
// substitute for it.

use crate::chatserver::connection::ConnectionRegistry;
use crate::chatserver::error::{ChatError, ChatResult};
use crate::chatserver::presence::PresenceDirectory;
use crate::chatserver::protocol::{
    DeliveryPayload, HistoryEntry, MessageKind, ServerEvent,
};
use crate::chatserver::store::{ChatStore, Order};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_HISTORY_PAGE: u32 = 50;

/// Handle for submitting commands to the router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    pub fn new(tx: mpsc::UnboundedSender<RouterCommand>) -> Self {
        Self { tx }
    }

    pub fn send_command(&self, cmd: RouterCommand) -> Result<()> {
        self.tx.send(cmd).context("Failed to send command to router")
    }
}

/// Commands the gateway feeds into the router.
#[derive(Debug)]
pub enum RouterCommand {
    /// An authenticated connection submitted a message.
    SendMessage {
        sender_id: i64,
        sender_handle: String,
        receiver_id: i64,
        content: String,
        kind: MessageKind,
    },
    /// An authenticated connection asked for a history page.
    FetchHistory {
        user_id: i64,
        handle: String,
        conversation_id: i64,
        limit: Option<u32>,
    },
    /// Shut the router down.
    Shutdown,
}

/// The routing task.
pub struct DeliveryRouter {
    store: Arc<ChatStore>,
    presence: PresenceDirectory,
    registry: Arc<ConnectionRegistry>,
    rx: mpsc::UnboundedReceiver<RouterCommand>,
}

impl DeliveryRouter {
    pub fn new(
        store: Arc<ChatStore>,
        presence: PresenceDirectory,
        registry: Arc<ConnectionRegistry>,
    ) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let router = Self {
            store,
            presence,
            registry,
            rx,
        };

        (router, RouterHandle::new(tx))
    }

    /// Run the router event loop. One failed command never kills the loop.
    pub async fn run(mut self) {
        tracing::info!("Delivery router started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                RouterCommand::SendMessage {
                    sender_id,
                    sender_handle,
                    receiver_id,
                    content,
                    kind,
                } => {
                    if let Err(e) = self
                        .handle_send(sender_id, &sender_handle, receiver_id, content, kind)
                        .await
                    {
                        self.report(&sender_handle, e).await;
                    }
                }
                RouterCommand::FetchHistory {
                    user_id,
                    handle,
                    conversation_id,
                    limit,
                } => {
                    if let Err(e) = self
                        .handle_history(user_id, &handle, conversation_id, limit)
                        .await
                    {
                        self.report(&handle, e).await;
                    }
                }
                RouterCommand::Shutdown => {
                    tracing::info!("Router shutting down");
                    break;
                }
            }
        }

        tracing::info!("Delivery router stopped");
    }

    /// Persist a message, then deliver to recipient (if connected) and echo
    /// to the sender.
    async fn handle_send(
        &self,
        sender_id: i64,
        sender_handle: &str,
        receiver_id: i64,
        content: String,
        kind: MessageKind,
    ) -> ChatResult<()> {
        // Invalid events are dropped without persistence.
        if receiver_id <= 0 || content.is_empty() {
            return Err(ChatError::Validation(
                "receiver and content are required".into(),
            ));
        }
        if receiver_id == sender_id {
            return Err(ChatError::Validation("cannot message yourself".into()));
        }

        let conversation = self
            .store
            .resolve_or_create_conversation(sender_id, receiver_id)?;

        // Durable before any delivery attempt.
        let message = self
            .store
            .append_message(conversation.id, sender_id, &content, kind)?;

        let payload = DeliveryPayload {
            conversation_id: conversation.id,
            sender_id,
            content,
            kind: kind.as_str().to_string(),
            timestamp: message.timestamp,
        };

        // Deliver to the recipient if a live binding exists. A failed push
        // means the handle went stale between lookup and delivery; treat as
        // offline and leave the message unread.
        if let Some(recipient_handle) = self.presence.lookup(receiver_id).await {
            let delivered = self
                .registry
                .push(&recipient_handle, ServerEvent::ReceiveMsg(payload.clone()))
                .await;

            if delivered {
                if let Err(e) = self.store.mark_single_read(message.id) {
                    tracing::error!("Failed to mark message {} read: {}", message.id, e);
                }
            } else {
                tracing::debug!(
                    "Recipient {} handle {} is stale, delivering on next fetch",
                    receiver_id,
                    recipient_handle
                );
            }
        }

        // Sender always gets the echo, online recipient or not.
        self.registry
            .push(sender_handle, ServerEvent::ReceiveMsg(payload))
            .await;

        Ok(())
    }

    /// Return a bounded ascending history page and mark the peer's messages
    /// read, the same way the HTTP history fetch does.
    async fn handle_history(
        &self,
        user_id: i64,
        handle: &str,
        conversation_id: i64,
        limit: Option<u32>,
    ) -> ChatResult<()> {
        if !self.store.is_participant(conversation_id, user_id)? {
            return Err(ChatError::Forbidden(
                "not part of this conversation".into(),
            ));
        }

        let limit = limit.unwrap_or(DEFAULT_HISTORY_PAGE);
        let messages = self
            .store
            .list_messages(conversation_id, limit, Order::OldestFirst)?;

        self.store.mark_read(conversation_id, user_id)?;

        let entries = messages
            .into_iter()
            .map(|m| HistoryEntry {
                sender_id: m.sender_id,
                content: m.content,
                kind: m.kind.as_str().to_string(),
                timestamp: m.timestamp,
            })
            .collect();

        self.registry
            .push(
                handle,
                ServerEvent::History {
                    conversation_id,
                    messages: entries,
                },
            )
            .await;

        Ok(())
    }

    /// Surface an operation failure to the initiating connection only.
    /// Presence failures never reach the user; validation drops are logged
    /// at debug, store failures at error.
    async fn report(&self, handle: &str, error: ChatError) {
        match &error {
            ChatError::Validation(reason) => {
                tracing::debug!("Dropped invalid event from {}: {}", handle, reason);
                return;
            }
            ChatError::Store(e) => {
                tracing::error!("Store failure while routing for {}: {}", handle, e);
            }
            other => {
                tracing::warn!("Routing error for {}: {}", handle, other);
            }
        }

        if error.is_user_visible() {
            self.registry
                .push(
                    handle,
                    ServerEvent::Error {
                        message: error.to_string(),
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatserver::connection::LiveConnection;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChatStore>,
        presence: PresenceDirectory,
        registry: Arc<ConnectionRegistry>,
        handle: RouterHandle,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(ChatStore::new(dir.path()).unwrap());
        let presence = PresenceDirectory::in_memory();
        let registry = Arc::new(ConnectionRegistry::new());

        let (router, handle) =
            DeliveryRouter::new(store.clone(), presence.clone(), registry.clone());
        tokio::spawn(router.run());

        Fixture {
            _dir: dir,
            store,
            presence,
            registry,
            handle,
        }
    }

    /// Register a fake connection for `user_id` and bind its presence.
    async fn connect(
        fx: &Fixture,
        user_id: i64,
    ) -> (String, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = fx.registry.register(LiveConnection::new(user_id, tx)).await;
        fx.presence.bind(user_id, &handle).await;
        (handle, rx)
    }

    fn expect_receive_msg(event: Option<ServerEvent>) -> DeliveryPayload {
        match event {
            Some(ServerEvent::ReceiveMsg(payload)) => payload,
            other => panic!("expected receive_msg, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_online_recipient_gets_push_and_read_flag() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();

        let (alice_handle, mut alice_rx) = connect(&fx, alice.id).await;
        let (_bob_handle, mut bob_rx) = connect(&fx, bob.id).await;

        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle,
                receiver_id: bob.id,
                content: "hi".to_string(),
                kind: MessageKind::Text,
            })
            .unwrap();

        let delivered = expect_receive_msg(bob_rx.recv().await);
        assert_eq!(delivered.sender_id, alice.id);
        assert_eq!(delivered.content, "hi");
        assert_eq!(delivered.kind, "text");

        let echo = expect_receive_msg(alice_rx.recv().await);
        assert_eq!(echo.conversation_id, delivered.conversation_id);

        // Online delivery implies immediate read.
        let page = fx
            .store
            .list_messages(delivered.conversation_id, 10, Order::OldestFirst)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].is_read);
    }

    #[tokio::test]
    async fn test_offline_recipient_still_persists_and_echoes() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();

        let (alice_handle, mut alice_rx) = connect(&fx, alice.id).await;
        // bob never connects

        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle,
                receiver_id: bob.id,
                content: "you there?".to_string(),
                kind: MessageKind::Text,
            })
            .unwrap();

        let echo = expect_receive_msg(alice_rx.recv().await);

        let page = fx
            .store
            .list_messages(echo.conversation_id, 10, Order::OldestFirst)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert!(!page[0].is_read);
    }

    #[tokio::test]
    async fn test_stale_presence_handle_degrades_to_offline() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();

        let (alice_handle, mut alice_rx) = connect(&fx, alice.id).await;
        // Presence points at a connection that no longer exists.
        fx.presence.bind(bob.id, "gone-handle").await;

        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle,
                receiver_id: bob.id,
                content: "hello?".to_string(),
                kind: MessageKind::Text,
            })
            .unwrap();

        // Echo still arrives, message stays unread.
        let echo = expect_receive_msg(alice_rx.recv().await);
        let page = fx
            .store
            .list_messages(echo.conversation_id, 10, Order::OldestFirst)
            .unwrap();
        assert!(!page[0].is_read);
    }

    #[tokio::test]
    async fn test_invalid_send_is_dropped_without_persistence() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();

        let (alice_handle, mut alice_rx) = connect(&fx, alice.id).await;

        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle.clone(),
                receiver_id: bob.id,
                content: String::new(),
                kind: MessageKind::Text,
            })
            .unwrap();
        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle.clone(),
                receiver_id: alice.id,
                content: "me".to_string(),
                kind: MessageKind::Text,
            })
            .unwrap();

        // A valid send afterwards proves the loop survived and nothing
        // earlier was persisted.
        fx.handle
            .send_command(RouterCommand::SendMessage {
                sender_id: alice.id,
                sender_handle: alice_handle,
                receiver_id: bob.id,
                content: "real".to_string(),
                kind: MessageKind::Text,
            })
            .unwrap();

        let echo = expect_receive_msg(alice_rx.recv().await);
        assert_eq!(echo.content, "real");

        let page = fx
            .store
            .list_messages(echo.conversation_id, 10, Order::OldestFirst)
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_history_marks_peer_messages_read() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();

        let (alice_handle, mut alice_rx) = connect(&fx, alice.id).await;

        // Two offline messages to bob, then bob connects and fetches.
        for content in ["one", "two"] {
            fx.handle
                .send_command(RouterCommand::SendMessage {
                    sender_id: alice.id,
                    sender_handle: alice_handle.clone(),
                    receiver_id: bob.id,
                    content: content.to_string(),
                    kind: MessageKind::Text,
                })
                .unwrap();
            expect_receive_msg(alice_rx.recv().await);
        }

        let (bob_handle, mut bob_rx) = connect(&fx, bob.id).await;
        let conversation = fx
            .store
            .resolve_or_create_conversation(alice.id, bob.id)
            .unwrap();

        fx.handle
            .send_command(RouterCommand::FetchHistory {
                user_id: bob.id,
                handle: bob_handle,
                conversation_id: conversation.id,
                limit: None,
            })
            .unwrap();

        match bob_rx.recv().await {
            Some(ServerEvent::History {
                conversation_id,
                messages,
            }) => {
                assert_eq!(conversation_id, conversation.id);
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].content, "one");
                assert_eq!(messages[1].content, "two");
            }
            other => panic!("expected history, got {:?}", other),
        }

        let page = fx
            .store
            .list_messages(conversation.id, 10, Order::OldestFirst)
            .unwrap();
        assert!(page.iter().all(|m| m.is_read));
    }

    #[tokio::test]
    async fn test_history_requires_participation() {
        let fx = fixture().await;
        let alice = fx.store.create_user("alice", "h").unwrap();
        let bob = fx.store.create_user("bob", "h").unwrap();
        let carol = fx.store.create_user("carol", "h").unwrap();

        let conversation = fx
            .store
            .resolve_or_create_conversation(alice.id, bob.id)
            .unwrap();

        let (carol_handle, mut carol_rx) = connect(&fx, carol.id).await;

        fx.handle
            .send_command(RouterCommand::FetchHistory {
                user_id: carol.id,
                handle: carol_handle,
                conversation_id: conversation.id,
                limit: None,
            })
            .unwrap();

        match carol_rx.recv().await {
            Some(ServerEvent::Error { message }) => {
                assert!(message.contains("forbidden"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }
}
