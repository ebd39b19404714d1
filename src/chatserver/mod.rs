// Chat server module: presence routing and persisted message delivery
//
// Clients hold a newline-delimited JSON duplex connection. Every message is
// persisted before any delivery attempt; a presence directory maps user ids
// to live connection handles so delivery reaches 0, 1, or 2 connections.

pub mod connection;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;

pub use connection::{ConnectionRegistry, LiveConnection};
pub use error::{ChatError, ChatResult};
pub use gateway::ChatServer;
pub use presence::{MemoryPresence, PresenceDirectory, PresenceStore, RedisPresence};
pub use protocol::{ClientEvent, DeliveryPayload, MessageKind, ServerEvent};
pub use router::{DeliveryRouter, RouterCommand, RouterHandle};
pub use session::SessionManager;
pub use store::{ChatStore, Conversation, FriendSummary, Order, StoredMessage, User};
