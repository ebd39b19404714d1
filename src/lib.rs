//! courier - Real-time direct-messaging server
//!
//! This library provides the presence-routing and message-delivery core:
//! a connection gateway over TCP, a single-authority delivery router,
//! SQLite persistence for conversations and messages, and a presence
//! directory with interchangeable Redis and in-process backends.

pub mod chatserver;

pub use chatserver::{ChatServer, ChatStore, PresenceDirectory, SessionManager};
