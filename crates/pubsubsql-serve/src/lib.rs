//! PubSubSQL Serve - WebSocket transport for the pubsub engine
//!
//! This crate provides:
//! - JSON protocol messages for commands, replies and notification batches
//! - WebSocket server running one engine session per connection
//! - Async client with a row cursor over the current result

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientError};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{PubSubServer, ServerError};

pub use pubsubsql::{Engine, EngineConfig};
