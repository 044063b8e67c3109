//! Multi-room Chat Relay Library
//!
//! A line-oriented TCP chat relay built on tokio using the Actor
//! pattern for room state and message routing.
//!
//! # Features
//! - Registration and login with Argon2-hashed secrets
//! - Multiple named rooms with join/leave/create/delete
//! - Room broadcasts with a total order per room
//! - Direct messages between online users
//! - Chunked file transfers reassembled at declared offsets
//! - Slash commands or JSON lines on the same connection
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning the online-user directory
//! - Each room is its own actor with a private queue
//! - Each connection has a `handler` task with a bounded outbound mailbox
//! - A full mailbox drops messages and evicts the member from its rooms
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use chat_relay::{handle_connection, Argon2Store, Context, DiskStore, Hub, Reassembler, RoomDirectory, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(ServerConfig::from_env());
//!     let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
//!     let transfers = Arc::new(Reassembler::new(Arc::new(DiskStore::new(&config.download_dir))));
//!     let directory = Arc::new(RoomDirectory::new(config.room_queue_capacity));
//!     let (hub_tx, hub_rx) = mpsc::channel(config.hub_queue_capacity);
//!
//!     tokio::spawn(Hub::new(hub_rx, directory, transfers.clone()).run());
//!
//!     let ctx = Context { hub: hub_tx, credentials: Arc::new(Argon2Store::new()), transfers, config };
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, ctx.clone()));
//!     }
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod command;
pub mod config;
pub mod directory;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod room;
pub mod session;
pub mod storage;
pub mod transfer;
pub mod types;

// Re-export main types for convenience
pub use auth::{Argon2Store, CredentialStore};
pub use config::ServerConfig;
pub use directory::RoomDirectory;
pub use error::{AppError, ErrorKind};
pub use handler::{handle_connection, Context};
pub use hub::{Hub, HubCommand};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use room::RoomHandle;
pub use session::{Delivery, Session};
pub use storage::{ContentStore, DiskStore, MemoryStore};
pub use transfer::Reassembler;
pub use types::SessionId;
