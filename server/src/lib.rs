//! # Space Server Library
//!
//! This library provides the authoritative server for shared 2D grid spaces.
//! Clients connect over WebSocket, join a space with a signed token, and then
//! move around the grid one cell at a time while seeing everyone else in the
//! same space move in real time.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Movement
//! The server owns every position. A move is accepted only when the target
//! cell lies inside the space and is exactly one orthogonal step away from
//! the mover's current cell. Accepted moves are confirmed to the mover and
//! broadcast to the rest of the room; rejected moves are answered with the
//! mover's unchanged position and nobody else hears about them.
//!
//! ### Room Membership
//! Every space with at least one connection has a live room. Joining admits
//! the connection, hands it a snapshot of its peers and announces it to them
//! in one step, so a peer is never reported twice or missed. Leaving does the
//! reverse, and a room disappears with its last occupant.
//!
//! ### Error Reporting
//! Protocol mistakes (bad tokens, unknown spaces, moves before joining,
//! malformed frames) are answered with an `error` frame and the connection
//! stays open. Only unexpected internal failures close it.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The per-connection state machine:
//! - Join: token verification, space lookup and random spawn
//! - Move: adjacency and bounds validation
//! - Disconnect: idempotent departure from the room
//!
//! ### Room Registry Module (`room_registry`)
//! The one piece of shared state: which connections are in which space,
//! where they stand and how to reach them. Delivery never blocks; a full
//! outbox drops the frame.
//!
//! ### Network Module (`network`)
//! WebSocket accept loop, per-connection reader loop and writer task.
//!
//! ### Collaborators (`auth`, `directory`, `config`)
//! Token verification, space metadata lookup and process configuration.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::JwtAuthenticator;
//! use server::directory::SpaceCatalog;
//! use server::network::Server;
//! use server::room_registry::RoomRegistry;
//! use server::session::Services;
//! use shared::Dimensions;
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let catalog = SpaceCatalog::new().with_space("lobby", Dimensions::new(20, 20).unwrap());
//!
//!     let services = Services {
//!         registry: Arc::new(RoomRegistry::new()),
//!         authenticator: Arc::new(JwtAuthenticator::new(b"secret")),
//!         directory: Arc::new(catalog),
//!     };
//!
//!     let capacity = NonZeroUsize::new(256).unwrap();
//!     let server = Server::bind("127.0.0.1:3001", services, capacity).await?;
//!     server.run().await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod network;
pub mod room_registry;
pub mod session;

pub use network::Server;
pub use room_registry::RoomRegistry;
pub use session::{Services, Session};
