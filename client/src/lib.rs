//! # Space Walker Client Library
//!
//! A headless client for the space server. It joins a space, keeps a local
//! view of everyone in it and wanders the grid one random step at a time.
//! It is used for development and load testing in place of a graphical
//! front end.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The client-side view of a space: own position, peers keyed by connection
//! id and the last error the server reported. It is never predicted; every
//! change comes from a server frame.
//!
//! ### Network Module (`network`)
//! The WebSocket connection and the request/reply plumbing:
//! - Request ids for correlating replies
//! - Folding every received frame into the view
//! - Random walks with confirmed/rejected counts
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Walker;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut walker = Walker::connect("ws://127.0.0.1:3001").await?;
//!     let spawn = walker.join("lobby", "<token>").await?;
//!     println!("spawned at {}", spawn);
//!
//!     let summary = walker.walk(10, Duration::from_millis(100)).await?;
//!     println!("{} steps accepted", summary.confirmed);
//!
//!     walker.close().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;

pub use game::SpaceView;
pub use network::{ClientError, WalkSummary, Walker};
