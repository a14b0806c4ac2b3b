//! # Game Client Library
//!
//! Headless client for the game server. It speaks the full session
//! protocol: the connect/challenge handshake, the sequenced channel with
//! fragment reassembly, reliable commands in both directions and snapshot
//! delta decoding against its own history of received snapshots.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Pure protocol state with no I/O, driven one datagram at a time. Tests and
//! tools can pair it directly with the server's tick driver.
//!
//! ### Network Module (`network`)
//! Async UDP loop that owns a socket and a [`connection::ServerConnection`],
//! sends one input frame per tick and retransmits the handshake until the
//! server answers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:27960", Duration::from_millis(50), 0).await?;
//!     client.queue_command("say hello");
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod network;
