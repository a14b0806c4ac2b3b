//! # Game Server Library
//!
//! This library provides the server-authoritative session core of the game
//! server: it accepts and authenticates clients, keeps each one's view of the
//! world in sync through delta-compressed snapshots, and delivers ordered
//! reliable commands over an unreliable datagram transport.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Every client slot follows a strict state machine:
//! FREE, CONNECTING, CHALLENGING, CONNECTED, PRIMED, ACTIVE and finally ZOMBIE
//! before the slot is FREE again. No state is ever skipped, and a client
//! only receives world snapshots once it has confirmed the current gamestate.
//!
//! ### Snapshot Delivery
//! Each tick produces one immutable snapshot shared by every client. A
//! client receives the difference between that snapshot and the last one it
//! acknowledged, or the full state when no acknowledged baseline exists.
//!
//! ### Reliable Commands
//! Text commands to a client are queued with contiguous indices and
//! repeated in every outbound datagram until the client acknowledges them.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick Driver
//! All session state lives in the [`driver::TickDriver`], which processes
//! datagrams and ticks strictly one at a time. Other tasks never touch
//! sessions; they schedule [`deferred::DeferredAction`]s that the driver
//! applies at the start of a tick.
//!
//! ### Pluggable Game Logic
//! The driver calls into a [`simulation::Simulation`] for join decisions,
//! frame updates, client commands and the entity list, and into a
//! [`policy::BanPolicy`] for address filtering. The bundled
//! [`game::GameState`] is a small platformer used by the server binary.
//!
//! ## Module Organization
//!
//! - `session`: per-slot state, state machine and acknowledgement tracking
//! - `reliable`: outbound reliable command queue
//! - `client_manager`: fixed slot table, allocation and timeout detection
//! - `driver`: the tick driver and datagram handling
//! - `deferred`: actions scheduled for a later tick
//! - `admin`: operator command registry
//! - `network`: async UDP shell around the driver
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::GameState;
//! use server::network::Server;
//! use server::policy::NoBans;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:27960".to_string(),
//!         ..ServerConfig::default()
//!     }
//!     .with_tick_rate(20);
//!
//!     // Runs until Ctrl+C, then drops every client with a final message
//!     let mut server = Server::new(config, GameState::new(), NoBans).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client_manager;
pub mod config;
pub mod deferred;
pub mod driver;
pub mod game;
pub mod network;
pub mod policy;
pub mod reliable;
pub mod session;
pub mod simulation;
