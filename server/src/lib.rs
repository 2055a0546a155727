//! # Dispatch Server Library
//!
//! Session and packet dispatch engine for an authoritative multiplayer game
//! server. It accepts connections, admits players, sorts inbound traffic by
//! urgency, runs every handler on one main loop and sends world updates only
//! to the connections that can perceive them.
//!
//! ## Architecture
//!
//! ### Receive path
//! Network tasks never touch session state. Each datagram goes through
//! [`triage::InboundTriage`], which reads the opcode, refuses traffic the
//! connection may not send yet and copies the frame into a pooled
//! [`envelope::PacketEnvelope`]. Envelopes land in one of three stores:
//! priority (drained in full each tick), coalescing (only the newest position
//! update per player survives) and bulk (drained within a time budget).
//!
//! ### Main loop
//! [`engine::Engine`] owns the connection table, admission queue, security
//! checks, simulation and broadcast outbox. Each tick it drains the stores in
//! that order, dispatching through the [`registry::MessageTypeRegistry`] to
//! one [`handlers::Handler`] per opcode. Handler failures are per-message
//! `Result`s; a malformed payload kicks its sender and nothing else.
//!
//! ### Outbound path
//! Handlers and the simulation push [`broadcast::Broadcast`]s into the tick
//! outbox. At the end of the tick the [`broadcast::RelevanceBroadcaster`]
//! delivers each one to the connections with a live player whose area of
//! interest covers it.
//!
//! ### Hooks
//! [`hooks::Hook`]s registered with the engine are ticked after the
//! simulation. A hook that errors or panics is logged and isolated from the
//! rest of the tick.
//!
//! ### Overload
//! [`governor::OverloadGovernor`] watches whether the network work fits its
//! budget and puts the server into a degraded mode that refuses new logins.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::admission::{LoginAdmission, OpenAuthenticator};
//! use server::config::ServerConfig;
//! use server::engine::{Engine, Inbound};
//! use server::network::UdpTransport;
//! use server::simulation::IdleWorld;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let inbound = Inbound::new(&config);
//!     let transport = UdpTransport::bind(
//!         &config.bind_address,
//!         inbound.triage(),
//!         config.session.probe_interval(),
//!     )
//!     .await?;
//!     let admission = LoginAdmission::from_config(
//!         &config.admission,
//!         Box::new(OpenAuthenticator::new()),
//!     )?;
//!
//!     let mut engine = Engine::new(
//!         config,
//!         inbound,
//!         transport,
//!         Box::new(IdleWorld::default()),
//!         admission,
//!     );
//!     engine.run().await;
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod admission;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod governor;
pub mod handlers;
pub mod hooks;
pub mod network;
pub mod registry;
pub mod security;
pub mod simulation;
pub mod text_filter;
pub mod transport;
pub mod triage;
