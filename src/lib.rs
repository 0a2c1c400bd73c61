//! # cart-surface-bridge
//!
//! Control-surface synchronization core for a desktop audio-cart
//! application: the bidirectional real-time link between the host and its
//! external hardware-button clients.
//!
//! The host embeds [`SurfaceServer`], feeds it authoritative domain events
//! through [`ServerHandle::ingest`], and receives surface commands on a
//! [`DomainCommand`] channel. Surface clients embed [`SurfaceClient`], which
//! owns the connect/retry/backoff lifecycle and an optimistic local state
//! mirror.
//!
//! ```ignore
//! use cart_surface_bridge::{ActionTable, BridgeConfig, DomainEvent, SurfaceServer};
//!
//! #[tokio::main]
//! async fn main() -> cart_surface_bridge::Result<()> {
//!     let config = BridgeConfig::load()?;
//!     let (domain_tx, mut domain_rx) = tokio::sync::mpsc::channel(64);
//!     let server = SurfaceServer::start(&config, ActionTable::with_builtin(), domain_tx).await?;
//!
//!     // Surface commands flow out to the audio engine...
//!     tokio::spawn(async move {
//!         while let Some(cmd) = domain_rx.recv().await {
//!             println!("surface requested {cmd:?}");
//!         }
//!     });
//!
//!     // ...and authoritative domain events flow back in.
//!     server.ingest(DomainEvent::PlaybackChanged { is_playing: true }).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;
pub mod state;

pub use client::{ClientConfig, ClientHandle, LinkStatus, RetryPolicy, SurfaceClient};
pub use config::BridgeConfig;
pub use dispatch::{ActionTable, DomainCommand, HandlerCtx};
pub use error::Error;
pub use protocol::{Envelope, ErrorCode, KeepAlive};
pub use server::{ServerHandle, SurfaceServer};
pub use state::{ControlSurfaceState, DomainEvent, Song};

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
