//! Signalling relay for PokeChess peers.
//!
//! The relay lets peers find each other by id and forwards frames between
//! them. [`RelayConnector`] plugs it into `pokechess-session` as a
//! [`TransportFactory`](pokechess_session::TransportFactory).

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use client::{RelayConnector, RelayTransport};
pub use config::{RelayConfig, RelayConfigError};
pub use protocol::{ClientFrame, ServerFrame};
