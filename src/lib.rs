//! Callbridge - pairs two browser peers per room, relays their WebRTC
//! negotiation, and proxies translation and speech-token calls so the
//! upstream credentials never leave the server.

pub mod config;
pub mod error;
pub mod http_server;
pub mod protocol;
pub mod rooms;
pub mod signaling;
pub mod single_flight;
pub mod state;
pub mod token;
pub mod translate;

pub use config::{Config, ConfigError};
pub use error::{AppError, ErrorKind};
pub use state::AppState;
