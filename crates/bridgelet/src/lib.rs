//! bridgelet: password-gated TCP bridge with a single-use relay channel.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod log_sink;
pub mod server;
pub mod session;
pub mod uid;

pub use client::BridgeClient;
pub use config::{ClientConfig, ServerConfig};
pub use error::{BridgeError, ConfigError, ErrorCode, ServerError};
pub use listener::BridgeListener;
pub use log_sink::{ChannelSink, LogSink, Severity, SharedSink, TracingSink};
pub use server::{serve, shutdown_signal};
pub use session::{BridgeSession, CloseCause, SessionClosed, SessionState};
pub use uid::{BridgeId, ChannelId, UidAllocator};

/// bridgelet version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
