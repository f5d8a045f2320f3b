//! Error taxonomy for bridge and channel sessions.

use std::io;
use std::net::SocketAddr;

use serde::Serialize;

/// Error code surfaced in logs and close notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "401")]
    AuthRequired,
    #[serde(rename = "401.2")]
    AuthFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "401",
            Self::AuthFailed => "401.2",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed or out-of-sequence command before authentication.
    #[error("Authorization required! ({reason})")]
    ProtocolViolation { reason: String },

    #[error("Authorization failed!")]
    AuthenticationFailure,

    #[error("Authorization required! (no credentials within deadline)")]
    AuthenticationTimeout,

    /// The channel port is held by someone else. Fatal to the owning bridge only.
    #[error("channel port {addr} already in use")]
    ListenerBindConflict {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Any other channel bind failure. Escalated to the process boundary.
    #[error("failed to bind channel listener on {addr}")]
    ChannelBindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("bridge connection error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::ProtocolViolation { .. } | Self::AuthenticationTimeout => {
                Some(ErrorCode::AuthRequired)
            }
            Self::AuthenticationFailure => Some(ErrorCode::AuthFailed),
            _ => None,
        }
    }

    /// True when the failure must not stay contained in the session that hit it.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Self::ChannelBindFailed { .. })
    }
}

/// Failures that end the whole bridge server rather than a single session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind bridge listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("bridge {bridge} hit an unrecoverable error")]
    Session {
        bridge: u64,
        #[source]
        source: BridgeError,
    },

    #[error("bridge session task panicked: {0}")]
    SessionPanicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid address {0}")]
    InvalidAddress(String),
}
