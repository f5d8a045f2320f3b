//! Bridge control-connection wire format.
//!
//! # Architecture
//!
//! - **protocol**: Record types (Command, AuthRequest, AuthAck)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
