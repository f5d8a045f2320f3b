//! Wire types for the bridge control connection.
//!
//! Client sends `{"auth":{"password":"..."}}`, server answers `{"auth":true}`.
//! Anything else the server receives is classified, never rejected at decode
//! time, so the session can decide what a stray command means in its state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded bridge record. Always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(Map<String, Value>);

/// What a command asks for, independent of session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind<'a> {
    /// `auth` member present and truthy. `password` is set only when it is a string.
    Auth { password: Option<&'a str> },
    Other,
}

impl Command {
    pub fn kind(&self) -> CommandKind<'_> {
        match self.0.get("auth") {
            Some(auth) if is_truthy(auth) => CommandKind::Auth {
                password: auth.get("password").and_then(Value::as_str),
            },
            _ => CommandKind::Other,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unprintable command>"),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Client credentials record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub password: String,
}

impl AuthRequest {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            auth: Credentials {
                password: password.into(),
            },
        }
    }
}

/// Server acknowledgment of a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAck {
    pub auth: bool,
}

impl AuthAck {
    pub fn granted() -> Self {
        Self { auth: true }
    }
}
