//! Bridge client - the peer side of the handshake.
//!
//! Connects, sends credentials straight away, and logs whatever the bridge
//! sends back. Reconnecting is the client's job: with `auto_connect` on it
//! retries every `retry_interval` while disconnected.

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::AuthRequest;
use crate::config::ClientConfig;
use crate::log_sink::SharedSink;

/// How a single connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Closed,
    Errored,
}

pub struct BridgeClient {
    config: ClientConfig,
    sink: SharedSink,
}

impl BridgeClient {
    pub fn new(config: ClientConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Keep a bridge connection up until `shutdown` fires.
    ///
    /// Without `auto_connect` this returns after the first connection ends,
    /// and a failed connect is returned as an error.
    pub async fn run(&self, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            let outcome = tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),
                outcome = self.connect_once() => outcome,
            };

            match outcome {
                Ok(_) => {}
                Err(e) if self.config.auto_connect => {
                    tracing::debug!(
                        target_addr = %self.config.target(),
                        error = %e,
                        "Bridge connect failed, will retry"
                    );
                }
                Err(e) => return Err(e),
            }

            if !self.config.auto_connect {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    /// Connect, authenticate, and log inbound records until the bridge closes.
    ///
    /// Only a failed connect is an error; once connected the outcome is reported
    /// as a [`Disconnect`].
    pub async fn connect_once(&self) -> io::Result<Disconnect> {
        let target = self.config.target();
        let stream = TcpStream::connect(&target).await?;
        self.sink.info(&format!("connected to: {}", target));

        let mut framed = Framed::new(stream, JsonLinesCodec::<Value>::new());
        let disconnect = match framed.send(AuthRequest::new(self.config.password.clone())).await {
            Ok(()) => self.read_commands(&mut framed).await,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to send credentials");
                Disconnect::Errored
            }
        };

        match disconnect {
            Disconnect::Closed => self.sink.info("connection closed"),
            Disconnect::Errored => self.sink.info("connection closed (error)"),
        }
        Ok(disconnect)
    }

    async fn read_commands(
        &self,
        framed: &mut Framed<TcpStream, JsonLinesCodec<Value>>,
    ) -> Disconnect {
        loop {
            match framed.next().await {
                Some(Ok(Ok(cmd))) => self.sink.info(&format!("cmd: {}", cmd)),
                Some(Ok(Err(e))) => {
                    tracing::debug!(error = %e, "Malformed record from bridge");
                    self.sink.error("error: invalid command");
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Bridge connection failed");
                    return Disconnect::Errored;
                }
                None => return Disconnect::Closed,
            }
        }
    }
}
