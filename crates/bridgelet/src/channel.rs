//! Single-use relay channel opened by an authenticated bridge.
//!
//! The listener hands out exactly one connection and then closes its socket,
//! so later connection attempts are refused by the OS. The accepted session
//! echoes every chunk back as `You said "<payload>"`.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::log_sink::SharedSink;
use crate::uid::{BridgeId, ChannelId};

const READ_CHUNK: usize = 64 * 1024;

/// Listener that accepts one channel connection for its bridge.
#[derive(Debug)]
pub struct ChannelListener {
    bridge: BridgeId,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
}

impl ChannelListener {
    /// Bind the channel port for `bridge`.
    ///
    /// `AddrInUse` maps to [`BridgeError::ListenerBindConflict`]; every other
    /// failure to [`BridgeError::ChannelBindFailed`].
    pub async fn bind(addr: SocketAddr, bridge: BridgeId) -> Result<Self, BridgeError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) if source.kind() == io::ErrorKind::AddrInUse => {
                return Err(BridgeError::ListenerBindConflict { addr, source });
            }
            Err(source) => return Err(BridgeError::ChannelBindFailed { addr, source }),
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| BridgeError::ChannelBindFailed { addr, source })?;

        tracing::debug!(%bridge, %local_addr, "Channel listener bound");

        Ok(Self {
            bridge,
            local_addr,
            listener: Some(listener),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_exhausted(&self) -> bool {
        self.listener.is_none()
    }

    /// Wait for the channel connection. Never resolves once exhausted.
    ///
    /// Cancel safe: dropping the future before it resolves keeps the listener open.
    pub async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let Some(listener) = self.listener.as_ref() else {
            return std::future::pending().await;
        };
        let accepted = listener.accept().await?;
        // Closing the socket here is what refuses any second connection.
        self.listener = None;
        tracing::debug!(bridge = %self.bridge, peer = %accepted.1, "Channel listener exhausted");
        Ok(accepted)
    }
}

/// Notification from a channel task back to its bridge.
#[derive(Debug)]
pub enum ChannelEvent {
    Closed {
        id: ChannelId,
        error: Option<io::Error>,
    },
}

/// Bytes written back for one received chunk.
pub fn echo_reply(payload: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(payload.len() + 11);
    reply.extend_from_slice(b"You said \"");
    reply.extend_from_slice(payload);
    reply.push(b'"');
    reply
}

pub struct ChannelSession<S> {
    id: ChannelId,
    bridge: BridgeId,
    peer: SocketAddr,
    stream: S,
    sink: SharedSink,
}

impl<S> ChannelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ChannelId,
        bridge: BridgeId,
        peer: SocketAddr,
        stream: S,
        sink: SharedSink,
    ) -> Self {
        Self {
            id,
            bridge,
            peer,
            stream,
            sink,
        }
    }

    /// Spawn the relay task and return the handle the bridge keeps in its registry.
    pub fn spawn(self, events: mpsc::UnboundedSender<ChannelEvent>) -> ChannelHandle {
        let cancel = CancellationToken::new();
        let id = self.id;
        let task = tokio::spawn(self.run(cancel.clone(), events));
        ChannelHandle { id, cancel, task }
    }

    /// Relay until the peer leaves or the bridge cancels.
    ///
    /// A cancelled session reports nothing: the bridge is already tearing it down.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(
                    channel_id = %self.id,
                    bridge_id = %self.bridge,
                    "Channel terminated by bridge"
                );
                return;
            }
            result = self.relay() => result,
        };

        if let Err(ref e) = result {
            tracing::debug!(channel_id = %self.id, error = %e, "Channel connection failed");
        }
        self.sink
            .info(&format!("channel client disconnected {}", self.id));
        let _ = events.send(ChannelEvent::Closed {
            id: self.id,
            error: result.err(),
        });
    }

    async fn relay(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let payload = &buf[..n];
            self.sink.info(&format!(
                "DATA {}: {}",
                self.peer,
                String::from_utf8_lossy(payload)
            ));
            self.stream.write_all(&echo_reply(payload)).await?;
            self.stream.flush().await?;
        }
    }
}

/// Registry entry for a live channel session.
#[derive(Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Forcibly end the session; its connection is dropped with the task.
    pub fn terminate(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
