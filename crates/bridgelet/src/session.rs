//! Bridge session - per-connection authentication state machine.
//!
//! Flow:
//! 1. Arm the auth deadline, frame the connection as JSON lines
//! 2. Unauthenticated: the first record must be `{"auth":{"password":...}}`
//!    with the shared secret, anything else closes the connection
//! 3. Authenticated: ack `{"auth":true}`, bind the channel listener, accept
//!    one channel connection, log and ignore further commands
//! 4. Shutdown: stop the listener, terminate channels, drop the connection,
//!    emit one close notification
//!
//! All state lives in the session task. Channel tasks report back over a
//! channel, so the registry needs no lock.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{AuthAck, Command, CommandKind};
use crate::channel::{ChannelEvent, ChannelHandle, ChannelListener, ChannelSession};
use crate::config::ServerConfig;
use crate::error::{BridgeError, ConfigError};
use crate::log_sink::SharedSink;
use crate::uid::{BridgeId, ChannelId, UidAllocator};

/// Pause before retrying a failed channel accept (e.g. file descriptor exhaustion).
const CHANNEL_ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Why a session closed. Informational only; every cause ends in `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Timeout,
    AuthFailure,
    ProtocolViolation,
    /// Peer closed the bridge connection cleanly.
    Peer,
    BindConflict,
    BindFailure,
    /// The listener is shutting down.
    ServerShutdown,
    Io,
}

impl CloseCause {
    pub fn for_error(error: &BridgeError) -> Self {
        match error {
            BridgeError::ProtocolViolation { .. } => Self::ProtocolViolation,
            BridgeError::AuthenticationFailure => Self::AuthFailure,
            BridgeError::AuthenticationTimeout => Self::Timeout,
            BridgeError::ListenerBindConflict { .. } => Self::BindConflict,
            BridgeError::ChannelBindFailed { .. } => Self::BindFailure,
            BridgeError::Io(_) => Self::Io,
        }
    }
}

/// Close notification, sent exactly once per session.
#[derive(Debug)]
pub struct SessionClosed {
    pub id: BridgeId,
    pub cause: CloseCause,
    /// `None` for a clean peer close or server shutdown.
    pub error: Option<BridgeError>,
}

/// Something the dispatch table has to rule on.
#[derive(Debug)]
pub enum Input<'a> {
    Command(&'a Command),
    Malformed(&'a serde_json::Error),
    DeadlineElapsed,
}

#[derive(Debug)]
pub enum Action {
    Authenticate,
    Close(BridgeError),
    /// Authenticated peer sent a command with no meaning here.
    LogUnknown,
    Ignore,
}

/// Dispatch table keyed by session state and input kind.
pub fn dispatch(state: SessionState, input: &Input<'_>, config: &ServerConfig) -> Action {
    match (state, input) {
        (SessionState::Closed, _) => Action::Ignore,

        (SessionState::Unauthenticated, Input::Command(cmd)) => match cmd.kind() {
            CommandKind::Auth {
                password: Some(password),
            } if password_matches(password, &config.password) => Action::Authenticate,
            CommandKind::Auth { .. } => Action::Close(BridgeError::AuthenticationFailure),
            CommandKind::Other => {
                Action::Close(BridgeError::protocol_violation("command before authentication"))
            }
        },
        (SessionState::Unauthenticated, Input::Malformed(_)) => {
            Action::Close(BridgeError::protocol_violation("invalid bridge command"))
        }
        (SessionState::Unauthenticated, Input::DeadlineElapsed) => {
            Action::Close(BridgeError::AuthenticationTimeout)
        }

        (SessionState::Authenticated, Input::Command(_)) => Action::LogUnknown,
        (SessionState::Authenticated, Input::Malformed(_)) if config.strict_after_auth => {
            Action::Close(BridgeError::protocol_violation(
                "invalid bridge command after authentication",
            ))
        }
        (SessionState::Authenticated, Input::Malformed(_)) => Action::Ignore,
        // The deadline is disarmed on authentication; a stale fire means nothing.
        (SessionState::Authenticated, Input::DeadlineElapsed) => Action::Ignore,
    }
}

fn password_matches(given: &str, expected: &str) -> bool {
    bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}

/// Dependencies shared by every session the listener spawns.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub channel_addr: SocketAddr,
    pub uids: Arc<UidAllocator>,
    pub sink: SharedSink,
}

impl SessionContext {
    pub fn new(
        config: ServerConfig,
        uids: Arc<UidAllocator>,
        sink: SharedSink,
    ) -> Result<Self, ConfigError> {
        let channel_addr = config.channel_addr()?;
        Ok(Self {
            config: Arc::new(config),
            channel_addr,
            uids,
            sink,
        })
    }
}

enum Event {
    ServerShutdown,
    Command(Command),
    Malformed(serde_json::Error),
    ReadFailed(io::Error),
    PeerClosed,
    ChannelAccepted(io::Result<(TcpStream, SocketAddr)>),
    Channel(ChannelEvent),
    DeadlineElapsed,
}

pub struct BridgeSession<S> {
    id: BridgeId,
    state: SessionState,
    ctx: SessionContext,
    conn: Option<Framed<S, JsonLinesCodec<Command>>>,
    auth_deadline: Option<Pin<Box<Sleep>>>,
    channel_listener: Option<ChannelListener>,
    accept_backoff: Option<Pin<Box<Sleep>>>,
    channels: HashMap<ChannelId, ChannelHandle>,
    channel_events_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    closed_tx: mpsc::UnboundedSender<SessionClosed>,
}

impl<S> BridgeSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Take ownership of a fresh bridge connection and arm its auth deadline.
    pub fn new(
        stream: S,
        ctx: SessionContext,
        closed_tx: mpsc::UnboundedSender<SessionClosed>,
    ) -> Self {
        let id = ctx.uids.next_bridge();
        let codec = JsonLinesCodec::new_with_max_length(ctx.config.max_frame_length);
        let deadline = Box::pin(tokio::time::sleep(ctx.config.auth_timeout));
        let (channel_events_tx, channel_events_rx) = mpsc::unbounded_channel();

        tracing::debug!(
            bridge_id = %id,
            timeout_ms = ctx.config.auth_timeout.as_millis() as u64,
            "Bridge session created"
        );

        Self {
            id,
            state: SessionState::Unauthenticated,
            ctx,
            conn: Some(Framed::new(stream, codec)),
            auth_deadline: Some(deadline),
            channel_listener: None,
            accept_backoff: None,
            channels: HashMap::new(),
            channel_events_tx,
            channel_events_rx,
            closed_tx,
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel_addr(&self) -> Option<SocketAddr> {
        self.channel_listener.as_ref().map(ChannelListener::local_addr)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drive the session until it closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        while self.state != SessionState::Closed {
            let event = self.next_event(&shutdown).await;
            self.handle(event).await;
        }
    }

    async fn next_event(&mut self, shutdown: &CancellationToken) -> Event {
        let Some(conn) = self.conn.as_mut() else {
            return Event::ServerShutdown;
        };

        // Records before the deadline: an auth that is already buffered wins.
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => Event::ServerShutdown,

            frame = conn.next() => match frame {
                Some(Ok(Ok(cmd))) => Event::Command(cmd),
                Some(Ok(Err(e))) => Event::Malformed(e),
                Some(Err(e)) => Event::ReadFailed(e),
                None => Event::PeerClosed,
            },

            accepted = accept_channel(&mut self.channel_listener, &mut self.accept_backoff) => {
                Event::ChannelAccepted(accepted)
            }

            Some(event) = self.channel_events_rx.recv() => Event::Channel(event),

            _ = deadline_elapsed(&mut self.auth_deadline) => Event::DeadlineElapsed,
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::ServerShutdown => self.shutdown(CloseCause::ServerShutdown, None),
            Event::PeerClosed => self.shutdown(CloseCause::Peer, None),
            Event::ReadFailed(e) => self.close_with(BridgeError::Io(e)),
            Event::Command(cmd) => self.on_input(Input::Command(&cmd)).await,
            Event::Malformed(e) => {
                tracing::debug!(bridge_id = %self.id, error = %e, "Malformed bridge record");
                self.ctx.sink.error("error: invalid bridge command");
                self.on_input(Input::Malformed(&e)).await;
            }
            Event::DeadlineElapsed => self.on_input(Input::DeadlineElapsed).await,
            Event::ChannelAccepted(Ok((stream, peer))) => self.on_channel_connection(stream, peer),
            Event::ChannelAccepted(Err(e)) => {
                tracing::warn!(
                    bridge_id = %self.id,
                    error = %e,
                    "Failed to accept channel connection"
                );
                let backoff = tokio::time::sleep(CHANNEL_ACCEPT_ERROR_DELAY);
                self.accept_backoff = Some(Box::pin(backoff));
            }
            Event::Channel(ChannelEvent::Closed { id, error }) => {
                self.channels.remove(&id);
                tracing::debug!(
                    bridge_id = %self.id,
                    channel_id = %id,
                    error = ?error,
                    "Channel deregistered"
                );
            }
        }
    }

    async fn on_input(&mut self, input: Input<'_>) {
        match dispatch(self.state, &input, &self.ctx.config) {
            Action::Authenticate => self.authenticate().await,
            Action::Close(err) => self.close_with(err),
            Action::LogUnknown => {
                if let Input::Command(cmd) = input {
                    self.ctx
                        .sink
                        .warn(&format!("error: unknown bridge command {}", cmd));
                }
            }
            Action::Ignore => {}
        }
    }

    async fn authenticate(&mut self) {
        self.auth_deadline = None;
        self.state = SessionState::Authenticated;
        self.ctx
            .sink
            .info(&format!("bridge authorized {}", self.id));

        let acked = match self.conn.as_mut() {
            Some(conn) => conn.send(AuthAck::granted()).await,
            None => return,
        };
        if let Err(e) = acked {
            self.close_with(BridgeError::Io(e));
            return;
        }

        match ChannelListener::bind(self.ctx.channel_addr, self.id).await {
            Ok(listener) => {
                self.ctx.sink.info(&format!(
                    "channel server is up for bridge {} on {}",
                    self.id,
                    listener.local_addr()
                ));
                self.channel_listener = Some(listener);
            }
            Err(err) => self.close_with(err),
        }
    }

    fn on_channel_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        // Single use: the listener is already exhausted, release it.
        self.channel_listener = None;

        let id = self.ctx.uids.next_channel();
        self.ctx
            .sink
            .info(&format!("channel client connected {}", id));

        let session = ChannelSession::new(id, self.id, peer, stream, Arc::clone(&self.ctx.sink));
        let handle = session.spawn(self.channel_events_tx.clone());
        self.channels.insert(id, handle);
    }

    fn close_with(&mut self, error: BridgeError) {
        let cause = CloseCause::for_error(&error);
        self.shutdown(cause, Some(error));
    }

    /// Tear the session down. Idempotent: only the first call has effects.
    pub fn shutdown(&mut self, cause: CloseCause, error: Option<BridgeError>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.auth_deadline = None;
        self.accept_backoff = None;

        if let Some(listener) = self.channel_listener.take() {
            tracing::debug!(
                bridge_id = %self.id,
                addr = %listener.local_addr(),
                "Channel listener stopped"
            );
        }
        for (_, handle) in self.channels.drain() {
            tracing::debug!(bridge_id = %self.id, channel_id = %handle.id(), "Terminating channel");
            handle.terminate();
        }
        self.conn = None;

        if let Some(ref err) = error {
            self.ctx.sink.error(&format!(
                "shutting down bridge server {} because of an error:",
                self.id
            ));
            self.ctx.sink.error(&describe(err));
        }
        tracing::debug!(bridge_id = %self.id, ?cause, "Bridge session closed");

        let _ = self.closed_tx.send(SessionClosed {
            id: self.id,
            cause,
            error,
        });
    }
}

/// One-line rendering with code and source chain, e.g. `[401.2] Authorization failed!`.
pub fn describe(err: &BridgeError) -> String {
    let mut out = match err.code() {
        Some(code) => format!("[{}] {}", code, err),
        None => err.to_string(),
    };
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}

/// Accept on the channel listener, first sitting out any back-off left by a failed accept.
async fn accept_channel(
    listener: &mut Option<ChannelListener>,
    backoff: &mut Option<Pin<Box<Sleep>>>,
) -> io::Result<(TcpStream, SocketAddr)> {
    let Some(listener) = listener else {
        return std::future::pending().await;
    };
    if let Some(sleep) = backoff {
        sleep.as_mut().await;
        *backoff = None;
    }
    listener.accept().await
}

async fn deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::error::ErrorCode;
    use crate::log_sink::{ChannelSink, LogRecord, drain_records};

    fn command(value: serde_json::Value) -> Command {
        serde_json::from_value(value).unwrap()
    }

    fn malformed() -> serde_json::Error {
        serde_json::from_str::<Command>("{nope").unwrap_err()
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config() -> ServerConfig {
        ServerConfig::new()
            .with_host("127.0.0.1")
            .with_channel_port(free_port())
            .with_auth_timeout(Duration::from_secs(30))
    }

    struct Harness {
        client: DuplexStream,
        closed_rx: mpsc::UnboundedReceiver<SessionClosed>,
        logs: mpsc::UnboundedReceiver<LogRecord>,
        channel_addr: SocketAddr,
    }

    fn spawn_session(config: ServerConfig) -> Harness {
        let (session, client, closed_rx, logs) = new_session(config);
        let channel_addr = session.ctx.channel_addr;
        tokio::spawn(session.run(CancellationToken::new()));
        Harness {
            client,
            closed_rx,
            logs,
            channel_addr,
        }
    }

    fn new_session(
        config: ServerConfig,
    ) -> (
        BridgeSession<DuplexStream>,
        DuplexStream,
        mpsc::UnboundedReceiver<SessionClosed>,
        mpsc::UnboundedReceiver<LogRecord>,
    ) {
        let (sink, logs) = ChannelSink::new();
        let ctx =
            SessionContext::new(config, Arc::new(UidAllocator::new()), Arc::new(sink)).unwrap();
        new_session_with_context(ctx, logs)
    }

    fn new_session_with_context(
        ctx: SessionContext,
        logs: mpsc::UnboundedReceiver<LogRecord>,
    ) -> (
        BridgeSession<DuplexStream>,
        DuplexStream,
        mpsc::UnboundedReceiver<SessionClosed>,
        mpsc::UnboundedReceiver<LogRecord>,
    ) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(4096);
        (BridgeSession::new(server, ctx, closed_tx), client, closed_rx, logs)
    }

    async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("channel listener never came up on {addr}");
    }

    async fn read_to_end(client: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        out
    }

    fn messages(logs: &mut mpsc::UnboundedReceiver<LogRecord>) -> Vec<String> {
        drain_records(logs).into_iter().map(|r| r.message).collect()
    }

    /// Collect messages up to and including `wanted`.
    async fn messages_until(
        logs: &mut mpsc::UnboundedReceiver<LogRecord>,
        wanted: &str,
    ) -> Vec<String> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(record) = logs.recv().await {
                let done = record.message == wanted;
                seen.push(record.message);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();
        seen
    }

    async fn authenticate(client: &mut DuplexStream) {
        client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();
        let mut ack = [0u8; 14];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&ack, b"{\"auth\":true}\n");
    }

    #[test]
    fn dispatch_unauthenticated() {
        let config = ServerConfig::default();
        let state = SessionState::Unauthenticated;

        let ok = command(json!({"auth": {"password": "password"}}));
        assert!(matches!(
            dispatch(state, &Input::Command(&ok), &config),
            Action::Authenticate
        ));

        let wrong = command(json!({"auth": {"password": "wrong"}}));
        assert!(matches!(
            dispatch(state, &Input::Command(&wrong), &config),
            Action::Close(BridgeError::AuthenticationFailure)
        ));

        let missing = command(json!({"auth": {}}));
        assert!(matches!(
            dispatch(state, &Input::Command(&missing), &config),
            Action::Close(BridgeError::AuthenticationFailure)
        ));

        let other = command(json!({"hello": 1}));
        assert!(matches!(
            dispatch(state, &Input::Command(&other), &config),
            Action::Close(BridgeError::ProtocolViolation { .. })
        ));

        let err = malformed();
        assert!(matches!(
            dispatch(state, &Input::Malformed(&err), &config),
            Action::Close(BridgeError::ProtocolViolation { .. })
        ));

        assert!(matches!(
            dispatch(state, &Input::DeadlineElapsed, &config),
            Action::Close(BridgeError::AuthenticationTimeout)
        ));
    }

    #[test]
    fn dispatch_authenticated() {
        let config = ServerConfig::default();
        let state = SessionState::Authenticated;

        let again = command(json!({"auth": {"password": "password"}}));
        assert!(matches!(
            dispatch(state, &Input::Command(&again), &config),
            Action::LogUnknown
        ));

        let err = malformed();
        assert!(matches!(
            dispatch(state, &Input::Malformed(&err), &config),
            Action::Ignore
        ));

        let strict = ServerConfig::default().with_strict_after_auth(true);
        assert!(matches!(
            dispatch(state, &Input::Malformed(&err), &strict),
            Action::Close(BridgeError::ProtocolViolation { .. })
        ));

        assert!(matches!(
            dispatch(state, &Input::DeadlineElapsed, &config),
            Action::Ignore
        ));
    }

    #[test]
    fn dispatch_closed_ignores_everything() {
        let config = ServerConfig::default();
        let ok = command(json!({"auth": {"password": "password"}}));
        assert!(matches!(
            dispatch(SessionState::Closed, &Input::Command(&ok), &config),
            Action::Ignore
        ));
        assert!(matches!(
            dispatch(SessionState::Closed, &Input::DeadlineElapsed, &config),
            Action::Ignore
        ));
    }

    #[test]
    fn custom_password_is_honoured() {
        let config = ServerConfig::default().with_password("s3cret");
        let stock = command(json!({"auth": {"password": "password"}}));
        let custom = command(json!({"auth": {"password": "s3cret"}}));
        assert!(matches!(
            dispatch(SessionState::Unauthenticated, &Input::Command(&stock), &config),
            Action::Close(BridgeError::AuthenticationFailure)
        ));
        assert!(matches!(
            dispatch(SessionState::Unauthenticated, &Input::Command(&custom), &config),
            Action::Authenticate
        ));
    }

    #[test]
    fn describe_includes_code_and_source() {
        assert_eq!(
            describe(&BridgeError::AuthenticationFailure),
            "[401.2] Authorization failed!"
        );
        let conflict = BridgeError::ListenerBindConflict {
            addr: "127.0.0.1:7979".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            describe(&conflict),
            "channel port 127.0.0.1:7979 already in use: address in use"
        );
    }

    #[tokio::test]
    async fn correct_password_acks_then_opens_channel() {
        let mut h = spawn_session(test_config());

        h.client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(&mut h.client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"auth\":true}\n");

        let mut channel = connect_with_retry(h.channel_addr).await;
        channel.write_all(b"hi").await.unwrap();
        let mut reply = [0u8; 13];
        channel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"You said \"hi\"");

        // Single use: the listener is gone after the first connection.
        assert!(TcpStream::connect(h.channel_addr).await.is_err());

        drop(reader);
        drop(h.client);
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::Peer);
        assert!(closed.error.is_none());

        // Channel is terminated with its bridge.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), channel.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let logs = messages(&mut h.logs);
        assert_eq!(logs[0], "bridge authorized 1");
        assert!(logs[1].starts_with("channel server is up for bridge 1 on 127.0.0.1:"));
        assert_eq!(logs[2], "channel client connected 1");
    }

    #[tokio::test]
    async fn wrong_password_closes_silently() {
        let mut h = spawn_session(test_config());

        h.client
            .write_all(b"{\"auth\":{\"password\":\"wrong\"}}\n")
            .await
            .unwrap();

        assert!(read_to_end(&mut h.client).await.is_empty());
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::AuthFailure);
        assert_eq!(
            closed.error.as_ref().and_then(BridgeError::code),
            Some(ErrorCode::AuthFailed)
        );

        assert!(TcpStream::connect(h.channel_addr).await.is_err());
        let logs = messages(&mut h.logs);
        assert_eq!(
            logs,
            vec![
                "shutting down bridge server 1 because of an error:".to_string(),
                "[401.2] Authorization failed!".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_record_before_auth_requires_auth() {
        let mut h = spawn_session(test_config());

        h.client.write_all(b"{\"auth\":\n").await.unwrap();

        assert!(read_to_end(&mut h.client).await.is_empty());
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::ProtocolViolation);
        assert_eq!(
            closed.error.as_ref().and_then(BridgeError::code),
            Some(ErrorCode::AuthRequired)
        );
        assert_eq!(messages(&mut h.logs)[0], "error: invalid bridge command");
    }

    #[tokio::test]
    async fn other_command_before_auth_requires_auth() {
        let mut h = spawn_session(test_config());

        h.client.write_all(b"{\"ping\":true}\n").await.unwrap();

        assert!(read_to_end(&mut h.client).await.is_empty());
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::ProtocolViolation);
        assert_eq!(
            closed.error.as_ref().and_then(BridgeError::code),
            Some(ErrorCode::AuthRequired)
        );
    }

    #[tokio::test]
    async fn silence_until_deadline_requires_auth() {
        let mut h = spawn_session(test_config().with_auth_timeout(Duration::from_millis(50)));

        assert!(read_to_end(&mut h.client).await.is_empty());
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::Timeout);
        assert!(matches!(
            closed.error,
            Some(BridgeError::AuthenticationTimeout)
        ));
    }

    #[tokio::test]
    async fn buffered_auth_beats_expired_deadline() {
        let (session, mut client, mut closed_rx, _logs) =
            new_session(test_config().with_auth_timeout(Duration::ZERO));

        client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();
        tokio::spawn(session.run(CancellationToken::new()));

        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"auth\":true}\n");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closed_rx.try_recv().is_err(), "session must stay open");
    }

    #[tokio::test]
    async fn commands_after_auth_are_logged_not_fatal() {
        let mut h = spawn_session(test_config());

        h.client
            .write_all(
                b"{\"auth\":{\"password\":\"password\"}}\n\
                  {\"auth\":{\"password\":\"password\"}}\n\
                  garbage\n\
                  {\"ping\":1}\n",
            )
            .await
            .unwrap();

        let mut reader = BufReader::new(&mut h.client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"auth\":true}\n");

        // Only one ack: the second auth is just an unknown command.
        let mut extra = [0u8; 1];
        let more = tokio::time::timeout(Duration::from_millis(100), reader.read(&mut extra)).await;
        assert!(more.is_err(), "no further bytes expected");
        assert!(h.closed_rx.try_recv().is_err());

        let logs = messages(&mut h.logs);
        assert!(logs.contains(
            &"error: unknown bridge command {\"auth\":{\"password\":\"password\"}}".to_string()
        ));
        assert!(logs.contains(&"error: invalid bridge command".to_string()));
        assert!(logs.contains(&"error: unknown bridge command {\"ping\":1}".to_string()));
    }

    #[tokio::test]
    async fn strict_mode_closes_on_malformed_after_auth() {
        let mut h = spawn_session(test_config().with_strict_after_auth(true));

        h.client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\nnot json\n")
            .await
            .unwrap();

        let bytes = read_to_end(&mut h.client).await;
        assert_eq!(bytes, b"{\"auth\":true}\n");
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::ProtocolViolation);
    }

    #[tokio::test]
    async fn channel_port_conflict_closes_only_the_bridge() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let mut h = spawn_session(test_config().with_channel_port(port));

        h.client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();

        let bytes = read_to_end(&mut h.client).await;
        assert_eq!(bytes, b"{\"auth\":true}\n");
        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::BindConflict);
        assert!(!closed.error.unwrap().is_process_fatal());
    }

    #[tokio::test]
    async fn channel_disconnect_keeps_bridge_open() {
        let mut h = spawn_session(test_config());
        authenticate(&mut h.client).await;

        let mut channel = connect_with_retry(h.channel_addr).await;
        channel.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 15];
        channel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"You said \"ping\"");

        drop(channel);
        let logs = messages_until(&mut h.logs, "channel client disconnected 1").await;
        assert!(logs.contains(&"channel client connected 1".to_string()));

        // The bridge still dispatches commands after its channel is gone.
        h.client.write_all(b"{\"ping\":1}\n").await.unwrap();
        messages_until(&mut h.logs, "error: unknown bridge command {\"ping\":1}").await;
        assert!(h.closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_is_deregistered_when_its_peer_leaves() {
        let (mut session, mut client, _closed_rx, _logs) = new_session(test_config());
        let channel_addr = session.ctx.channel_addr;
        let shutdown = CancellationToken::new();

        client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();
        let event = session.next_event(&shutdown).await;
        session.handle(event).await;
        assert_eq!(session.state(), SessionState::Authenticated);

        let channel = TcpStream::connect(channel_addr).await.unwrap();
        let event = session.next_event(&shutdown).await;
        session.handle(event).await;
        assert_eq!(session.channel_count(), 1);

        drop(channel);
        let event = tokio::time::timeout(Duration::from_secs(5), session.next_event(&shutdown))
            .await
            .unwrap();
        session.handle(event).await;
        assert_eq!(session.channel_count(), 0);
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn unexpected_channel_bind_failure_is_process_fatal() {
        let (sink, logs) = ChannelSink::new();
        let mut ctx =
            SessionContext::new(test_config(), Arc::new(UidAllocator::new()), Arc::new(sink))
                .unwrap();
        // TEST-NET-1 is not a local address, so the bind fails with EADDRNOTAVAIL.
        ctx.channel_addr = "192.0.2.1:7979".parse().unwrap();
        let (session, mut client, mut closed_rx, _logs) = new_session_with_context(ctx, logs);
        tokio::spawn(session.run(CancellationToken::new()));

        client
            .write_all(b"{\"auth\":{\"password\":\"password\"}}\n")
            .await
            .unwrap();

        assert_eq!(read_to_end(&mut client).await, b"{\"auth\":true}\n");
        let closed = closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::BindFailure);
        let error = closed.error.unwrap();
        assert!(matches!(error, BridgeError::ChannelBindFailed { .. }));
        assert!(error.is_process_fatal());
    }

    #[tokio::test]
    async fn failed_channel_accept_backs_off() {
        let (mut session, _client, _closed_rx, _logs) = new_session(test_config());
        let started = tokio::time::Instant::now();

        let exhausted = io::Error::other("too many open files");
        session.handle(Event::ChannelAccepted(Err(exhausted))).await;
        assert!(session.accept_backoff.is_some());

        let addr = "127.0.0.1:0".parse().unwrap();
        let mut listener = Some(ChannelListener::bind(addr, session.id()).await.unwrap());
        let local = listener.as_ref().unwrap().local_addr();
        let _peer = TcpStream::connect(local).await.unwrap();

        accept_channel(&mut listener, &mut session.accept_backoff)
            .await
            .unwrap();
        assert!(started.elapsed() >= CHANNEL_ACCEPT_ERROR_DELAY);
        assert!(session.accept_backoff.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (mut session, mut client, mut closed_rx, mut logs) = new_session(test_config());

        session.shutdown(CloseCause::AuthFailure, Some(BridgeError::AuthenticationFailure));
        session.shutdown(CloseCause::Timeout, Some(BridgeError::AuthenticationTimeout));
        assert_eq!(session.state(), SessionState::Closed);

        let closed = closed_rx.try_recv().unwrap();
        assert_eq!(closed.cause, CloseCause::AuthFailure);
        assert!(closed_rx.try_recv().is_err());
        assert_eq!(messages(&mut logs).len(), 2);

        assert!(read_to_end(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn server_shutdown_closes_without_error() {
        let (session, mut client, mut closed_rx, _logs) = new_session(test_config());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run(shutdown.clone()));

        shutdown.cancel();
        task.await.unwrap();

        let closed = closed_rx.recv().await.unwrap();
        assert_eq!(closed.cause, CloseCause::ServerShutdown);
        assert!(closed.error.is_none());
        assert!(read_to_end(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn fresh_session_is_unauthenticated() {
        let (session, _client, _closed_rx, _logs) = new_session(test_config());
        assert_eq!(session.id().get(), 1);
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.channel_addr().is_none());
        assert_eq!(session.channel_count(), 0);
    }
}
