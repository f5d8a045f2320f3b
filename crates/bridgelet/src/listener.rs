//! Bridge listener - process-wide entry point for bridge connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::log_sink::SharedSink;
use crate::session::{BridgeSession, SessionClosed, SessionContext, describe};
use crate::uid::{BridgeId, UidAllocator};

/// Back-off after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

pub struct BridgeListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: SessionContext,
}

impl BridgeListener {
    pub async fn bind(
        config: ServerConfig,
        uids: Arc<UidAllocator>,
        sink: SharedSink,
    ) -> Result<Self, ServerError> {
        let ctx = SessionContext::new(config, uids, sink)?;
        Self::bind_with_context(ctx).await
    }

    /// Bind the bridge port from an already prepared session context.
    pub async fn bind_with_context(ctx: SessionContext) -> Result<Self, ServerError> {
        let addr = ctx.config.bridge_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        ctx.sink
            .info(&format!("bridge server bound on {}", local_addr));

        Ok(Self {
            listener,
            local_addr,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Channel address sessions will bind after authentication.
    pub fn channel_addr(&self) -> SocketAddr {
        self.ctx.channel_addr
    }

    /// Accept bridges until `shutdown` fires or a session fails unrecoverably.
    ///
    /// Every live session is shut down and awaited before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let sink = Arc::clone(&self.ctx.sink);
        let session_shutdown = shutdown.child_token();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<SessionClosed>();
        let mut sessions = JoinSet::new();
        let mut bridges: HashMap<BridgeId, SocketAddr> = HashMap::new();

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!(active = bridges.len(), "Bridge listener shutting down");
                    break Ok(());
                }

                Some(closed) = closed_rx.recv() => {
                    let id = closed.id;
                    if let Some(peer) = bridges.remove(&id) {
                        tracing::debug!(
                            bridge_id = %id,
                            %peer,
                            cause = ?closed.cause,
                            "Bridge released"
                        );
                    }
                    sink.info(&format!("bridge is down {}", id));
                    if let Some(err) = closed.error
                        && err.is_process_fatal()
                    {
                        sink.error(&describe(&err));
                        break Err(ServerError::Session { bridge: id.get(), source: err });
                    }
                }

                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        sink.error(&format!("bridge session panicked: {}", e));
                        break Err(ServerError::SessionPanicked(e.to_string()));
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session =
                            BridgeSession::new(stream, self.ctx.clone(), closed_tx.clone());
                        let id = session.id();
                        bridges.insert(id, peer);
                        tracing::debug!(
                            bridge_id = %id,
                            %peer,
                            active = bridges.len(),
                            "Bridge connection accepted"
                        );
                        sink.info(&format!("bridge is up {}", id));
                        sessions.spawn(session.run(session_shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept bridge connection");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
            }
        };

        drop(self.listener);
        session_shutdown.cancel();
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined
                && e.is_panic()
            {
                sink.error(&format!("bridge session panicked during shutdown: {}", e));
            }
        }
        while let Ok(closed) = closed_rx.try_recv() {
            bridges.remove(&closed.id);
            sink.info(&format!("bridge is down {}", closed.id));
        }

        tracing::info!("Bridge listener stopped");
        result
    }
}
