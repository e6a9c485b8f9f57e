//! TCP listener for image transfers.
//!
//! The accept loop is single-threaded and cooperative: every iteration waits
//! at most `accept_poll` for a connection, then checks the cancellation
//! token. Each accepted connection runs as its own task, so a stalled client
//! never holds up the others. Cancelling stops the accept loop and drops
//! connections that have not sent a header yet; transfers already past the
//! header finish on their own before [`ConnectionServer::run`] returns.

pub mod locks;
pub mod session;

pub use locks::PathLocks;
pub use session::{
    lock_file_path, SessionContext, SessionEnd, SessionState, TransferOutcome, TransferSession,
};

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::{SentinelScope, Settings};
use crate::display::DisplayNotifier;

const LISTEN_BACKLOG: u32 = 128;

pub struct ConnectionServer {
    listener: TcpListener,
    settings: Arc<Settings>,
    notifier: Option<Arc<dyn DisplayNotifier>>,
    cancel: CancellationToken,
}

impl ConnectionServer {
    /// Bind the listening socket with address reuse enabled, so a restart
    /// right after an unclean exit does not trip over TIME_WAIT.
    pub async fn bind(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let addr = SocketAddr::new(settings.bind_address, settings.port);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("Failed to enable address reuse")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind {}", addr))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .with_context(|| format!("Failed to listen on {}", addr))?;

        Ok(Self {
            listener,
            settings: Arc::new(settings),
            notifier: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DisplayNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listening socket has no local address")
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        let mut ctx = SessionContext::new(self.settings.clone(), local.port())
            .with_shutdown(self.cancel.clone());
        if let Some(notifier) = self.notifier.clone() {
            ctx = ctx.with_notifier(notifier);
        }
        let ctx = Arc::new(ctx);
        let poll = self.settings.accept_poll();
        let mut sessions = JoinSet::new();

        tracing::info!(
            addr = %local,
            guide_mode = self.settings.guide_mode,
            "Imageserver listening for images"
        );

        while !self.cancel.is_cancelled() {
            while let Some(joined) = sessions.try_join_next() {
                log_join(joined);
            }

            match timeout(poll, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    tracing::debug!(%peer, "connection accepted");
                    sessions.spawn(serve_connection(stream, peer, ctx.clone()));
                }
                Ok(Err(e)) => {
                    tracing::warn!("accept failed: {}", e);
                    sleep(poll).await;
                }
            }
        }

        if !sessions.is_empty() {
            tracing::info!(in_flight = sessions.len(), "waiting for open transfers");
        }
        while let Some(joined) = sessions.join_next().await {
            log_join(joined);
        }
        tracing::info!("Closing imageserver");
        Ok(())
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!("session task failed: {}", e);
    }
}

/// Run one session and log how it ended. Errors stop here.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "could not disable Nagle: {}", e);
    }
    let scope = ctx.settings.sentinel_scope;
    let shutdown = ctx.shutdown.clone();
    let mut session = TransferSession::new(stream, ctx, peer.to_string());

    match session.run().await {
        Ok(SessionEnd::Shutdown) => {
            if scope == SentinelScope::Server {
                tracing::info!(%peer, "shutdown requested by client, stopping server");
                shutdown.cancel();
            }
        }
        Ok(SessionEnd::Abandoned) => {
            tracing::info!(%peer, "connection closed before a header arrived");
        }
        Ok(SessionEnd::Transferred(outcome)) => match outcome.ensure_complete() {
            Ok(()) => tracing::info!(
                %peer,
                path = %outcome.path.display(),
                bytes = outcome.bytes_received,
                "image received"
            ),
            Err(e) => tracing::warn!(%peer, "{}", e),
        },
        Err(e) => tracing::warn!(%peer, "ERROR {}", e),
    }
}
