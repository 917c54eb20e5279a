//! TCP gateway: accept loop and per-connection session protocol.
//!
//! Each accepted connection gets its own task and [`Session`]. The session
//! walks a small state machine driven by length-delimited frames:
//!
//! ```text
//! AwaitingCommand --'1'--> SentenceCommand --payload--> AwaitingCommand
//! AwaitingCommand --'2'--> TransformCommand --codes--> AwaitingCommand (+ reply)
//! any other selector, EOF, read error, shutdown --> Closed
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{Instrument, info};

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::{Command, Message};
use crate::config::{ConfigError, GatewayConfig};
use crate::launcher::WorkerLauncher;
use crate::pipeline::Dispatcher;
use crate::session::Session;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read frame: {0}")]
    Frame(#[source] io::Error),
    #[error("failed to write reply: {0}")]
    Write(#[source] io::Error),
}

/// Where a connection is in the command protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    /// Next frame is the new sentence.
    SentenceCommand,
    /// Next frame is a code string.
    TransformCommand,
    Closed,
}

impl SessionState {
    /// Transition out of `AwaitingCommand` on a selector frame.
    pub fn after_selector(frame: &[u8]) -> Self {
        match Command::from_selector(frame) {
            Some(Command::SetSentence) => Self::SentenceCommand,
            Some(Command::RunTransforms) => Self::TransformCommand,
            None => Self::Closed,
        }
    }
}

/// Bind the configured address and serve until `shutdown_rx` flips to true.
pub async fn serve(
    config: GatewayConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { addr, source })?;
    serve_listener(listener, config, launcher, shutdown_rx).await
}

/// Accept loop over an already-bound listener.
///
/// On shutdown the loop stops accepting, then waits for open sessions to
/// notice the signal and close.
pub async fn serve_listener(
    listener: TcpListener,
    config: GatewayConfig,
    launcher: Arc<dyn WorkerLauncher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, launcher = ?config.launcher, "Relay gateway listening"),
        Err(e) => tracing::warn!(error = %e, "Relay gateway listening on unknown address"),
    }

    let dispatcher = Arc::new(Dispatcher::new(launcher, &config));
    let mut sessions = JoinSet::new();
    let mut accept_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                info!("Gateway no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => {
                        accept_failures = 0;
                        conn
                    }
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let delay = accept_backoff(accept_failures);
                        tracing::warn!(error = %e, failures = accept_failures, ?delay, "Failed to accept connection");
                        tokio::select! {
                            _ = wait_for_shutdown(&mut shutdown_rx) => {
                                info!("Gateway no longer accepting connections");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };

                let session = Session::new(config.max_message_size);
                let span = tracing::info_span!("session", session_id = %session.id(), %peer);
                let dispatcher = Arc::clone(&dispatcher);
                let shutdown = shutdown_rx.clone();
                sessions.spawn(
                    async move {
                        tracing::debug!("Client connected");
                        match run_session(stream, session, &dispatcher, shutdown).await {
                            Ok(()) => tracing::debug!("Client disconnected"),
                            Err(e) => tracing::debug!(error = %e, "Session ended with error"),
                        }
                    }
                    .instrument(span),
                );
            }
            // Reap finished sessions so the set does not grow without bound.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    let open = sessions.len();
    if open > 0 {
        info!(open, "Waiting for sessions to close");
    }
    while sessions.join_next().await.is_some() {}
    info!("Gateway shutdown complete");
    Ok(())
}

/// Delay before retrying after `failures` consecutive accept errors.
/// Errors like EMFILE persist, so retrying at once would spin.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(6);
    (ACCEPT_BACKOFF_BASE * (1u32 << shift)).min(ACCEPT_BACKOFF_MAX)
}

/// Drive one client connection until it closes.
///
/// Generic over the stream so tests can use in-memory pipes.
pub async fn run_session<S>(
    stream: S,
    mut session: Session,
    dispatcher: &Dispatcher,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, MessageCodec::new(session.max_message_size()));
    let mut state = SessionState::AwaitingCommand;

    loop {
        state = match state {
            SessionState::AwaitingCommand => match next_frame(&mut framed, &mut shutdown_rx).await? {
                Some(selector) => {
                    let next = SessionState::after_selector(selector.as_bytes());
                    if next == SessionState::Closed {
                        tracing::debug!(selector = ?selector, "Unknown command, closing session");
                    }
                    next
                }
                None => SessionState::Closed,
            },
            SessionState::SentenceCommand => match next_frame(&mut framed, &mut shutdown_rx).await? {
                Some(text) => {
                    tracing::debug!(bytes = text.len(), "Sentence set");
                    session.set_sentence(text.into_bytes());
                    SessionState::AwaitingCommand
                }
                None => SessionState::Closed,
            },
            SessionState::TransformCommand => match next_frame(&mut framed, &mut shutdown_rx).await? {
                Some(codes) => {
                    let outcome = dispatcher.run_pipeline(&mut session, codes.as_bytes()).await;
                    tracing::debug!(
                        bytes = outcome.text.len(),
                        complete = outcome.is_complete(),
                        "Sending transform result"
                    );
                    framed
                        .send(outcome.framed())
                        .await
                        .map_err(GatewayError::Write)?;
                    SessionState::AwaitingCommand
                }
                None => SessionState::Closed,
            },
            SessionState::Closed => return Ok(()),
        };
    }
}

/// Next frame from the client, or `None` on EOF or shutdown.
async fn next_frame<S>(
    framed: &mut Framed<S, MessageCodec>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<Message>, GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => Ok(None),
        frame = framed.next() => frame.transpose().map_err(GatewayError::Frame),
    }
}

/// Resolves once the watch value is true. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
