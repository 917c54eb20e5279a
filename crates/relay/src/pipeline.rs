//! Pipeline decoding and dispatch.
//!
//! A code string decodes left to right into [`TransformCode`]s and stops at
//! the first byte that is not a code: `"1z9"` runs exactly like `"1"`. The
//! rest of the string is dropped without complaint, since clients rely on
//! that behavior.
//!
//! Each step launches a fresh worker, sends it the working text and waits,
//! bounded by the reply timeout, for one datagram back. Step N+1 starts only
//! after step N has replied. When a step fails the text from the last good
//! step is kept and returned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::bytes::Bytes;

use crate::bridge::protocol::Message;
use crate::config::GatewayConfig;
use crate::launcher::{LaunchError, WorkerLauncher};
use crate::session::Session;
use crate::transform::TransformCode;

/// Ordered transform steps decoded from one code string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<TransformCode>,
}

impl Pipeline {
    pub fn decode(codes: &[u8]) -> Self {
        let steps = codes
            .iter()
            .map_while(|byte| TransformCode::from_byte(*byte))
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[TransformCode] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to bind reply socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send to worker at {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no reply from worker at {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("failed to receive reply from {addr}: {source}")]
    Recv {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("{code} step failed: {source}")]
    Exchange {
        code: TransformCode,
        #[source]
        source: ExchangeError,
    },
}

#[derive(Debug)]
pub enum PipelineStatus {
    /// Every decoded step ran.
    Complete,
    /// Step `completed` (0-based) failed; the text is from the step before it.
    Partial {
        completed: usize,
        requested: usize,
        error: StepError,
    },
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub text: Message,
    pub status: PipelineStatus,
}

impl PipelineOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, PipelineStatus::Complete)
    }

    /// Wire form of the result: the text followed by `\n`.
    pub fn framed(&self) -> Bytes {
        self.text.framed_line()
    }
}

/// Send `text` to the worker at `addr` and wait for its single reply.
pub async fn exchange(
    addr: SocketAddr,
    text: &Message,
    reply_bind: SocketAddr,
    timeout: Duration,
    max_message_size: usize,
) -> Result<Message, ExchangeError> {
    let socket = UdpSocket::bind(reply_bind)
        .await
        .map_err(|source| ExchangeError::Bind {
            addr: reply_bind,
            source,
        })?;

    // Connected, so datagrams from anyone but the worker are dropped.
    socket
        .connect(addr)
        .await
        .map_err(|source| ExchangeError::Send { addr, source })?;
    socket
        .send(text.as_bytes())
        .await
        .map_err(|source| ExchangeError::Send { addr, source })?;

    let mut buf = vec![0u8; max_message_size.max(1)];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| ExchangeError::Timeout { addr, timeout })?
        .map_err(|source| ExchangeError::Recv { addr, source })?;
    tracing::trace!(%addr, bytes = n, "Worker reply received");

    buf.truncate(n);
    Ok(Message::bounded(buf, max_message_size))
}

/// Drives pipelines against a [`WorkerLauncher`].
pub struct Dispatcher {
    launcher: Arc<dyn WorkerLauncher>,
    reply_timeout: Duration,
    reply_bind: SocketAddr,
    chain_results: bool,
}

impl Dispatcher {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: &GatewayConfig) -> Self {
        Self {
            launcher,
            reply_timeout: config.reply_timeout,
            reply_bind: config.reply_bind,
            chain_results: config.chain_results,
        }
    }

    /// Run `codes` against the session's text and store the result in the
    /// session, partial or not.
    pub async fn run_pipeline(&self, session: &mut Session, codes: &[u8]) -> PipelineOutcome {
        let pipeline = Pipeline::decode(codes);
        if pipeline.len() < codes.len() {
            tracing::debug!(
                decoded = pipeline.len(),
                received = codes.len(),
                "Code string cut at first unrecognized byte"
            );
        }

        // An empty pipeline still returns the run's starting text.
        let mut text = if self.chain_results {
            session.current_text().clone()
        } else {
            session.original_text().clone()
        };
        let max = session.max_message_size();
        let requested = pipeline.len();
        let mut status = PipelineStatus::Complete;

        for (i, code) in pipeline.steps().iter().copied().enumerate() {
            match self.run_step(code, &text, max).await {
                Ok(reply) => {
                    tracing::debug!(step = i, %code, bytes = reply.len(), "Step complete");
                    text = reply;
                }
                Err(error) => {
                    tracing::warn!(step = i, %code, %error, "Pipeline aborted, returning partial result");
                    status = PipelineStatus::Partial {
                        completed: i,
                        requested,
                        error,
                    };
                    break;
                }
            }
        }

        session.replace_current(text.clone());
        PipelineOutcome { text, status }
    }

    async fn run_step(
        &self,
        code: TransformCode,
        text: &Message,
        max_message_size: usize,
    ) -> Result<Message, StepError> {
        // Held until the reply is in; dropping it tears the worker down.
        let lease = self.launcher.launch(code).await?;
        let reply = exchange(
            lease.addr(),
            text,
            self.reply_bind,
            self.reply_timeout,
            max_message_size,
        )
        .await
        .map_err(|source| StepError::Exchange { code, source })?;
        drop(lease);
        Ok(reply.trim_trailing_newline())
    }
}
