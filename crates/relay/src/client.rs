//! Typed client for the gateway protocol.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;

use crate::bridge::codec::MessageCodec;
use crate::bridge::protocol::{Command, Message};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("gateway closed the connection")]
    Closed,
}

/// One connection, and therefore one session, on the gateway.
pub struct RelayClient {
    framed: Framed<TcpStream, MessageCodec>,
}

impl RelayClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, MessageCodec::unbounded()),
        })
    }

    /// Replace the session's sentence. The gateway does not reply.
    pub async fn set_sentence(&mut self, text: impl Into<Bytes>) -> Result<(), ClientError> {
        self.command(Command::SetSentence, text.into()).await
    }

    /// Run `codes` and return the result with its trailing newline removed.
    pub async fn transform(&mut self, codes: &str) -> Result<String, ClientError> {
        let reply = self.transform_raw(codes.as_bytes().to_vec()).await?;
        Ok(reply.trim_trailing_newline().to_string_lossy())
    }

    /// Run `codes` and return the reply frame exactly as sent.
    pub async fn transform_raw(&mut self, codes: impl Into<Bytes>) -> Result<Message, ClientError> {
        self.command(Command::RunTransforms, codes.into()).await?;
        match self.framed.next().await {
            Some(frame) => Ok(frame?),
            None => Err(ClientError::Closed),
        }
    }

    /// Send a raw selector frame. Anything but `'1'` or `'2'` ends the session.
    pub async fn send_selector(&mut self, selector: impl Into<Bytes>) -> Result<(), ClientError> {
        self.framed.send(selector.into()).await?;
        Ok(())
    }

    /// Close the write half and wait for the gateway to hang up.
    pub async fn close(mut self) -> Result<(), ClientError> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        while let Some(frame) = self.framed.next().await {
            frame?;
        }
        Ok(())
    }

    async fn command(&mut self, command: Command, payload: Bytes) -> Result<(), ClientError> {
        self.framed
            .feed(Bytes::copy_from_slice(&[command.selector()]))
            .await?;
        self.framed.send(payload).await?;
        Ok(())
    }
}
