//! Wire types for the gateway's two framed channels.
//!
//! - **Client channel** (TCP): a selector frame, then one payload frame.
//!   Results go back as a single frame of text followed by `\n`.
//! - **Readiness channel** (worker stdout): [`WorkerEvent`] JSON frames telling
//!   the launcher when a spawned worker has bound its socket.
//!
//! Worker requests and replies travel as bare UDP datagrams; the datagram
//! boundary is their envelope.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::transform::TransformCode;

/// Client command, chosen by the first byte of a selector frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `'1'`: the next frame replaces the session's sentence.
    SetSentence,
    /// `'2'`: the next frame is a code string to run against the sentence.
    RunTransforms,
}

impl Command {
    /// Only the first byte is meaningful; an empty frame selects nothing.
    pub fn from_selector(frame: &[u8]) -> Option<Self> {
        match frame.first()? {
            b'1' => Some(Self::SetSentence),
            b'2' => Some(Self::RunTransforms),
            _ => None,
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Self::SetSentence => b'1',
            Self::RunTransforms => b'2',
        }
    }
}

/// A payload bounded to the gateway's maximum message size.
///
/// Built once at the transport boundary so session and pipeline code never
/// deal with raw byte counts.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    /// Wrap `bytes`, truncating to at most `max` bytes.
    pub fn bounded(bytes: impl Into<Bytes>, max: usize) -> Self {
        let mut bytes = bytes.into();
        bytes.truncate(max);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop one trailing `\n` (and a preceding `\r`) if present.
    pub fn trim_trailing_newline(mut self) -> Self {
        if self.0.ends_with(b"\n") {
            self.0.truncate(self.0.len() - 1);
            if self.0.ends_with(b"\r") {
                self.0.truncate(self.0.len() - 1);
            }
        }
        self
    }

    /// The text followed by a single `\n`, as sent back to clients.
    pub fn framed_line(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.0.len() + 1);
        out.put_slice(&self.0);
        out.put_u8(b'\n');
        out.freeze()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Messages from a spawned worker to its launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Socket bound; the worker will now accept its datagram.
    Ready {
        kind: TransformCode,
        addr: SocketAddr,
    },

    /// Worker could not start (bind failure, bad arguments).
    Failed { error: String },
}
