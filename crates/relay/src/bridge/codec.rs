//! Framed codecs for the client and readiness channels.
//!
//! Both use a 4-byte big-endian length prefix (LengthDelimitedCodec).
//! [`MessageCodec`] carries raw bytes bounded to the maximum message size;
//! [`JsonCodec`] carries serde_json values.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Message;

/// Hard cap on any single frame. Longer frames are a protocol error.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Length-prefixed frames decoded into [`Message`]s.
///
/// Decoded payloads are truncated to `max_message_size`; encoding sends the
/// bytes as given.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            inner: length_delimited(),
            max_message_size,
        }
    }

    /// Decode frames up to [`MAX_FRAME_LENGTH`] without truncation.
    pub fn unbounded() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                if frame.len() > self.max_message_size {
                    tracing::debug!(
                        frame_len = frame.len(),
                        max = self.max_message_size,
                        "Truncating oversized message"
                    );
                }
                Ok(Some(Message::bounded(frame.freeze(), self.max_message_size)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item, dst)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item.into_bytes(), dst)
    }
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::WorkerEvent;
    use crate::transform::TransformCode;

    #[test]
    fn message_frames_are_length_prefixed() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from_static(b"Hello"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"Hello");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.as_bytes(), b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, b'a'][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"bc");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_bytes(), b"abc");
    }

    #[test]
    fn decode_truncates_to_message_size() {
        let mut codec = MessageCodec::new(3);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abcdef"), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.as_bytes(), b"abc");
    }

    #[test]
    fn empty_frame_decodes_to_empty_message() {
        let mut codec = MessageCodec::new(100);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = MessageCodec::new(100);
        let len = (MAX_FRAME_LENGTH as u32 + 1).to_be_bytes();
        let mut buf = BytesMut::from(&len[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_codec_carries_worker_events() {
        let mut codec = JsonCodec::<WorkerEvent>::new();
        let mut buf = BytesMut::new();

        let event = WorkerEvent::Ready {
            kind: TransformCode::Caesar,
            addr: "127.0.0.1:8085".parse().unwrap(),
        };
        codec.encode(event.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn json_codec_rejects_garbage() {
        let mut codec = JsonCodec::<WorkerEvent>::new();
        let mut buf = BytesMut::new();
        MessageCodec::unbounded()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
