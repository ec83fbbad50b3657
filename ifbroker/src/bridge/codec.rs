//! Framed codecs for the helper byte channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization,
//! over any AsyncRead/AsyncWrite. Frames carry a 2-byte big-endian length
//! prefix. Inbound frames additionally carry a one-byte marker ahead of
//! the payload; outbound command frames are bare payloads.
//!
//! Both codecs implement both directions so tests and in-process fakes can
//! stand in for the helper; the supervisor itself only encodes commands and
//! decodes inbound frames.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Command, NOTIFICATION_MARKER, Notification, RESPONSE_MARKER, Response};

fn framing() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(u16::MAX as usize)
        .new_codec()
}

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Codec for command frames: `[2-byte length][payload]`.
pub struct CommandCodec {
    inner: LengthDelimitedCodec,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self { inner: framing() }
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = item.tag();
        let payload = serde_json::to_vec(&item).map_err(invalid_data)?;
        tracing::trace!(cmd = tag, size_bytes = payload.len(), "encoding command frame");
        self.inner.encode(Bytes::from(payload), dst)
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let command = serde_json::from_slice(&bytes).map_err(invalid_data)?;
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Response to the most recent outstanding command.
    Response(Response),
    /// Unsolicited interface event.
    Notification(Notification),
}

/// Codec for inbound frames: `[2-byte length][1-byte marker][payload]`.
///
/// A malformed frame decodes to `io::ErrorKind::InvalidData` without
/// desynchronizing the stream; the length prefix has already been consumed,
/// so the next frame decodes normally.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { inner: framing() }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let Some((&marker, payload)) = frame.split_first() else {
            return Err(invalid_data("empty frame"));
        };
        match marker {
            RESPONSE_MARKER => {
                let response = serde_json::from_slice(payload).map_err(invalid_data)?;
                Ok(Some(InboundFrame::Response(response)))
            }
            NOTIFICATION_MARKER => {
                let notification = serde_json::from_slice(payload).map_err(invalid_data)?;
                Ok(Some(InboundFrame::Notification(notification)))
            }
            other => Err(invalid_data(format!("unknown frame marker 0x{other:02x}"))),
        }
    }
}

impl Encoder<InboundFrame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: InboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (marker, payload) = match &item {
            InboundFrame::Response(r) => (RESPONSE_MARKER, serde_json::to_vec(r)),
            InboundFrame::Notification(n) => (NOTIFICATION_MARKER, serde_json::to_vec(n)),
        };
        let payload = payload.map_err(invalid_data)?;
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(marker);
        buf.extend_from_slice(&payload);
        self.inner.encode(Bytes::from(buf), dst)
    }
}
