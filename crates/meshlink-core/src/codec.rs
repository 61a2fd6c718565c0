//! Length-prefixed message framing.
//!
//! ```text
//! +------------------+---------------------------+
//! | Length (4B BE)   | Envelope (UTF-8 JSON)     |
//! +------------------+---------------------------+
//! ```
//!
//! [`MessageCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.
//! A payload that fails to parse is yielded as an `Err` item instead of
//! terminating the stream, so one bad frame never poisons the next. A length
//! prefix above the codec's limit is a stream error: nothing after it can be
//! trusted to be framed.

use crate::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound on an envelope's length, matching tokio-util's
/// `LengthDelimitedCodec`.
pub const MAX_FRAME: usize = 8 * 1024 * 1024;

/// A frame payload that is not a valid envelope.
#[derive(Debug, thiserror::Error)]
#[error("malformed message payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Stream-level framing errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("could not serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Framing codec for [`Message`]s.
///
/// The length prefix is read once per frame and held until the whole payload
/// has arrived.
#[derive(Debug)]
pub struct MessageCodec {
    length: Option<usize>,
    max_frame: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            length: None,
            max_frame: MAX_FRAME,
        }
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse envelopes longer than `max_frame` bytes, in either direction.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            length: None,
            max_frame,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, DecodeError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.length {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_PREFIX {
                    return Ok(None);
                }
                let length = src.get_u32() as usize;
                if length > self.max_frame {
                    return Err(CodecError::FrameTooLarge(length));
                }
                self.length = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.length = None;
        let payload = src.split_to(length);
        Ok(Some(serde_json::from_slice(&payload).map_err(DecodeError::from)))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_frame {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        let length =
            u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge(payload.len()))?;
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(length);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Encode one message into a standalone frame.
pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(message.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Stateful consumer of arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    codec: MessageCodec,
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `chunk` and return every frame it completes, in arrival order.
    ///
    /// Fails once a length prefix exceeds the frame limit; the decoder is
    /// unusable afterwards.
    pub fn feed(
        &mut self,
        chunk: &[u8],
    ) -> Result<Vec<Result<Message, DecodeError>>, CodecError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes received but not yet part of an emitted frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.codec.length.map_or(0, |_| LENGTH_PREFIX)
    }
}
