//! Multipart framing for the TCP transports.
//!
//! Every CSCP/CHP/CMDP connection carries a stream of multipart messages. A
//! message is a sequence of frames; each frame is encoded as
//!
//! ```text
//!   Byte  0:     flags (bit 0: another frame follows)
//!   Bytes 1-4:   payload length (u32 BE)
//!   Bytes 5...:  payload
//! ```
//!
//! and the message ends with the first frame whose more-bit is clear. A
//! message always contains at least one frame (which may be empty, e.g. the
//! subscription topic frame of a heartbeat message).

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Flag bit: more frames follow in this message.
const FLAG_MORE: u8 = 0b0000_0001;

/// Upper bound on a single frame payload (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on the number of frames per message.
pub const MAX_FRAMES: usize = 64;

/// A multipart message: an ordered sequence of byte frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multipart {
    frames: Vec<Bytes>,
}

impl Multipart {
    /// Create an empty message builder.
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Append a frame.
    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the message has no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Access a frame by index.
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    /// Iterate over the frames.
    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.frames.iter()
    }

    /// Write this message to an async stream.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] for oversized frames and
    /// [`ProtocolError::Io`] on transport failure. An empty message is
    /// written as a single empty frame.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let empty = [Bytes::new()];
        let frames: &[Bytes] = if self.frames.is_empty() { &empty } else { &self.frames };

        for (index, frame) in frames.iter().enumerate() {
            if frame.len() > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    len: frame.len(),
                    max: MAX_FRAME_LEN,
                });
            }
            let more = index + 1 < frames.len();
            let flags = if more { FLAG_MORE } else { 0 };
            let len = u32::try_from(frame.len()).map_err(|_| ProtocolError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            })?;
            writer.write_u8(flags).await?;
            writer.write_u32(len).await?;
            writer.write_all(frame).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Read one message from an async stream.
    ///
    /// # Errors
    /// Returns [`ProtocolError::FrameTooLarge`] if a frame exceeds
    /// [`MAX_FRAME_LEN`], [`ProtocolError::Decoding`] if the frame count
    /// exceeds [`MAX_FRAMES`] and [`ProtocolError::Io`] on transport failure
    /// (including a cleanly closed connection).
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut message = Multipart::new();
        loop {
            let flags = reader.read_u8().await?;
            let len = reader.read_u32().await? as usize;
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }
            let mut frame = vec![0_u8; len];
            reader.read_exact(&mut frame).await?;
            message.push(frame);
            if flags & FLAG_MORE == 0 {
                return Ok(message);
            }
            if message.len() >= MAX_FRAMES {
                return Err(ProtocolError::decoding("too many frames in message"));
            }
        }
    }
}

impl FromIterator<Bytes> for Multipart {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Vec<u8>>> for Multipart {
    fn from(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into_iter().map(Bytes::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(message: &Multipart) -> Multipart {
        let mut buf = Vec::new();
        message.write_to(&mut buf).await.unwrap();
        Multipart::read_from(&mut buf.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn single_frame_roundtrips() {
        let message = Multipart::from(vec![b"hello".to_vec()]);
        assert_eq!(roundtrip(&message).await, message);
    }

    #[tokio::test]
    async fn multi_frame_roundtrips() {
        let message = Multipart::from(vec![b"topic".to_vec(), Vec::new(), b"payload".to_vec()]);
        let decoded = roundtrip(&message).await;
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.frame(1).unwrap().len(), 0);
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn empty_message_becomes_one_empty_frame() {
        let decoded = roundtrip(&Multipart::new()).await;
        assert_eq!(decoded.len(), 1);
        assert!(decoded.frame(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let message = Multipart::from(vec![b"payload".to_vec()]);
        let mut buf = Vec::new();
        message.write_to(&mut buf).await.unwrap();
        buf.truncate(buf.len() - 2);
        assert!(Multipart::read_from(&mut buf.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        // flags = 0, length = u32::MAX
        let buf = vec![0x00, 0xff, 0xff, 0xff, 0xff];
        let err = Multipart::read_from(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }
}
