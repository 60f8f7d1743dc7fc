//! CHP1 heartbeat messages.
//!
//! A heartbeat is three frames: an empty subscription topic frame, the
//! message header, and a body frame carrying the FSM state byte, the send
//! interval in milliseconds and an optional status string as concatenated
//! MessagePack objects. Receivers expect the next beat within roughly 1.5x
//! the advertised interval.

use std::time::Duration;

use bytes::Bytes;
use constellation_core::{State, Value};

use crate::codec::{decode_value, encode_value};
use crate::error::ProtocolError;
use crate::frame::Multipart;
use crate::header::MessageHeader;
use crate::Protocol;

/// A CHP1 heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ChpMessage {
    header: MessageHeader,
    state: State,
    interval: Duration,
    status: Option<String>,
}

impl ChpMessage {
    /// Create a heartbeat stamped with the current time.
    #[must_use]
    pub fn new(sender: impl Into<String>, state: State, interval: Duration) -> Self {
        Self {
            header: MessageHeader::new(Protocol::Chp1, sender),
            state,
            interval,
            status: None,
        }
    }

    /// Attach a status string.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// The message header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// The reported FSM state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// The advertised send interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// The optional status string.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Encode into wire frames.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] if encoding fails.
    pub fn assemble(&self) -> Result<Multipart, ProtocolError> {
        let mut message = Multipart::new();
        message.push(Bytes::new());
        message.push(self.header.assemble()?);

        let interval_ms = u16::try_from(self.interval.as_millis())
            .map_err(|_| ProtocolError::decoding("heartbeat interval exceeds u16 milliseconds"))?;
        let mut body = Vec::new();
        encode_value(&mut body, &Value::UInt(u64::from(self.state.as_u8())))?;
        encode_value(&mut body, &Value::UInt(u64::from(interval_ms)))?;
        if let Some(status) = &self.status {
            encode_value(&mut body, &Value::String(status.clone()))?;
        }
        message.push(body);
        Ok(message)
    }

    /// Decode wire frames into a heartbeat.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] for malformed frames or unknown
    /// state bytes.
    pub fn disassemble(frames: &Multipart) -> Result<Self, ProtocolError> {
        if frames.len() != 3 {
            return Err(ProtocolError::decoding(format!(
                "CHP1 messages have 3 frames, got {}",
                frames.len()
            )));
        }

        let header_frame = frames
            .frame(1)
            .ok_or_else(|| ProtocolError::decoding("missing header frame"))?;
        let header = MessageHeader::disassemble(header_frame, Protocol::Chp1)?;

        let body = frames
            .frame(2)
            .ok_or_else(|| ProtocolError::decoding("missing body frame"))?;
        let mut cursor = body.as_ref();

        let state_byte: u64 = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("state: {err}")))?;
        let state = State::from_u8(
            u8::try_from(state_byte).map_err(|_| ProtocolError::decoding("state out of range"))?,
        )
        .map_err(|err| ProtocolError::decoding(err.to_string()))?;

        let interval_ms: u64 = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("interval: {err}")))?;
        let interval_ms =
            u16::try_from(interval_ms).map_err(|_| ProtocolError::decoding("interval out of range"))?;

        let status = if cursor.is_empty() {
            None
        } else {
            Some(
                decode_value(&mut cursor)?
                    .get()
                    .map_err(|err| ProtocolError::decoding(format!("status: {err}")))?,
            )
        };

        Ok(Self {
            header,
            state,
            interval: Duration::from_millis(u64::from(interval_ms)),
            status,
        })
    }
}
