//! CSCP1 command messages.
//!
//! A CSCP message is two or three frames: the message header, the verb frame
//! (type byte and verb string as two concatenated MessagePack objects) and an
//! optional opaque payload.

use std::fmt;

use bytes::Bytes;
use constellation_core::Value;

use crate::codec::{decode_value, encode_value};
use crate::error::ProtocolError;
use crate::frame::Multipart;
use crate::header::MessageHeader;
use crate::Protocol;

/// Verb types of a CSCP message; the reply type encodes the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CscpMessageType {
    /// A command request.
    Request = 0,
    /// Command succeeded.
    Success = 1,
    /// Command is valid but not implemented by this satellite.
    NotImplemented = 2,
    /// Command is valid but arguments are missing or undecodable.
    Incomplete = 3,
    /// Command is not valid in the current state.
    Invalid = 4,
    /// Command is not known at all.
    Unknown = 5,
    /// The message itself could not be handled.
    Error = 6,
}

impl CscpMessageType {
    fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Self::Request),
            1 => Ok(Self::Success),
            2 => Ok(Self::NotImplemented),
            3 => Ok(Self::Incomplete),
            4 => Ok(Self::Invalid),
            5 => Ok(Self::Unknown),
            6 => Ok(Self::Error),
            other => Err(ProtocolError::decoding(format!(
                "invalid CSCP message type {other}"
            ))),
        }
    }
}

impl fmt::Display for CscpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQUEST",
            Self::Success => "SUCCESS",
            Self::NotImplemented => "NOTIMPLEMENTED",
            Self::Incomplete => "INCOMPLETE",
            Self::Invalid => "INVALID",
            Self::Unknown => "UNKNOWN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A CSCP1 request or reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CscpMessage {
    header: MessageHeader,
    verb_type: CscpMessageType,
    verb: String,
    payload: Option<Bytes>,
}

impl CscpMessage {
    /// Create a message without payload.
    #[must_use]
    pub fn new(sender: impl Into<String>, verb_type: CscpMessageType, verb: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new(Protocol::Cscp1, sender),
            verb_type,
            verb: verb.into(),
            payload: None,
        }
    }

    /// Create a request message.
    #[must_use]
    pub fn request(sender: impl Into<String>, verb: impl Into<String>) -> Self {
        Self::new(sender, CscpMessageType::Request, verb)
    }

    /// Attach a payload, replacing any existing one.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        self.payload = if payload.is_empty() { None } else { Some(payload) };
        self
    }

    /// The message header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// The verb type.
    #[must_use]
    pub const fn verb_type(&self) -> CscpMessageType {
        self.verb_type
    }

    /// The verb string (command name on requests, description on replies).
    #[must_use]
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// The payload, if any.
    #[must_use]
    pub const fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Whether a non-empty payload is attached.
    #[must_use]
    pub const fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Encode into wire frames.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] if the header cannot be encoded.
    pub fn assemble(&self) -> Result<Multipart, ProtocolError> {
        let mut message = Multipart::new();
        message.push(self.header.assemble()?);

        let mut verb_frame = Vec::new();
        encode_value(&mut verb_frame, &Value::UInt(u64::from(self.verb_type as u8)))?;
        encode_value(&mut verb_frame, &Value::String(self.verb.clone()))?;
        message.push(verb_frame);

        if let Some(payload) = &self.payload {
            message.push(payload.clone());
        }
        Ok(message)
    }

    /// Decode wire frames into a message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] for messages with the wrong frame
    /// count or malformed header/verb frames.
    pub fn disassemble(frames: &Multipart) -> Result<Self, ProtocolError> {
        if frames.len() < 2 || frames.len() > 3 {
            return Err(ProtocolError::decoding(format!(
                "CSCP1 messages have 2 or 3 frames, got {}",
                frames.len()
            )));
        }

        let header_frame = frames
            .frame(0)
            .ok_or_else(|| ProtocolError::decoding("missing header frame"))?;
        let header = MessageHeader::disassemble(header_frame, Protocol::Cscp1)?;

        let verb_frame = frames
            .frame(1)
            .ok_or_else(|| ProtocolError::decoding("missing verb frame"))?;
        let mut cursor = verb_frame.as_ref();
        let type_byte: u64 = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("verb type: {err}")))?;
        let verb_type = CscpMessageType::from_u8(
            u8::try_from(type_byte)
                .map_err(|_| ProtocolError::decoding("verb type out of range"))?,
        )?;
        let verb: String = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("verb string: {err}")))?;

        let payload = frames
            .frame(2)
            .filter(|frame| !frame.is_empty())
            .cloned();

        Ok(Self {
            header,
            verb_type,
            verb,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips() {
        let message = CscpMessage::request("MissionControl.main", "get_state");
        let decoded = CscpMessage::disassemble(&message.assemble().unwrap()).unwrap();
        assert_eq!(decoded.verb_type(), CscpMessageType::Request);
        assert_eq!(decoded.verb(), "get_state");
        assert_eq!(decoded.header().sender(), "MissionControl.main");
        assert!(!decoded.has_payload());
    }

    #[test]
    fn payload_roundtrips() {
        let message = CscpMessage::new("Sat.one", CscpMessageType::Success, "ok")
            .with_payload(vec![0xde, 0xad]);
        let decoded = CscpMessage::disassemble(&message.assemble().unwrap()).unwrap();
        assert_eq!(decoded.payload().map(|p| p.as_ref()), Some(&[0xde, 0xad][..]));
    }

    #[test]
    fn empty_payload_is_dropped() {
        let message = CscpMessage::request("Sat.one", "launch").with_payload(Vec::new());
        assert!(!message.has_payload());
        assert_eq!(message.assemble().unwrap().len(), 2);
    }

    #[test]
    fn frame_count_is_checked() {
        let single = Multipart::from(vec![b"x".to_vec()]);
        assert!(CscpMessage::disassemble(&single).is_err());
        let four = Multipart::from(vec![vec![]; 4]);
        assert!(CscpMessage::disassemble(&four).is_err());
    }

    #[test]
    fn reply_types_roundtrip() {
        for verb_type in [
            CscpMessageType::Success,
            CscpMessageType::NotImplemented,
            CscpMessageType::Incomplete,
            CscpMessageType::Invalid,
            CscpMessageType::Unknown,
            CscpMessageType::Error,
        ] {
            let message = CscpMessage::new("Sat.one", verb_type, "reply");
            let decoded = CscpMessage::disassemble(&message.assemble().unwrap()).unwrap();
            assert_eq!(decoded.verb_type(), verb_type);
        }
    }

    #[test]
    fn wrong_protocol_header_is_rejected() {
        let chp_header = MessageHeader::new(Protocol::Chp1, "Sat.one").assemble().unwrap();
        let mut frames = Multipart::new();
        frames.push(chp_header);
        frames.push(vec![0x00]);
        assert!(CscpMessage::disassemble(&frames).is_err());
    }
}
