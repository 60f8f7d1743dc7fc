//! CHIRP discovery datagrams.
//!
//! Implements the fixed-size broadcast frame of the Constellation Host
//! Identification and Reconnaissance Protocol.
//!
//! # Wire Format
//!
//! ```text
//! CHIRP FRAME (42 bytes)
//!
//!   Bytes 0-4:    Identifier ("CHIRP")
//!   Byte  5:      Version (0x01)
//!   Byte  6:      Message type (1 = REQUEST, 2 = OFFER, 3 = DEPART)
//!   Bytes 7-22:   Group ID (MD5 of the group name)
//!   Bytes 23-38:  Host ID (MD5 of the canonical host name)
//!   Byte  39:     Service identifier (1 = CONTROL, 2 = HEARTBEAT,
//!                 3 = MONITORING, 4 = DATA)
//!   Bytes 40-41:  Port (u16 BE, 0 on REQUEST)
//! ```

use std::fmt;

use constellation_core::Md5Hash;

use crate::error::ProtocolError;

/// Well-known UDP port for CHIRP broadcasts.
pub const CHIRP_PORT: u16 = 7123;

/// Protocol identifier at the start of every frame.
pub const CHIRP_IDENTIFIER: &[u8; 5] = b"CHIRP";

/// Protocol version byte.
pub const CHIRP_VERSION: u8 = 0x01;

/// Total frame length in bytes.
pub const CHIRP_MESSAGE_LENGTH: usize = 42;

/// CHIRP message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChirpMessageType {
    /// Ask peers to re-offer services of a given kind.
    Request = 1,
    /// Announce a registered service.
    Offer = 2,
    /// Withdraw a previously offered service.
    Depart = 3,
}

impl ChirpMessageType {
    fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(Self::Request),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Depart),
            other => Err(ProtocolError::decoding(format!(
                "invalid CHIRP message type {other}"
            ))),
        }
    }
}

impl fmt::Display for ChirpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQUEST",
            Self::Offer => "OFFER",
            Self::Depart => "DEPART",
        };
        f.write_str(name)
    }
}

/// The service kinds a satellite can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServiceIdentifier {
    /// CSCP command receiver.
    Control = 1,
    /// CHP heartbeat publisher.
    Heartbeat = 2,
    /// CMDP log/metric publisher.
    Monitoring = 3,
    /// Data-plane producer endpoint.
    Data = 4,
}

impl ServiceIdentifier {
    fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(Self::Control),
            2 => Ok(Self::Heartbeat),
            3 => Ok(Self::Monitoring),
            4 => Ok(Self::Data),
            other => Err(ProtocolError::decoding(format!(
                "invalid service identifier {other}"
            ))),
        }
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "CONTROL",
            Self::Heartbeat => "HEARTBEAT",
            Self::Monitoring => "MONITORING",
            Self::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// A decoded CHIRP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChirpMessage {
    /// Message kind.
    pub message_type: ChirpMessageType,
    /// Group the sender belongs to.
    pub group_id: Md5Hash,
    /// Identity of the sending host.
    pub host_id: Md5Hash,
    /// Service kind the message refers to.
    pub service: ServiceIdentifier,
    /// TCP port of the service; zero on REQUEST.
    pub port: u16,
}

impl ChirpMessage {
    /// Encode into the fixed 42-byte frame.
    #[must_use]
    pub fn assemble(&self) -> [u8; CHIRP_MESSAGE_LENGTH] {
        let mut frame = [0_u8; CHIRP_MESSAGE_LENGTH];
        frame[0..5].copy_from_slice(CHIRP_IDENTIFIER);
        frame[5] = CHIRP_VERSION;
        frame[6] = self.message_type as u8;
        frame[7..23].copy_from_slice(self.group_id.as_bytes());
        frame[23..39].copy_from_slice(self.host_id.as_bytes());
        frame[39] = self.service as u8;
        frame[40..42].copy_from_slice(&self.port.to_be_bytes());
        frame
    }

    /// Decode a received datagram.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] for frames of the wrong length,
    /// wrong magic, unknown version, or out-of-range type/service bytes.
    pub fn disassemble(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() != CHIRP_MESSAGE_LENGTH {
            return Err(ProtocolError::decoding(format!(
                "message length is not {CHIRP_MESSAGE_LENGTH} bytes"
            )));
        }
        if &frame[0..5] != CHIRP_IDENTIFIER {
            return Err(ProtocolError::decoding("not a CHIRP broadcast"));
        }
        if frame[5] != CHIRP_VERSION {
            return Err(ProtocolError::decoding("not a CHIRP v1 broadcast"));
        }

        let message_type = ChirpMessageType::from_u8(frame[6])?;

        let mut group = [0_u8; 16];
        group.copy_from_slice(&frame[7..23]);
        let mut host = [0_u8; 16];
        host.copy_from_slice(&frame[23..39]);

        let service = ServiceIdentifier::from_u8(frame[39])?;
        let port = u16::from_be_bytes([frame[40], frame[41]]);

        Ok(Self {
            message_type,
            group_id: Md5Hash::from_bytes(group),
            host_id: Md5Hash::from_bytes(host),
            service,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChirpMessage {
        ChirpMessage {
            message_type: ChirpMessageType::Offer,
            group_id: Md5Hash::new("edda"),
            host_id: Md5Hash::new("Sputnik.one"),
            service: ServiceIdentifier::Control,
            port: 55001,
        }
    }

    #[test]
    fn frame_layout_is_fixed() {
        let frame = sample().assemble();
        assert_eq!(frame.len(), CHIRP_MESSAGE_LENGTH);
        assert_eq!(&frame[0..5], b"CHIRP");
        assert_eq!(frame[5], 0x01);
        assert_eq!(frame[6], 2);
        assert_eq!(&frame[7..23], Md5Hash::new("edda").as_bytes());
        assert_eq!(frame[39], 1);
        assert_eq!(u16::from_be_bytes([frame[40], frame[41]]), 55001);
    }

    #[test]
    fn frames_roundtrip() {
        let message = sample();
        assert_eq!(ChirpMessage::disassemble(&message.assemble()).unwrap(), message);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(ChirpMessage::disassemble(&[0_u8; 41]).is_err());
        assert!(ChirpMessage::disassemble(&[0_u8; 43]).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut frame = sample().assemble();
        frame[0] = b'X';
        assert!(ChirpMessage::disassemble(&frame).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut frame = sample().assemble();
        frame[5] = 0x02;
        assert!(ChirpMessage::disassemble(&frame).is_err());
    }

    #[test]
    fn out_of_range_type_and_service_are_rejected() {
        let mut frame = sample().assemble();
        frame[6] = 0;
        assert!(ChirpMessage::disassemble(&frame).is_err());

        let mut frame = sample().assemble();
        frame[39] = 5;
        assert!(ChirpMessage::disassemble(&frame).is_err());
    }

    #[test]
    fn request_carries_zero_port() {
        let message = ChirpMessage {
            message_type: ChirpMessageType::Request,
            port: 0,
            ..sample()
        };
        let decoded = ChirpMessage::disassemble(&message.assemble()).unwrap();
        assert_eq!(decoded.port, 0);
        assert_eq!(decoded.message_type, ChirpMessageType::Request);
    }
}
