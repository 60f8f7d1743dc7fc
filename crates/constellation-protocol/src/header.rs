//! Common message header for CSCP, CHP and CMDP.
//!
//! The header frame is the concatenation of four MessagePack objects:
//! protocol identifier (string), sender (string), time (timestamp extension)
//! and tags (map). The tags map carries optional per-message metadata and may
//! be empty.

use chrono::{DateTime, Utc};
use constellation_core::{Dictionary, IntoValue, Value};

use crate::codec::{decode_value, encode_value};
use crate::error::ProtocolError;
use crate::Protocol;

/// Header of a CSCP1/CHP1/CMDP1 message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    protocol: Protocol,
    sender: String,
    time: DateTime<Utc>,
    tags: Dictionary,
}

impl MessageHeader {
    /// Create a header stamped with the current time.
    #[must_use]
    pub fn new(protocol: Protocol, sender: impl Into<String>) -> Self {
        Self {
            protocol,
            sender: sender.into(),
            time: Utc::now(),
            tags: Dictionary::new(),
        }
    }

    /// The protocol this header belongs to.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Canonical name of the sending host.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Message timestamp.
    #[must_use]
    pub const fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Header tags.
    #[must_use]
    pub const fn tags(&self) -> &Dictionary {
        &self.tags
    }

    /// Attach a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl IntoValue) {
        self.tags.insert(key, value);
    }

    /// Encode the header into a frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] if a tag value cannot be encoded.
    pub fn assemble(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::String(self.protocol.identifier().to_owned()))?;
        encode_value(&mut buf, &Value::String(self.sender.clone()))?;
        encode_value(&mut buf, &Value::Timestamp(self.time))?;
        encode_value(&mut buf, &Value::Dictionary(self.tags.clone()))?;
        Ok(buf)
    }

    /// Decode a header frame, checking the protocol identifier.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] for malformed frames and
    /// [`ProtocolError::UnexpectedProtocol`] if the frame belongs to a
    /// different protocol.
    pub fn disassemble(frame: &[u8], expected: Protocol) -> Result<Self, ProtocolError> {
        let mut cursor = frame;

        let identifier: String = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("protocol identifier: {err}")))?;
        let protocol = Protocol::from_identifier(&identifier)
            .ok_or_else(|| ProtocolError::decoding(format!("unknown protocol {identifier:?}")))?;
        if protocol != expected {
            return Err(ProtocolError::UnexpectedProtocol {
                expected,
                got: protocol,
            });
        }

        let sender: String = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("sender: {err}")))?;
        let time: DateTime<Utc> = decode_value(&mut cursor)?
            .get()
            .map_err(|err| ProtocolError::decoding(format!("time: {err}")))?;
        let tags = match decode_value(&mut cursor)? {
            Value::Dictionary(tags) => tags,
            other => {
                return Err(ProtocolError::decoding(format!(
                    "tags: expected dictionary, got {}",
                    other.type_name()
                )))
            }
        };

        Ok(Self {
            protocol,
            sender,
            time,
            tags,
        })
    }
}
