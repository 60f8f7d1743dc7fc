//! Wire codecs for the Constellation protocol family.
//!
//! Four protocols share one value model and one framing layer:
//!
//! - [`chirp`] - fixed 42-byte UDP discovery datagrams
//! - [`cscp`] - request/reply command messages (CSCP1)
//! - [`chp`] - heartbeat messages (CHP1)
//! - [`cmdp`] - topic-tagged monitoring messages (CMDP1)
//!
//! [`codec`] implements MessagePack encoding of the dynamic
//! [`Value`](constellation_core::Value) tree including the standard timestamp
//! extension, [`frame`] the length-prefixed multipart framing used on every
//! TCP connection, and [`header`] the common message header.

#![forbid(unsafe_code)]

pub mod chirp;
pub mod chp;
pub mod cmdp;
pub mod codec;
pub mod cscp;
pub mod error;
pub mod frame;
pub mod header;

pub use chirp::{ChirpMessage, ChirpMessageType, ServiceIdentifier, CHIRP_PORT};
pub use chp::ChpMessage;
pub use cmdp::{CmdpMessage, CmdpNotification};
pub use cscp::{CscpMessage, CscpMessageType};
pub use error::ProtocolError;
pub use frame::Multipart;
pub use header::MessageHeader;

use std::fmt;

/// The Constellation protocols with their wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Constellation Satellite Control Protocol, version 1.
    Cscp1,
    /// Constellation Heartbeat Protocol, version 1.
    Chp1,
    /// Constellation Monitoring & Data Protocol, version 1.
    Cmdp1,
}

impl Protocol {
    /// The identifier string carried in message headers.
    #[must_use]
    pub const fn identifier(self) -> &'static str {
        match self {
            Protocol::Cscp1 => "CSCP\x01",
            Protocol::Chp1 => "CHP\x01",
            Protocol::Cmdp1 => "CMDP\x01",
        }
    }

    /// Parse a header identifier string.
    #[must_use]
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "CSCP\x01" => Some(Protocol::Cscp1),
            "CHP\x01" => Some(Protocol::Chp1),
            "CMDP\x01" => Some(Protocol::Cmdp1),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Cscp1 => "CSCP1",
            Protocol::Chp1 => "CHP1",
            Protocol::Cmdp1 => "CMDP1",
        };
        f.write_str(name)
    }
}
