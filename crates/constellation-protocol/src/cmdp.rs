//! CMDP1 monitoring messages.
//!
//! A monitoring message is three frames: the topic string, the message header
//! and a payload. Topics are `LOG/<LEVEL>/<domain>` for log records,
//! `STAT/<name>` for metrics and `NOTICE/...` for notifications whose payload
//! is a dictionary of available topics and their descriptions.

use bytes::Bytes;
use constellation_core::Dictionary;

use crate::codec::{decode_dictionary, encode_dictionary};
use crate::error::ProtocolError;
use crate::frame::Multipart;
use crate::header::MessageHeader;
use crate::Protocol;

/// Topic prefix of log messages.
pub const LOG_TOPIC_PREFIX: &str = "LOG/";

/// Topic prefix of metric messages.
pub const STAT_TOPIC_PREFIX: &str = "STAT/";

/// Topic prefix of notification messages.
pub const NOTICE_TOPIC_PREFIX: &str = "NOTICE/";

/// Topic used for topic-availability notifications.
pub const NOTICE_TOPICS: &str = "NOTICE/TOPICS";

/// A CMDP1 message.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdpMessage {
    topic: String,
    header: MessageHeader,
    payload: Bytes,
}

impl CmdpMessage {
    /// Create a message with an arbitrary topic.
    #[must_use]
    pub fn new(sender: impl Into<String>, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            header: MessageHeader::new(Protocol::Cmdp1, sender),
            payload: payload.into(),
        }
    }

    /// Create a log message with topic `LOG/<LEVEL>/<domain>`.
    #[must_use]
    pub fn log(sender: impl Into<String>, level: &str, domain: &str, message: &str) -> Self {
        Self::new(
            sender,
            format!("{LOG_TOPIC_PREFIX}{}/{domain}", level.to_uppercase()),
            message.as_bytes().to_vec(),
        )
    }

    /// Create a metric message with topic `STAT/<name>`.
    #[must_use]
    pub fn stat(sender: impl Into<String>, name: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(sender, format!("{STAT_TOPIC_PREFIX}{}", name.to_uppercase()), payload)
    }

    /// The topic string.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The message header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// The payload bytes.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether this is a notification message.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.topic.starts_with(NOTICE_TOPIC_PREFIX)
    }

    /// Encode into wire frames.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] if the header cannot be encoded.
    pub fn assemble(&self) -> Result<Multipart, ProtocolError> {
        let mut message = Multipart::new();
        message.push(self.topic.clone().into_bytes());
        message.push(self.header.assemble()?);
        message.push(self.payload.clone());
        Ok(message)
    }

    /// Decode wire frames into a message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] for malformed frames.
    pub fn disassemble(frames: &Multipart) -> Result<Self, ProtocolError> {
        if frames.len() != 3 {
            return Err(ProtocolError::decoding(format!(
                "CMDP1 messages have 3 frames, got {}",
                frames.len()
            )));
        }

        let topic_frame = frames
            .frame(0)
            .ok_or_else(|| ProtocolError::decoding("missing topic frame"))?;
        let topic = std::str::from_utf8(topic_frame)
            .map_err(|_| ProtocolError::decoding("topic is not UTF-8"))?
            .to_owned();

        let header_frame = frames
            .frame(1)
            .ok_or_else(|| ProtocolError::decoding("missing header frame"))?;
        let header = MessageHeader::disassemble(header_frame, Protocol::Cmdp1)?;

        let payload = frames
            .frame(2)
            .cloned()
            .ok_or_else(|| ProtocolError::decoding("missing payload frame"))?;

        Ok(Self { topic, header, payload })
    }
}

/// A decoded topic-availability notification.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdpNotification {
    header: MessageHeader,
    topics: Dictionary,
}

impl CmdpNotification {
    /// Build the notification message for a set of offered topics.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decoding`] if the dictionary cannot be
    /// encoded.
    pub fn message(sender: impl Into<String>, topics: &Dictionary) -> Result<CmdpMessage, ProtocolError> {
        Ok(CmdpMessage::new(sender, NOTICE_TOPICS, encode_dictionary(topics)?))
    }

    /// Decode a notification from a CMDP message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::IncorrectType`] if the message is not a
    /// notification and [`ProtocolError::Decoding`] if the payload is not a
    /// topic dictionary.
    pub fn from_message(message: &CmdpMessage) -> Result<Self, ProtocolError> {
        if !message.is_notification() {
            return Err(ProtocolError::IncorrectType(format!(
                "topic {:?} is not a notification",
                message.topic()
            )));
        }
        Ok(Self {
            header: message.header().clone(),
            topics: decode_dictionary(message.payload())?,
        })
    }

    /// The notification header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Offered topics and their descriptions.
    #[must_use]
    pub const fn topics(&self) -> &Dictionary {
        &self.topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_topic_is_uppercased() {
        let message = CmdpMessage::log("Sat.one", "warning", "fsm", "about to land");
        assert_eq!(message.topic(), "LOG/WARNING/fsm");
        assert!(!message.is_notification());
        let decoded = CmdpMessage::disassemble(&message.assemble().unwrap()).unwrap();
        assert_eq!(decoded.payload().as_ref(), b"about to land");
    }

    #[test]
    fn stat_message_roundtrips() {
        let message = CmdpMessage::stat("Sat.one", "events", vec![0x2a]);
        assert_eq!(message.topic(), "STAT/EVENTS");
        let decoded = CmdpMessage::disassemble(&message.assemble().unwrap()).unwrap();
        assert_eq!(decoded.topic(), "STAT/EVENTS");
    }

    #[test]
    fn notification_roundtrips() {
        let mut topics = Dictionary::new();
        topics.insert("LOG/INFO/fsm", "FSM informational logs");
        topics.insert("STAT/EVENTS", "event counter");

        let message = CmdpNotification::message("Sat.one", &topics).unwrap();
        assert!(message.is_notification());

        let decoded = CmdpMessage::disassemble(&message.assemble().unwrap()).unwrap();
        let notification = CmdpNotification::from_message(&decoded).unwrap();
        assert_eq!(notification.topics(), &topics);
        assert_eq!(notification.header().sender(), "Sat.one");
    }

    #[test]
    fn non_notification_is_rejected() {
        let message = CmdpMessage::log("Sat.one", "info", "fsm", "x");
        assert!(CmdpNotification::from_message(&message).is_err());
    }

    #[test]
    fn invalid_topic_utf8_is_rejected() {
        let mut frames = Multipart::new();
        frames.push(vec![0xff, 0xfe]);
        frames.push(MessageHeader::new(Protocol::Cmdp1, "x").assemble().unwrap());
        frames.push(Vec::new());
        assert!(CmdpMessage::disassemble(&frames).is_err());
    }
}
