//! CSCP request/reply message envelope.
//!
//! A message is two or three frames: a header (protocol tag, sender, send
//! time, free-form tag dictionary), a verb (type byte plus string) and an
//! optional opaque payload, typically a packed [`Dictionary`] or
//! [`crate::value::Value`].

use std::fmt;
use std::io::Cursor;

use crate::dict::Dictionary;
use crate::error::DecodeError;
use crate::value::{expect_consumed, mp_str, mp_timestamp, mp_u64, read_mp, write_mp, Timestamp};

pub const CSCP1_PROTOCOL: &str = "CSCP1";

/// Message type carried in the verb frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CscpType {
    /// A command sent to a satellite.
    Request = 0,
    /// Command accepted and being executed.
    Success = 1,
    /// Command valid but not implemented by this satellite.
    NotImplemented = 2,
    /// Mandatory payload missing or malformed.
    Incomplete = 3,
    /// Command not valid in the current state.
    Invalid = 4,
    /// Command entirely unknown.
    Unknown = 5,
    /// Internal or transport failure while handling the command.
    Error = 6,
}

impl fmt::Display for CscpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CscpType::Request => "REQUEST",
            CscpType::Success => "SUCCESS",
            CscpType::NotImplemented => "NOTIMPLEMENTED",
            CscpType::Incomplete => "INCOMPLETE",
            CscpType::Invalid => "INVALID",
            CscpType::Unknown => "UNKNOWN",
            CscpType::Error => "ERROR",
        })
    }
}

impl TryFrom<u8> for CscpType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => CscpType::Request,
            1 => CscpType::Success,
            2 => CscpType::NotImplemented,
            3 => CscpType::Incomplete,
            4 => CscpType::Invalid,
            5 => CscpType::Unknown,
            6 => CscpType::Error,
            other => {
                return Err(DecodeError::Field {
                    field: "message type",
                    value: u64::from(other),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CscpHeader {
    pub sender: String,
    pub time: Timestamp,
    pub tags: Dictionary,
}

impl CscpHeader {
    pub fn new(sender: impl Into<String>) -> Self {
        CscpHeader {
            sender: sender.into(),
            time: Timestamp::now(),
            tags: Dictionary::new(),
        }
    }

    fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_mp(&mut buf, &rmpv::Value::from(CSCP1_PROTOCOL));
        write_mp(&mut buf, &rmpv::Value::from(self.sender.as_str()));
        write_mp(&mut buf, &crate::value::Value::TimePoint(self.time).to_mp());
        write_mp(&mut buf, &self.tags.to_mp());
        buf
    }

    fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);

        let protocol = mp_str(read_mp(&mut cursor)?, "protocol")?;
        if protocol != CSCP1_PROTOCOL {
            return Err(DecodeError::Protocol {
                expected: CSCP1_PROTOCOL,
            });
        }

        let sender = mp_str(read_mp(&mut cursor)?, "sender")?;
        let time = mp_timestamp(read_mp(&mut cursor)?, "time")?;
        let tags = Dictionary::from_mp(read_mp(&mut cursor)?)?;
        expect_consumed(&cursor)?;

        Ok(CscpHeader { sender, time, tags })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CscpMessage {
    pub header: CscpHeader,
    pub verb: (CscpType, String),
    pub payload: Option<Vec<u8>>,
}

impl CscpMessage {
    pub fn new(sender: impl Into<String>, verb_type: CscpType, verb: impl Into<String>) -> Self {
        CscpMessage {
            header: CscpHeader::new(sender),
            verb: (verb_type, verb.into()),
            payload: None,
        }
    }

    /// Build a command request.
    pub fn request(sender: impl Into<String>, command: impl Into<String>) -> Self {
        CscpMessage::new(sender, CscpType::Request, command)
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = if payload.is_empty() {
            None
        } else {
            Some(payload)
        };
        self
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Frames for the transport: header, verb and, if present, payload.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let mut verb_frame = Vec::new();
        write_mp(&mut verb_frame, &rmpv::Value::from(self.verb.0 as u8));
        write_mp(&mut verb_frame, &rmpv::Value::from(self.verb.1.as_str()));

        let mut frames = vec![self.header.assemble(), verb_frame];
        if let Some(payload) = &self.payload {
            frames.push(payload.clone());
        }
        frames
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self, DecodeError> {
        if frames.len() < 2 || frames.len() > 3 {
            return Err(DecodeError::Length {
                expected: 2,
                got: frames.len(),
            });
        }

        let header = CscpHeader::disassemble(&frames[0])?;

        let mut cursor = Cursor::new(frames[1].as_slice());
        let type_raw = mp_u64(read_mp(&mut cursor)?, "message type")?;
        let verb_type =
            CscpType::try_from(u8::try_from(type_raw).map_err(|_| DecodeError::Field {
                field: "message type",
                value: type_raw,
            })?)?;
        let verb = mp_str(read_mp(&mut cursor)?, "verb")?;
        expect_consumed(&cursor)?;

        let payload = frames.get(2).filter(|p| !p.is_empty()).cloned();

        Ok(CscpMessage {
            header,
            verb: (verb_type, verb),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn request_round_trip() {
        let msg = CscpMessage::request("ctrl.mission", "get_state");
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 2);
        let decoded = CscpMessage::from_frames(&frames).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn payload_round_trip() {
        let mut dict = Dictionary::new();
        dict.insert("rate", 10i64);
        let msg = CscpMessage::request("ctrl", "initialize").with_payload(dict.assemble());
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 3);

        let decoded = CscpMessage::from_frames(&frames).unwrap();
        assert!(decoded.has_payload());
        let payload = Dictionary::disassemble(decoded.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload, dict);
    }

    #[test]
    fn reply_types_round_trip() {
        for ty in [
            CscpType::Success,
            CscpType::NotImplemented,
            CscpType::Incomplete,
            CscpType::Invalid,
            CscpType::Unknown,
            CscpType::Error,
        ] {
            let msg = CscpMessage::new("sat", ty, "detail");
            let decoded = CscpMessage::from_frames(&msg.to_frames()).unwrap();
            assert_eq!(decoded.verb.0, ty);
        }
    }

    #[test]
    fn header_tags_survive() {
        let mut msg = CscpMessage::request("ctrl", "get_name");
        msg.header.tags.insert("trace", Value::from("abc123"));
        let decoded = CscpMessage::from_frames(&msg.to_frames()).unwrap();
        assert_eq!(
            decoded.header.tags.get("trace").unwrap().as_str().unwrap(),
            "abc123"
        );
    }

    #[test]
    fn frame_count_enforced() {
        let msg = CscpMessage::request("ctrl", "get_name");
        let frames = msg.to_frames();
        assert!(CscpMessage::from_frames(&frames[..1]).is_err());

        let mut too_many = frames.clone();
        too_many.push(Vec::new());
        too_many.push(Vec::new());
        assert!(CscpMessage::from_frames(&too_many).is_err());
    }

    #[test]
    fn garbage_header_rejected() {
        let frames = vec![vec![0xc1], vec![0xc1]];
        assert!(CscpMessage::from_frames(&frames).is_err());
    }
}
