//! CHP heartbeat message codec.
//!
//! A beat is a single frame of concatenated MessagePack objects: protocol
//! tag, sender name, send time, lifecycle state and the advertised interval
//! in milliseconds. Receivers use the interval to derive the liveness
//! deadline for the sender.

use std::io::Cursor;
use std::time::Duration;

use crate::error::DecodeError;
use crate::state::State;
use crate::value::{expect_consumed, mp_str, mp_timestamp, mp_u64, read_mp, write_mp, Timestamp};

pub const CHP1_PROTOCOL: &str = "CHP1";

/// Topic frame under which beats are published.
pub const HEARTBEAT_TOPIC: &str = "HEARTBEAT";

#[derive(Debug, Clone, PartialEq)]
pub struct ChpMessage {
    pub sender: String,
    pub time: Timestamp,
    pub state: State,
    pub interval: Duration,
}

impl ChpMessage {
    pub fn new(sender: impl Into<String>, state: State, interval: Duration) -> Self {
        ChpMessage {
            sender: sender.into(),
            time: Timestamp::now(),
            state,
            interval,
        }
    }

    pub fn assemble(&self) -> Vec<u8> {
        let interval_ms = u32::try_from(self.interval.as_millis()).unwrap_or(u32::MAX);

        let mut buf = Vec::new();
        write_mp(&mut buf, &rmpv::Value::from(CHP1_PROTOCOL));
        write_mp(&mut buf, &rmpv::Value::from(self.sender.as_str()));
        write_mp(&mut buf, &crate::value::Value::TimePoint(self.time).to_mp());
        write_mp(&mut buf, &rmpv::Value::from(self.state as u8));
        write_mp(&mut buf, &rmpv::Value::from(interval_ms));
        buf
    }

    pub fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);

        let protocol = mp_str(read_mp(&mut cursor)?, "protocol")?;
        if protocol != CHP1_PROTOCOL {
            return Err(DecodeError::Protocol {
                expected: CHP1_PROTOCOL,
            });
        }

        let sender = mp_str(read_mp(&mut cursor)?, "sender")?;
        let time = mp_timestamp(read_mp(&mut cursor)?, "time")?;

        let state_raw = mp_u64(read_mp(&mut cursor)?, "state")?;
        let state = State::try_from(u8::try_from(state_raw).map_err(|_| DecodeError::Field {
            field: "state",
            value: state_raw,
        })?)?;

        let interval_ms = mp_u64(read_mp(&mut cursor)?, "interval")?;
        let interval_ms = u32::try_from(interval_ms).map_err(|_| DecodeError::Field {
            field: "interval",
            value: interval_ms,
        })?;

        expect_consumed(&cursor)?;

        Ok(ChpMessage {
            sender,
            time,
            state,
            interval: Duration::from_millis(u64::from(interval_ms)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = ChpMessage::new("Demo.sat1", State::Orbit, Duration::from_millis(1500));
        let decoded = ChpMessage::disassemble(&msg.assemble()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn wrong_protocol_rejected() {
        let mut buf = Vec::new();
        write_mp(&mut buf, &rmpv::Value::from("CMDP1"));
        assert!(matches!(
            ChpMessage::disassemble(&buf),
            Err(DecodeError::Protocol { .. })
        ));
    }

    #[test]
    fn truncated_rejected() {
        let msg = ChpMessage::new("a", State::New, Duration::from_secs(1));
        let bytes = msg.assemble();
        assert!(ChpMessage::disassemble(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn state_is_carried_as_u8() {
        let msg = ChpMessage::new("a", State::Error, Duration::from_secs(1));
        let decoded = ChpMessage::disassemble(&msg.assemble()).unwrap();
        assert_eq!(decoded.state, State::Error);
    }
}
