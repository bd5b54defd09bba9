//! CHIRP datagram codec: the fixed 42-byte discovery broadcast.

use std::fmt;

use crate::error::DecodeError;
use crate::hash::Md5Hash;

/// UDP port all CHIRP traffic uses.
pub const CHIRP_PORT: u16 = 7123;

/// Protocol identifier at the start of every datagram; the version byte
/// follows directly, making the 6-byte prefix `CHIRP\x01` on the wire.
pub const CHIRP_IDENTIFIER: [u8; 5] = *b"CHIRP";

pub const CHIRP_VERSION: u8 = 1;

/// Total datagram size. Receivers truncate longer datagrams to this before
/// decoding; shorter ones are malformed.
pub const CHIRP_MESSAGE_LENGTH: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChirpMessageType {
    /// Ask peers to re-send OFFERs for a service.
    Request = 1,
    /// Advertise a registered service.
    Offer = 2,
    /// Withdraw a previously offered service.
    Depart = 3,
}

impl fmt::Display for ChirpMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChirpMessageType::Request => "REQUEST",
            ChirpMessageType::Offer => "OFFER",
            ChirpMessageType::Depart => "DEPART",
        })
    }
}

impl TryFrom<u8> for ChirpMessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(ChirpMessageType::Request),
            2 => Ok(ChirpMessageType::Offer),
            3 => Ok(ChirpMessageType::Depart),
            other => Err(DecodeError::Field {
                field: "message type",
                value: u64::from(other),
            }),
        }
    }
}

/// The four service classes a satellite can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServiceIdentifier {
    Control = 1,
    Heartbeat = 2,
    Monitoring = 3,
    Data = 4,
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceIdentifier::Control => "CONTROL",
            ServiceIdentifier::Heartbeat => "HEARTBEAT",
            ServiceIdentifier::Monitoring => "MONITORING",
            ServiceIdentifier::Data => "DATA",
        })
    }
}

impl TryFrom<u8> for ServiceIdentifier {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(ServiceIdentifier::Control),
            2 => Ok(ServiceIdentifier::Heartbeat),
            3 => Ok(ServiceIdentifier::Monitoring),
            4 => Ok(ServiceIdentifier::Data),
            other => Err(DecodeError::Field {
                field: "service identifier",
                value: u64::from(other),
            }),
        }
    }
}

/// One CHIRP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChirpMessage {
    pub msg_type: ChirpMessageType,
    pub group_id: Md5Hash,
    pub host_id: Md5Hash,
    pub service: ServiceIdentifier,
    pub port: u16,
}

impl ChirpMessage {
    pub fn new(
        msg_type: ChirpMessageType,
        group_id: Md5Hash,
        host_id: Md5Hash,
        service: ServiceIdentifier,
        port: u16,
    ) -> Self {
        ChirpMessage {
            msg_type,
            group_id,
            host_id,
            service,
            port,
        }
    }

    /// Layout: identifier (5), version (1), type (1), group id (16),
    /// host id (16), service id (1), port big-endian (2).
    pub fn assemble(&self) -> [u8; CHIRP_MESSAGE_LENGTH] {
        let mut buf = [0u8; CHIRP_MESSAGE_LENGTH];
        buf[0..5].copy_from_slice(&CHIRP_IDENTIFIER);
        buf[5] = CHIRP_VERSION;
        buf[6] = self.msg_type as u8;
        buf[7..23].copy_from_slice(self.group_id.as_bytes());
        buf[23..39].copy_from_slice(self.host_id.as_bytes());
        buf[39] = self.service as u8;
        buf[40..42].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    pub fn disassemble(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CHIRP_MESSAGE_LENGTH {
            return Err(DecodeError::Length {
                expected: CHIRP_MESSAGE_LENGTH,
                got: bytes.len(),
            });
        }
        if bytes[0..5] != CHIRP_IDENTIFIER {
            return Err(DecodeError::Protocol { expected: "CHIRP" });
        }
        if bytes[5] != CHIRP_VERSION {
            return Err(DecodeError::Version(bytes[5]));
        }
        let msg_type = ChirpMessageType::try_from(bytes[6])?;

        let mut group = [0u8; 16];
        group.copy_from_slice(&bytes[7..23]);
        let mut host = [0u8; 16];
        host.copy_from_slice(&bytes[23..39]);

        let service = ServiceIdentifier::try_from(bytes[39])?;
        let port = u16::from_be_bytes([bytes[40], bytes[41]]);

        Ok(ChirpMessage {
            msg_type,
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
        ChirpMessage::new(
            ChirpMessageType::Offer,
            Md5Hash::new("edda"),
            Md5Hash::new("sat1"),
            ServiceIdentifier::Control,
            47890,
        )
    }

    #[test]
    fn round_trip() {
        let msg = sample();
        let wire = msg.assemble();
        assert_eq!(wire.len(), CHIRP_MESSAGE_LENGTH);
        assert_eq!(ChirpMessage::disassemble(&wire).unwrap(), msg);
    }

    #[test]
    fn layout_is_fixed() {
        let msg = sample();
        let wire = msg.assemble();
        assert_eq!(&wire[0..5], b"CHIRP");
        assert_eq!(wire[5], 1);
        assert_eq!(wire[6], ChirpMessageType::Offer as u8);
        assert_eq!(&wire[7..23], Md5Hash::new("edda").as_bytes());
        assert_eq!(&wire[23..39], Md5Hash::new("sat1").as_bytes());
        assert_eq!(wire[39], ServiceIdentifier::Control as u8);
        assert_eq!(u16::from_be_bytes([wire[40], wire[41]]), 47890);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut wire = sample().assemble();
        wire[0] = b'X';
        assert!(matches!(
            ChirpMessage::disassemble(&wire),
            Err(DecodeError::Protocol { .. })
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut wire = sample().assemble();
        wire[5] = 2;
        assert!(matches!(
            ChirpMessage::disassemble(&wire),
            Err(DecodeError::Version(2))
        ));
    }

    #[test]
    fn bad_type_and_service_rejected() {
        let mut wire = sample().assemble();
        wire[6] = 9;
        assert!(ChirpMessage::disassemble(&wire).is_err());

        let mut wire = sample().assemble();
        wire[39] = 0;
        assert!(ChirpMessage::disassemble(&wire).is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(ChirpMessage::disassemble(&[0u8; 10]).is_err());
        assert!(ChirpMessage::disassemble(&[0u8; 43]).is_err());
    }
}
