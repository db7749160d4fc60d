//! Common types for mqttd.

use crate::error::{Error, Result};

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (PUBACK).
    AtLeastOnce = 1,
    /// Exactly once delivery (PUBREC/PUBREL/PUBCOMP).
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a QoS level, rejecting anything outside 0..=2.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::InvalidQoS(other)),
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Control packet type (high nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Type byte plus remaining-length bytes.
    pub header_length: usize,
}

/// CONNACK return code (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            _ => return None,
        })
    }
}

/// CONNECT flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectFlags {
    pub clean_session: bool,
    pub will: bool,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub password: bool,
    pub username: bool,
}

impl ConnectFlags {
    const CLEAN_SESSION: u8 = 0x02;
    const WILL: u8 = 0x04;
    const WILL_QOS_SHIFT: u8 = 3;
    const WILL_QOS_MASK: u8 = 0x18;
    const WILL_RETAIN: u8 = 0x20;
    const PASSWORD: u8 = 0x40;
    const USERNAME: u8 = 0x80;

    /// Decode the flags byte. The reserved bit must be zero and the will
    /// QoS/retain bits may only be set together with the will flag.
    pub fn decode(byte: u8) -> Result<Self> {
        if byte & 0x01 != 0 {
            return Err(Error::MalformedPacket("reserved connect flag set".into()));
        }

        let will = byte & Self::WILL != 0;
        let will_qos = QoS::from_u8((byte & Self::WILL_QOS_MASK) >> Self::WILL_QOS_SHIFT)?;
        let will_retain = byte & Self::WILL_RETAIN != 0;
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::MalformedPacket("will flags without will".into()));
        }

        Ok(Self {
            clean_session: byte & Self::CLEAN_SESSION != 0,
            will,
            will_qos,
            will_retain,
            password: byte & Self::PASSWORD != 0,
            username: byte & Self::USERNAME != 0,
        })
    }

    pub fn encode(&self) -> u8 {
        let mut byte = 0;
        if self.clean_session {
            byte |= Self::CLEAN_SESSION;
        }
        if self.will {
            byte |= Self::WILL;
            byte |= (self.will_qos as u8) << Self::WILL_QOS_SHIFT;
            if self.will_retain {
                byte |= Self::WILL_RETAIN;
            }
        }
        if self.password {
            byte |= Self::PASSWORD;
        }
        if self.username {
            byte |= Self::USERNAME;
        }
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_will_qos_bits() {
        for (qos, bits) in [
            (QoS::AtMostOnce, 0x00),
            (QoS::AtLeastOnce, 0x08),
            (QoS::ExactlyOnce, 0x10),
        ] {
            let flags = ConnectFlags { will: true, will_qos: qos, ..Default::default() };
            assert_eq!(flags.encode(), ConnectFlags::WILL | bits);
            assert_eq!(ConnectFlags::decode(flags.encode()).unwrap(), flags);
        }
    }

    #[test]
    fn test_connect_flags_reject_reserved_and_orphan_will_bits() {
        assert!(ConnectFlags::decode(0x01).is_err());
        assert!(ConnectFlags::decode(0x08).is_err());
        assert!(ConnectFlags::decode(0x20).is_err());
        assert!(matches!(ConnectFlags::decode(0x1C), Err(Error::InvalidQoS(3))));
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(QoS::from_u8(3), Err(Error::InvalidQoS(3))));
    }
}
