// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, EncodeError};

/// Protocol name of all MQTT packets.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol version byte for MQTT 5.0.
pub const PROTOCOL_VERSION: u8 = 5;

/// Serialize a packet or a packet field into a byte buffer.
pub trait EncodePacket {
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be represented on the wire.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse a packet or a packet field from a byte cursor.
pub trait DecodePacket: Sized {
    /// # Errors
    ///
    /// Returns error if the bytes do not form a valid value.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Quality of service of an application message.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

impl DecodePacket for QoS {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        Self::try_from(byte)
    }
}

impl EncodePacket for QoS {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

/// Packet identifier used to correlate `QoS` 1/2 publishes and
/// subscribe/unsubscribe requests with their acknowledgements.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PacketId(u16);

impl PacketId {
    /// Create a new packet id object.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get inner u16 value.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PacketId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactOnce));
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }

    #[test]
    fn test_packet_id_round_trip() {
        let mut buf = Vec::new();
        let packet_id = PacketId::new(0x1f2e);
        assert_eq!(packet_id.encode(&mut buf), Ok(2));
        assert_eq!(&buf, &[0x1f, 0x2e]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba), Ok(packet_id));
    }
}
