// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, Properties, PropertyType, ReasonCode,
};

/// Acknowledge packet for a publish message with `QoS` 1.
///
/// Basic packet structure:
/// ```txt
///  7                  0
/// +--------------------+
/// | Fixed header       |
/// |                    |
/// +--------------------+
/// | Packet id          |
/// |                    |
/// +--------------------+
/// | Reason Code        |
/// +--------------------+
/// | Properties ...     |
/// +--------------------+
/// ```
///
/// The Reason Code and Property Length can be omitted if the Reason Code
/// is 0x00 (Success) and there are no Properties. In that case the packet
/// has a Remaining Length of 2.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishAckPacket {
    packet_id: PacketId,
    reason_code: ReasonCode,
    properties: Properties,
}

/// The sender of a PUBACK packet MUST use one of these Reason Codes
/// [MQTT-3.4.2-1].
pub const PUBLISH_ACK_REASONS: &[ReasonCode] = &[
    ReasonCode::Success,
    ReasonCode::NoMatchingSubscribers,
    ReasonCode::UnspecifiedError,
    ReasonCode::ImplementationSpecificError,
    ReasonCode::NotAuthorized,
    ReasonCode::TopicNameInvalid,
    ReasonCode::PacketIdentifierInUse,
    ReasonCode::QuotaExceeded,
    ReasonCode::PayloadFormatInvalid,
];

/// Properties available in publish ack packets.
pub const PUBLISH_ACK_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

impl PublishAckPacket {
    /// Create a new publish ack packet with `packet_id`.
    #[must_use]
    pub fn new(packet_id: PacketId) -> Self {
        Self {
            packet_id,
            ..Self::default()
        }
    }

    /// Update packet id.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    /// Get current packet id.
    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Update reason code.
    pub fn set_reason_code(&mut self, reason_code: ReasonCode) -> &mut Self {
        self.reason_code = reason_code;
        self
    }

    /// Get current reason code.
    #[must_use]
    pub const fn reason_code(&self) -> ReasonCode {
        self.reason_code
    }

    /// Get a reference to property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Get a mutable reference to property list.
    pub fn mut_properties(&mut self) -> &mut Properties {
        &mut self.properties
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, EncodeError> {
        let mut remaining_length = PacketId::bytes();
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            remaining_length += ReasonCode::bytes();
        }
        if !self.properties.is_empty() {
            remaining_length += self.properties.bytes();
        }
        FixedHeader::new(PacketType::PublishAck, remaining_length)
    }
}

impl EncodePacket for PublishAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            self.reason_code.encode(buf)?;
        }
        if !self.properties.is_empty() {
            self.properties.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for PublishAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() < PacketId::bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let packet_id = PacketId::decode(ba)?;

        let remaining_length = fixed_header.remaining_length() - PacketId::bytes();
        let reason_code = if remaining_length >= ReasonCode::bytes() {
            ReasonCode::decode(ba)?
        } else {
            ReasonCode::default()
        };
        if !PUBLISH_ACK_REASONS.contains(&reason_code) {
            log::error!("PublishAckPacket: invalid reason code {reason_code:?}");
            return Err(DecodeError::InvalidReasonCode);
        }

        let properties = if remaining_length > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), PUBLISH_ACK_PROPERTIES)
            {
                log::error!(
                    "PublishAckPacket: property type {property_type:?} cannot be used in properties!"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            properties
        } else {
            Properties::new()
        };

        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_ack_minimal_round_trip() {
        let mut buf = Vec::new();
        let packet = PublishAckPacket::new(PacketId::new(17));
        assert_eq!(packet.encode(&mut buf), Ok(4));
        assert_eq!(&buf, &[0x40, 0x02, 0x00, 0x11]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishAckPacket::decode(&mut ba), Ok(packet));
    }

    #[test]
    fn test_publish_ack_with_reason_code() {
        let mut buf = Vec::new();
        let mut packet = PublishAckPacket::new(PacketId::new(3));
        packet.set_reason_code(ReasonCode::NoMatchingSubscribers);
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x40, 0x03, 0x00, 0x03, 0x10]);

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishAckPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.reason_code(), ReasonCode::NoMatchingSubscribers);
    }

    #[test]
    fn test_publish_ack_rejects_foreign_reason_code() {
        // KeepAliveTimeout is a DISCONNECT only reason code.
        let buf = [0x40, 0x03, 0x00, 0x03, 0x8d];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishAckPacket::decode(&mut ba),
            Err(DecodeError::InvalidReasonCode)
        );
    }
}
