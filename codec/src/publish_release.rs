// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, Properties, PropertyType, ReasonCode,
};

/// The PUBREL packet is the response to a PUBREC packet.
///
/// It is the third packet of the `QoS` 2 protocol exchange. Bits 3..0 of
/// its fixed header are reserved and MUST be 0b0010 [MQTT-3.6.1-1].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReleasePacket {
    packet_id: PacketId,
    reason_code: ReasonCode,
    properties: Properties,
}

/// The sender of a PUBREL packet MUST use one of these Reason Codes
/// [MQTT-3.6.2-1].
pub const PUBLISH_RELEASE_REASONS: &[ReasonCode] =
    &[ReasonCode::Success, ReasonCode::PacketIdentifierNotFound];

/// Properties available in publish release packets.
pub const PUBLISH_RELEASE_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

impl PublishReleasePacket {
    /// Create a new publish release packet with `packet_id`.
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
        FixedHeader::new(PacketType::PublishRelease, remaining_length)
    }
}

impl EncodePacket for PublishReleasePacket {
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

impl DecodePacket for PublishReleasePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PublishRelease {
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
        if !PUBLISH_RELEASE_REASONS.contains(&reason_code) {
            log::error!("PublishReleasePacket: invalid reason code {reason_code:?}");
            return Err(DecodeError::InvalidReasonCode);
        }

        let properties = if remaining_length > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), PUBLISH_RELEASE_PROPERTIES)
            {
                log::error!(
                    "PublishReleasePacket: property type {property_type:?} cannot be used in properties!"
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
    fn test_publish_release_round_trip() {
        let mut buf = Vec::new();
        let packet = PublishReleasePacket::new(PacketId::new(9));
        assert_eq!(packet.encode(&mut buf), Ok(4));
        // Fixed header flags of PUBREL are 0b0010.
        assert_eq!(&buf, &[0x62, 0x02, 0x00, 0x09]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishReleasePacket::decode(&mut ba), Ok(packet));
    }

    #[test]
    fn test_publish_release_not_found() {
        let mut buf = Vec::new();
        let mut packet = PublishReleasePacket::new(PacketId::new(9));
        packet.set_reason_code(ReasonCode::PacketIdentifierNotFound);
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishReleasePacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.reason_code(), ReasonCode::PacketIdentifierNotFound);
    }
}
