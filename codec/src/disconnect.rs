// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketType,
    Properties, PropertyType, ReasonCode,
};

/// The DISCONNECT packet is the final packet sent over a network
/// connection, from either the client or the server.
///
/// The Reason Code and the properties can be omitted: a Remaining Length
/// of 0 means Reason Code 0x00 (Normal disconnection).
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    reason_code: ReasonCode,
    properties: Properties,
}

/// The sender of a DISCONNECT packet MUST use one of these Reason Codes
/// [MQTT-3.14.2-1].
pub const DISCONNECT_REASONS: &[ReasonCode] = &[
    // Normal disconnection.
    ReasonCode::Success,
    ReasonCode::DisconnectWithWillMessage,
    ReasonCode::UnspecifiedError,
    ReasonCode::MalformedPacket,
    ReasonCode::ProtocolError,
    ReasonCode::ImplementationSpecificError,
    ReasonCode::NotAuthorized,
    ReasonCode::ServerBusy,
    ReasonCode::ServerShuttingDown,
    ReasonCode::KeepAliveTimeout,
    ReasonCode::SessionTakenOver,
    ReasonCode::TopicFilterInvalid,
    ReasonCode::TopicNameInvalid,
    ReasonCode::ReceiveMaximumExceeded,
    ReasonCode::TopicAliasInvalid,
    ReasonCode::PacketTooLarge,
    ReasonCode::MessageRateTooHigh,
    ReasonCode::QuotaExceeded,
    ReasonCode::AdministrativeAction,
    ReasonCode::PayloadFormatInvalid,
    ReasonCode::RetainNotSupported,
    ReasonCode::QoSNotSupported,
    ReasonCode::UseAnotherServer,
    ReasonCode::ServerMoved,
    ReasonCode::SharedSubscriptionsNotSupported,
    ReasonCode::ConnectionRateExceeded,
    ReasonCode::MaximumConnectTime,
    ReasonCode::SubscriptionIdentifiersNotSupported,
    ReasonCode::WildcardSubscriptionsNotSupported,
];

/// Properties available in disconnect packets.
pub const DISCONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
    PropertyType::ServerReference,
];

impl DisconnectPacket {
    /// Create a normal disconnect packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a disconnect packet with `reason_code`.
    #[must_use]
    pub fn with_reason(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::new(),
        }
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
        let mut remaining_length = 0;
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            remaining_length += ReasonCode::bytes();
        }
        if !self.properties.is_empty() {
            remaining_length += self.properties.bytes();
        }
        FixedHeader::new(PacketType::Disconnect, remaining_length)
    }
}

impl EncodePacket for DisconnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;
        if self.reason_code != ReasonCode::Success || !self.properties.is_empty() {
            self.reason_code.encode(buf)?;
        }
        if !self.properties.is_empty() {
            self.properties.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for DisconnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Disconnect {
            return Err(DecodeError::InvalidPacketType);
        }

        let reason_code = if fixed_header.remaining_length() >= ReasonCode::bytes() {
            ReasonCode::decode(ba)?
        } else {
            ReasonCode::default()
        };
        if !DISCONNECT_REASONS.contains(&reason_code) {
            log::error!("DisconnectPacket: invalid reason code {reason_code:?}");
            return Err(DecodeError::InvalidReasonCode);
        }

        let properties = if fixed_header.remaining_length() > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), DISCONNECT_PROPERTIES)
            {
                log::error!(
                    "DisconnectPacket: property type {property_type:?} cannot be used in properties!"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            properties
        } else {
            Properties::new()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_minimal_round_trip() {
        let mut buf = Vec::new();
        let packet = DisconnectPacket::new();
        assert_eq!(packet.encode(&mut buf), Ok(2));
        assert_eq!(&buf, &[0xe0, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(DisconnectPacket::decode(&mut ba), Ok(packet));
    }

    #[test]
    fn test_disconnect_with_reason_round_trip() {
        let mut buf = Vec::new();
        let packet = DisconnectPacket::with_reason(ReasonCode::ProtocolError);
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0xe0, 0x01, 0x82]);

        let mut ba = ByteArray::new(&buf);
        let decoded = DisconnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.reason_code(), ReasonCode::ProtocolError);
    }
}
