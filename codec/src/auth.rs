// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketType,
    Properties, PropertyType, ReasonCode,
};

/// The AUTH packet is sent from the client to the server or from the
/// server to the client as part of an extended authentication exchange.
///
/// It is a Protocol Error for either peer to send an AUTH packet when the
/// CONNECT packet did not contain an Authentication Method [MQTT-3.15.2-1].
/// The Reason Code and the properties can be omitted: a Remaining Length
/// of 0 means Reason Code 0x00 (Success).
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    reason_code: ReasonCode,
    properties: Properties,
}

/// The sender of an AUTH packet MUST use one of these Reason Codes
/// [MQTT-3.15.2-2].
pub const AUTH_REASONS: &[ReasonCode] = &[
    ReasonCode::Success,
    ReasonCode::ContinueAuthentication,
    ReasonCode::ReAuthenticate,
];

/// Properties available in auth packets.
pub const AUTH_PROPERTIES: &[PropertyType] = &[
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
    PropertyType::ReasonString,
    PropertyType::UserProperty,
];

impl AuthPacket {
    /// Create a new auth packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an auth packet with `reason_code`.
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
        FixedHeader::new(PacketType::Auth, remaining_length)
    }
}

impl EncodePacket for AuthPacket {
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

impl DecodePacket for AuthPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Auth {
            return Err(DecodeError::InvalidPacketType);
        }

        let reason_code = if fixed_header.remaining_length() >= ReasonCode::bytes() {
            ReasonCode::decode(ba)?
        } else {
            ReasonCode::default()
        };
        if !AUTH_REASONS.contains(&reason_code) {
            log::error!("AuthPacket: invalid reason code {reason_code:?}");
            return Err(DecodeError::InvalidReasonCode);
        }

        let properties = if fixed_header.remaining_length() > ReasonCode::bytes() {
            let properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(properties.props(), AUTH_PROPERTIES)
            {
                log::error!(
                    "AuthPacket: property type {property_type:?} cannot be used in properties!"
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
