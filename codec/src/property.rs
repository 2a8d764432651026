// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::utils::StringError;
use crate::{
    BinaryData, BoolData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket,
    PubTopic, QoS, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Property types which may appear more than once in a property list.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Check that every property in `properties` is listed in `types` and that
/// non-repeatable properties appear at most once.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 && !MULTIPLE_PROPERTIES.contains(property_type) {
            return Err(*property_type);
        }
    }

    Ok(())
}

/// Property identifier byte, as assigned in the MQTT 5.0 specification §2.2.2.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// One property in a property list, the identifier and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Whether the payload is unspecified bytes (0) or UTF-8 data (1).
    ///
    /// Used in PUBLISH, Will Properties.
    PayloadFormatIndicator(BoolData),

    /// Lifetime of the message in seconds.
    ///
    /// Used in PUBLISH, Will Properties. If absent, the message does not expire.
    MessageExpiryInterval(U32Data),

    /// Content type of the payload, defined by the applications.
    ///
    /// Used in PUBLISH, Will Properties.
    ContentType(StringData),

    /// Topic Name for a response message in a request/response exchange.
    ///
    /// Used in PUBLISH, Will Properties.
    ResponseTopic(PubTopic),

    /// Correlation data used by the requester to match a response to its
    /// request.
    ///
    /// Used in PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Identifier of a matching subscription, 1 to 268,435,455.
    ///
    /// Used in PUBLISH, SUBSCRIBE. A value of 0 is a Protocol Error.
    /// May appear multiple times in a PUBLISH when several overlapping
    /// subscriptions matched.
    SubscriptionIdentifier(VarInt),

    /// Session Expiry Interval in seconds.
    ///
    /// Used in CONNECT, CONNACK, DISCONNECT. 0 or absent means the session
    /// ends when the network connection closes; 0xFFFF_FFFF means the
    /// session does not expire.
    SessionExpiryInterval(U32Data),

    /// Client Identifier assigned by the server because a zero length
    /// Client Identifier was present in the CONNECT packet.
    ///
    /// Used in CONNACK.
    AssignedClientIdentifier(StringData),

    /// Keep Alive value assigned by the server, overriding the value
    /// requested in CONNECT.
    ///
    /// Used in CONNACK.
    ServerKeepAlive(U16Data),

    /// Name of the authentication method used for extended authentication.
    ///
    /// Used in CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary data containing authentication data.
    ///
    /// Used in CONNECT, CONNACK, AUTH.
    AuthenticationData(BinaryData),

    /// Whether the server may send Reason String or User Properties on
    /// failures (1) or not (0).
    ///
    /// Used in CONNECT.
    RequestProblemInformation(BoolData),

    /// Delay in seconds before the server publishes the will message.
    ///
    /// Used in Will Properties.
    WillDelayInterval(U32Data),

    /// Whether the server should return Response Information in CONNACK.
    ///
    /// Used in CONNECT.
    RequestResponseInformation(BoolData),

    /// Basis for creating a response topic.
    ///
    /// Used in CONNACK.
    ResponseInformation(StringData),

    /// Another server the client can use.
    ///
    /// Used in CONNACK, DISCONNECT.
    ServerReference(StringData),

    /// Human readable diagnostic string, not parsed by the receiver.
    ///
    /// Used in CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK,
    /// DISCONNECT, AUTH.
    ReasonString(StringData),

    /// Maximum number of `QoS` 1 and `QoS` 2 publications the sender is
    /// willing to process concurrently. There is no mechanism to limit the
    /// `QoS` 0 publications.
    ///
    /// Used in CONNECT, CONNACK. A value of 0 is a Protocol Error.
    ReceiveMaximum(U16Data),

    /// Highest Topic Alias value the sender accepts from its peer.
    /// 0 or absent means topic aliases are not accepted at all.
    ///
    /// Used in CONNECT, CONNACK.
    TopicAliasMaximum(U16Data),

    /// Integer standing in for the topic name, to reduce packet size.
    ///
    /// Used in PUBLISH. A value of 0 is a Protocol Error.
    TopicAlias(U16Data),

    /// Maximum `QoS` the server supports. Only 0 or 1 may be sent.
    ///
    /// Used in CONNACK.
    MaximumQoS(QoS),

    /// Whether the server supports retained messages.
    ///
    /// Used in CONNACK.
    RetainAvailable(BoolData),

    /// Name-value pair provided by the applications; may appear multiple
    /// times, and the order of pairs of the same name is preserved.
    ///
    /// Used in every packet type and in Will Properties.
    UserProperty(StringPairData),

    /// Maximum packet size in bytes the sender accepts.
    /// A value of 0 is a Protocol Error.
    ///
    /// Used in CONNECT, CONNACK.
    MaximumPacketSize(U32Data),

    /// Whether the server supports wildcard subscriptions.
    ///
    /// Used in CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Whether the server supports subscription identifiers.
    ///
    /// Used in CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Whether the server supports shared subscriptions.
    ///
    /// Used in CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    /// Get property type of current property.
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length of the value part, without the identifier byte.
    #[must_use]
    pub fn value_bytes(&self) -> usize {
        match self {
            Self::PayloadFormatIndicator(_)
            | Self::RequestProblemInformation(_)
            | Self::RequestResponseInformation(_)
            | Self::RetainAvailable(_)
            | Self::WildcardSubscriptionAvailable(_)
            | Self::SubscriptionIdentifierAvailable(_)
            | Self::SharedSubscriptionAvailable(_) => BoolData::bytes(),
            Self::MaximumQoS(_) => QoS::bytes(),
            Self::ServerKeepAlive(_)
            | Self::ReceiveMaximum(_)
            | Self::TopicAliasMaximum(_)
            | Self::TopicAlias(_) => U16Data::bytes(),
            Self::MessageExpiryInterval(_)
            | Self::SessionExpiryInterval(_)
            | Self::WillDelayInterval(_)
            | Self::MaximumPacketSize(_) => U32Data::bytes(),
            Self::SubscriptionIdentifier(v) => v.bytes(),
            Self::ContentType(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.bytes(),
            Self::ResponseTopic(v) => v.bytes(),
            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.bytes(),
            Self::UserProperty(v) => v.bytes(),
        }
    }

    /// Get byte length in packet, including the identifier byte.
    #[must_use]
    pub fn bytes(&self) -> usize {
        PropertyType::bytes() + self.value_bytes()
    }
}

impl DecodePacket for Property {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                Ok(Self::PayloadFormatIndicator(BoolData::decode(ba)?))
            }
            PropertyType::MessageExpiryInterval => {
                Ok(Self::MessageExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::ContentType => Ok(Self::ContentType(StringData::decode(ba)?)),
            PropertyType::ResponseTopic => Ok(Self::ResponseTopic(PubTopic::decode(ba)?)),
            PropertyType::CorrelationData => Ok(Self::CorrelationData(BinaryData::decode(ba)?)),
            PropertyType::SubscriptionIdentifier => {
                let id = VarInt::decode(ba)?;
                // The Subscription Identifier can have the value of 1 to
                // 268,435,455. A value of 0 is a Protocol Error.
                if id.is_empty() {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(id))
            }
            PropertyType::SessionExpiryInterval => {
                Ok(Self::SessionExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::AssignedClientIdentifier => {
                Ok(Self::AssignedClientIdentifier(StringData::decode(ba)?))
            }
            PropertyType::ServerKeepAlive => Ok(Self::ServerKeepAlive(U16Data::decode(ba)?)),
            PropertyType::AuthenticationMethod => {
                Ok(Self::AuthenticationMethod(StringData::decode(ba)?))
            }
            PropertyType::AuthenticationData => {
                Ok(Self::AuthenticationData(BinaryData::decode(ba)?))
            }
            PropertyType::RequestProblemInformation => {
                Ok(Self::RequestProblemInformation(BoolData::decode(ba)?))
            }
            PropertyType::WillDelayInterval => Ok(Self::WillDelayInterval(U32Data::decode(ba)?)),
            PropertyType::RequestResponseInformation => {
                Ok(Self::RequestResponseInformation(BoolData::decode(ba)?))
            }
            PropertyType::ResponseInformation => {
                Ok(Self::ResponseInformation(StringData::decode(ba)?))
            }
            PropertyType::ServerReference => Ok(Self::ServerReference(StringData::decode(ba)?)),
            PropertyType::ReasonString => Ok(Self::ReasonString(StringData::decode(ba)?)),
            PropertyType::ReceiveMaximum => {
                let value = U16Data::decode(ba)?;
                // It is a Protocol Error to include the Receive Maximum
                // value set to 0.
                if value.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(value))
            }
            PropertyType::TopicAliasMaximum => Ok(Self::TopicAliasMaximum(U16Data::decode(ba)?)),
            PropertyType::TopicAlias => {
                let value = U16Data::decode(ba)?;
                // A Topic Alias of 0 is not permitted.
                if value.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::TopicAlias(value))
            }
            PropertyType::MaximumQoS => {
                let qos = QoS::decode(ba)?;
                // A value of 2 must not be sent.
                if qos == QoS::ExactOnce {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(qos))
            }
            PropertyType::RetainAvailable => Ok(Self::RetainAvailable(BoolData::decode(ba)?)),
            PropertyType::UserProperty => Ok(Self::UserProperty(StringPairData::decode(ba)?)),
            PropertyType::MaximumPacketSize => {
                let value = U32Data::decode(ba)?;
                // It is a Protocol Error to include the Maximum Packet Size
                // value set to 0.
                if value.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(value))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                Ok(Self::WildcardSubscriptionAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SubscriptionIdentifierAvailable => {
                Ok(Self::SubscriptionIdentifierAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SharedSubscriptionAvailable => {
                Ok(Self::SharedSubscriptionAvailable(BoolData::decode(ba)?))
            }
        }
    }
}

impl EncodePacket for Property {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(v)
            | Self::RequestProblemInformation(v)
            | Self::RequestResponseInformation(v)
            | Self::RetainAvailable(v)
            | Self::WildcardSubscriptionAvailable(v)
            | Self::SubscriptionIdentifierAvailable(v)
            | Self::SharedSubscriptionAvailable(v) => v.encode(buf)?,
            Self::MaximumQoS(v) => v.encode(buf)?,
            Self::ServerKeepAlive(v)
            | Self::ReceiveMaximum(v)
            | Self::TopicAliasMaximum(v)
            | Self::TopicAlias(v) => v.encode(buf)?,
            Self::MessageExpiryInterval(v)
            | Self::SessionExpiryInterval(v)
            | Self::WillDelayInterval(v)
            | Self::MaximumPacketSize(v) => v.encode(buf)?,
            Self::SubscriptionIdentifier(v) => v.encode(buf)?,
            Self::ContentType(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.encode(buf)?,
            Self::ResponseTopic(v) => v.encode(buf)?,
            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.encode(buf)?,
            Self::UserProperty(v) => v.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// A property list: a Variable Byte Integer length followed by
/// identifier/value pairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Get a reference to inner property list.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.0
    }

    /// Returns true if no property is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get number of properties set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Append `property` to the list.
    pub fn push(&mut self, property: Property) -> &mut Self {
        self.0.push(property);
        self
    }

    /// Replace the property of the same type, or append it.
    ///
    /// Repeatable properties are always appended.
    pub fn set(&mut self, property: Property) -> &mut Self {
        let property_type = property.property_type();
        if !MULTIPLE_PROPERTIES.contains(&property_type) {
            if let Some(old) = self
                .0
                .iter_mut()
                .find(|p| p.property_type() == property_type)
            {
                *old = property;
                return self;
            }
        }
        self.0.push(property);
        self
    }

    /// Remove all properties.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Get byte length of the property values, without the length prefix.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.0.iter().map(Property::bytes).sum()
    }

    /// Get byte length in packet, including the length prefix.
    ///
    /// The result is only meaningful while the payload fits a Variable Byte
    /// Integer; [`Self::encode`] reports the overflow.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let payload_bytes = self.payload_bytes();
        let len = VarInt::from(payload_bytes).unwrap_or_default();
        len.bytes() + payload_bytes
    }

    fn find(&self, property_type: PropertyType) -> Option<&Property> {
        self.0.iter().find(|p| p.property_type() == property_type)
    }

    /// Get Payload Format Indicator property value.
    #[must_use]
    pub fn payload_format_indicator(&self) -> Option<bool> {
        match self.find(PropertyType::PayloadFormatIndicator) {
            Some(Property::PayloadFormatIndicator(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Message Expiry Interval property value.
    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        match self.find(PropertyType::MessageExpiryInterval) {
            Some(Property::MessageExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Content Type property value.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match self.find(PropertyType::ContentType) {
            Some(Property::ContentType(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Response Topic property value.
    #[must_use]
    pub fn response_topic(&self) -> Option<&str> {
        match self.find(PropertyType::ResponseTopic) {
            Some(Property::ResponseTopic(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Correlation Data property value.
    #[must_use]
    pub fn correlation_data(&self) -> Option<&[u8]> {
        match self.find(PropertyType::CorrelationData) {
            Some(Property::CorrelationData(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Get all Subscription Identifier property values, in order.
    #[must_use]
    pub fn subscription_identifiers(&self) -> Vec<usize> {
        self.0
            .iter()
            .filter_map(|p| match p {
                Property::SubscriptionIdentifier(v) => Some(v.value()),
                _ => None,
            })
            .collect()
    }

    /// Get Session Expiry Interval property value.
    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.find(PropertyType::SessionExpiryInterval) {
            Some(Property::SessionExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Assigned Client Identifier property value.
    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        match self.find(PropertyType::AssignedClientIdentifier) {
            Some(Property::AssignedClientIdentifier(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Server Keep Alive property value.
    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        match self.find(PropertyType::ServerKeepAlive) {
            Some(Property::ServerKeepAlive(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Authentication Method property value.
    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        match self.find(PropertyType::AuthenticationMethod) {
            Some(Property::AuthenticationMethod(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Authentication Data property value.
    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        match self.find(PropertyType::AuthenticationData) {
            Some(Property::AuthenticationData(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Get Will Delay Interval property value.
    #[must_use]
    pub fn will_delay_interval(&self) -> Option<u32> {
        match self.find(PropertyType::WillDelayInterval) {
            Some(Property::WillDelayInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Response Information property value.
    #[must_use]
    pub fn response_information(&self) -> Option<&str> {
        match self.find(PropertyType::ResponseInformation) {
            Some(Property::ResponseInformation(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Server Reference property value.
    #[must_use]
    pub fn server_reference(&self) -> Option<&str> {
        match self.find(PropertyType::ServerReference) {
            Some(Property::ServerReference(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Reason String property value.
    #[must_use]
    pub fn reason_string(&self) -> Option<&str> {
        match self.find(PropertyType::ReasonString) {
            Some(Property::ReasonString(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Get Receive Maximum property value.
    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        match self.find(PropertyType::ReceiveMaximum) {
            Some(Property::ReceiveMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Topic Alias Maximum property value.
    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        match self.find(PropertyType::TopicAliasMaximum) {
            Some(Property::TopicAliasMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Topic Alias property value.
    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.find(PropertyType::TopicAlias) {
            Some(Property::TopicAlias(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Maximum `QoS` property value.
    #[must_use]
    pub fn maximum_qos(&self) -> Option<QoS> {
        match self.find(PropertyType::MaximumQoS) {
            Some(Property::MaximumQoS(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get Retain Available property value.
    #[must_use]
    pub fn retain_available(&self) -> Option<bool> {
        match self.find(PropertyType::RetainAvailable) {
            Some(Property::RetainAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get all User Property pairs, in order.
    #[must_use]
    pub fn user_properties(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .filter_map(|p| match p {
                Property::UserProperty(v) => Some((v.key(), v.value())),
                _ => None,
            })
            .collect()
    }

    /// Add one User Property pair.
    ///
    /// # Errors
    ///
    /// Returns error if either part is not a valid MQTT string.
    pub fn add_user_property(&mut self, key: &str, value: &str) -> Result<&mut Self, StringError> {
        self.0
            .push(Property::UserProperty(StringPairData::from(key, value)?));
        Ok(self)
    }

    /// Get Maximum Packet Size property value.
    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        match self.find(PropertyType::MaximumPacketSize) {
            Some(Property::MaximumPacketSize(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Wildcard Subscription Available property value.
    #[must_use]
    pub fn wildcard_subscription_available(&self) -> Option<bool> {
        match self.find(PropertyType::WildcardSubscriptionAvailable) {
            Some(Property::WildcardSubscriptionAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Subscription Identifier Available property value.
    #[must_use]
    pub fn subscription_identifier_available(&self) -> Option<bool> {
        match self.find(PropertyType::SubscriptionIdentifierAvailable) {
            Some(Property::SubscriptionIdentifierAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    /// Get Shared Subscription Available property value.
    #[must_use]
    pub fn shared_subscription_available(&self) -> Option<bool> {
        match self.find(PropertyType::SharedSubscriptionAvailable) {
            Some(Property::SharedSubscriptionAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let payload_bytes = VarInt::decode(ba)?.value();
        if payload_bytes > ba.remaining_bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let end_offset = ba.offset() + payload_bytes;
        let mut properties = Vec::new();
        while ba.offset() < end_offset {
            let property = Property::decode(ba)?;
            properties.push(property);
        }
        if ba.offset() != end_offset {
            // The last property read past the declared property length.
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self(properties))
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let payload_bytes = self.payload_bytes();
        let len = VarInt::from(payload_bytes).map_err(|_| EncodeError::InvalidVarInt)?;
        let mut count = len.encode(buf)?;
        for property in &self.0 {
            count += property.encode(buf)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EncodePacket;

    #[test]
    fn test_properties_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::SessionExpiryInterval(U32Data::new(120)));
        properties.push(Property::ReceiveMaximum(U16Data::new(16)));
        properties.add_user_property("key", "value").unwrap();
        properties.add_user_property("key", "value2").unwrap();

        let mut buf = Vec::new();
        let n_bytes = properties.encode(&mut buf).unwrap();
        assert_eq!(n_bytes, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.session_expiry_interval(), Some(120));
        assert_eq!(decoded.receive_maximum(), Some(16));
        assert_eq!(
            decoded.user_properties(),
            vec![("key", "value"), ("key", "value2")]
        );
    }

    #[test]
    fn test_properties_rejects_zero_receive_maximum() {
        let buf = [
            0x03, // property length
            0x21, 0x00, 0x00, // ReceiveMaximum = 0
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            Properties::decode(&mut ba),
            Err(DecodeError::InvalidPropertyValue)
        );
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::ReasonString(StringData::from("ok").unwrap()));
        assert!(check_property_type_list(
            properties.props(),
            &[PropertyType::ReasonString, PropertyType::UserProperty]
        )
        .is_ok());

        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::UserProperty]),
            Err(PropertyType::ReasonString)
        );

        properties.push(Property::ReasonString(StringData::from("dup").unwrap()));
        assert_eq!(
            check_property_type_list(
                properties.props(),
                &[PropertyType::ReasonString, PropertyType::UserProperty]
            ),
            Err(PropertyType::ReasonString)
        );
    }
}
