// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::io::Write;

use crate::property::check_property_type_list;
use crate::topic::TopicError;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, Properties, PropertyType, PubTopic, QoS,
};

/// The PUBLISH packet transports application messages, from the client to
/// the server or from the server to the client.
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name length     |
/// |                       |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// |                       |
/// +-----------------------+
/// | Properties ...        |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// The packet id field only appears in `QoS` 1 and `QoS` 2 packets.
///
/// Response to a `PublishPacket`:
/// - `QoS` 0, none
/// - `QoS` 1, `PublishAckPacket`
/// - `QoS` 2, `PublishReceivedPacket`
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    /// The DUP flag MUST be set to 1 when the client or server attempts to
    /// re-deliver a PUBLISH packet [MQTT-3.3.1-1], and MUST be 0 for all
    /// `QoS` 0 messages [MQTT-3.3.1-2].
    dup: bool,

    /// Level of assurance for delivery of the message.
    ///
    /// A PUBLISH packet MUST NOT have both `QoS` bits set to 1
    /// [MQTT-3.3.1-4].
    qos: QoS,

    /// Whether the server stores the message and delivers it to future
    /// subscribers of the topic [MQTT-3.3.1-5].
    retain: bool,

    /// The Topic Name identifies the information channel to which the
    /// payload is published.
    ///
    /// It is a Protocol Error if the Topic Name is zero length and there is
    /// no Topic Alias property.
    topic: PubTopic,

    /// Present when `QoS` is 1 or 2, zero otherwise.
    packet_id: PacketId,

    properties: Properties,

    /// The application message.
    msg: Vec<u8>,
}

/// Properties available in publish packets.
pub const PUBLISH_PROPERTIES: &[PropertyType] = &[
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::TopicAlias,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
    // A PUBLISH packet sent from a client to a server MUST NOT contain
    // a Subscription Identifier [MQTT-3.3.4-6]; packets from the server
    // carry the identifiers of the matching subscriptions.
    PropertyType::SubscriptionIdentifier,
    PropertyType::ContentType,
];

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic).map_err(EncodeError::from)?;
        Ok(Self {
            qos,
            dup: false,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            properties: Properties::new(),
            msg: msg.to_vec(),
        })
    }

    /// Create a publish packet with an empty topic name, resolved through
    /// the Topic Alias property in `properties`.
    ///
    /// # Errors
    ///
    /// Returns error if no Topic Alias property is set.
    pub fn with_topic_alias(
        qos: QoS,
        properties: Properties,
        msg: &[u8],
    ) -> Result<Self, EncodeError> {
        if properties.topic_alias().is_none() {
            return Err(EncodeError::InvalidTopic);
        }
        Ok(Self {
            qos,
            dup: false,
            retain: false,
            topic: PubTopic::empty(),
            packet_id: PacketId::new(0),
            properties,
            msg: msg.to_vec(),
        })
    }

    /// Update `retain` flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    /// Get current `retain` flag.
    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` flag is set in `QoS` 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketType);
        }
        self.dup = dup;
        Ok(self)
    }

    /// Get current `dup` flag.
    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Update `qos` value.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
            self.dup = false;
        }
        self.qos = qos;
        self
    }

    /// Get current `qos` value.
    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Update packet id.
    ///
    /// The packet id field only appears in `QoS` 1 and `QoS` 2 packets.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    /// Get current packet id.
    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Update topic value.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn set_topic(&mut self, topic: &str) -> Result<&mut Self, TopicError> {
        self.topic = PubTopic::new(topic)?;
        Ok(self)
    }

    /// Get current topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    /// Get a mutable reference to property list.
    pub fn mut_properties(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Get a reference to property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Attach a Topic Alias property. With `omit_topic` the topic name is
    /// emitted empty, for aliases the receiver has already learned.
    pub fn apply_topic_alias(&mut self, alias: u16, omit_topic: bool) -> &mut Self {
        use crate::{Property, U16Data};
        self.properties.set(Property::TopicAlias(U16Data::new(alias)));
        if omit_topic {
            self.topic = PubTopic::empty();
        }
        self
    }

    /// Get a reference to message payload.
    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, EncodeError> {
        let mut remaining_length = self.topic.bytes() + self.properties.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }

    /// Get total byte length this packet occupies on the wire.
    ///
    /// # Errors
    ///
    /// Returns error if packet is too large.
    pub fn bytes(&self) -> Result<usize, EncodeError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        let variable_header_offset = ba.offset();
        let topic = PubTopic::decode(ba)?;

        // A PUBLISH packet MUST NOT contain a packet id if its QoS value is
        // set to 0 [MQTT-2.2.1-2].
        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), PUBLISH_PROPERTIES)
        {
            log::error!(
                "PublishPacket: property type {property_type:?} cannot be used in properties!"
            );
            return Err(DecodeError::InvalidPropertyType);
        }

        // It is a Protocol Error if the Topic Name is zero length and there
        // is no Topic Alias.
        if topic.is_empty() && properties.topic_alias().is_none() {
            return Err(DecodeError::EmptyTopic);
        }

        let consumed = ba.offset() - variable_header_offset;
        let msg_len = fixed_header
            .remaining_length()
            .checked_sub(consumed)
            .ok_or(DecodeError::InvalidRemainingLength)?;
        let msg = ba.read_bytes(msg_len)?.to_vec();

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        // The packet id field is only present in PUBLISH packets where the
        // QoS level is 1 or 2.
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }
        self.properties.encode(buf)?;
        buf.write_all(&self.msg)?;

        Ok(buf.len() - old_len)
    }
}
