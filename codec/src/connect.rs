// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::topic::TopicError;
use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    PacketType, Properties, PropertyType, PubTopic, QoS, StringData, PROTOCOL_NAME,
    PROTOCOL_VERSION,
};

/// Properties available in connect packets.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    PropertyType::AuthenticationData,
];

/// Properties available in the will message of connect packets.
pub const WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

/// The will message stored on the server and published when the network
/// connection is closed without a normal DISCONNECT.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Will {
    topic: PubTopic,
    qos: QoS,
    retain: bool,
    properties: Properties,
    payload: BinaryData,
}

impl Will {
    /// Create a new will message on `topic`.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid or `payload` is too long.
    pub fn new(topic: &str, qos: QoS, payload: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic).map_err(EncodeError::from)?;
        let payload = BinaryData::from_slice(payload)?;
        Ok(Self {
            topic,
            qos,
            retain: false,
            properties: Properties::new(),
            payload,
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

    /// Get will `qos` value.
    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Get will topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    /// Get a reference to will property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Get a mutable reference to will property list.
    pub fn mut_properties(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Get will payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_ref()
    }

    fn bytes(&self) -> usize {
        self.properties.bytes() + self.topic.bytes() + self.payload.bytes()
    }
}

/// The CONNECT packet is the first packet sent from the client to the
/// server after the network connection is established.
///
/// A client can only send the CONNECT packet once over a network
/// connection [MQTT-3.1.0-2].
///
/// Basic structure of packet:
///
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name length       |
/// |                            |
/// +----------------------------+
/// | Protocol name ...          |
/// +----------------------------+
/// | Protocol version           |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Properties ...             |
/// +----------------------------+
/// | Client id length           |
/// |                            |
/// +----------------------------+
/// | Client id string ...       |
/// +----------------------------+
/// | Will properties ...        |
/// +----------------------------+
/// | Will topic length          |
/// |                            |
/// +----------------------------+
/// | Will topic string ...      |
/// +----------------------------+
/// | Will payload length        |
/// |                            |
/// +----------------------------+
/// | Will payload bytes ...     |
/// +----------------------------+
/// | Username length            |
/// |                            |
/// +----------------------------+
/// | Username string ...        |
/// +----------------------------+
/// | Password length            |
/// |                            |
/// +----------------------------+
/// | Password bytes ...         |
/// +----------------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    /// When set, the server discards any existing session and starts
    /// a new one.
    clean_start: bool,

    /// Maximum interval in seconds between two control packets sent by
    /// the client.
    ///
    /// If the value is non-zero and the server does not receive a packet
    /// within one and a half times the keep alive, it closes the
    /// connection as if the network had failed [MQTT-3.1.2-22].
    keep_alive: u16,

    properties: Properties,

    /// The Client Identifier MUST be present and MUST be the first field in
    /// the CONNECT packet payload [MQTT-3.1.3-3].
    ///
    /// May be empty, in which case the server assigns one and returns it in
    /// the Assigned Client Identifier property of CONNACK.
    client_id: StringData,

    will: Option<Will>,

    username: Option<StringData>,

    password: Option<BinaryData>,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id).map_err(|_| EncodeError::InvalidClientId)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            clean_start: true,
            keep_alive: 60,
            client_id,
            ..Self::default()
        })
    }

    /// Update clean start flag.
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    /// Get current clean start flag.
    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Update keep alive value, in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Get current keep alive value.
    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update will message.
    pub fn set_will(&mut self, will: Option<Will>) -> &mut Self {
        self.will = will;
        self
    }

    /// Get current will message.
    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    /// Update username.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is not a valid MQTT string.
    pub fn set_username(&mut self, username: Option<&str>) -> Result<&mut Self, EncodeError> {
        self.username = match username {
            Some(username) => Some(StringData::from(username)?),
            None => None,
        };
        Ok(self)
    }

    /// Get current username.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_ref().map(AsRef::as_ref)
    }

    /// Update password.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is too long.
    pub fn set_password(&mut self, password: Option<&[u8]>) -> Result<&mut Self, EncodeError> {
        self.password = match password {
            Some(password) => Some(BinaryData::from_slice(password)?),
            None => None,
        };
        Ok(self)
    }

    /// Get current password.
    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_ref().map(AsRef::as_ref)
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

    const fn connect_flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_start {
            flags |= 0b0000_0010;
        }
        if let Some(will) = &self.will {
            flags |= 0b0000_0100;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0b0010_0000;
            }
        }
        if self.password.is_some() {
            flags |= 0b0100_0000;
        }
        if self.username.is_some() {
            flags |= 0b1000_0000;
        }
        flags
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, EncodeError> {
        // Protocol name, version byte, connect flags byte and keep alive.
        let mut remaining_length = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        remaining_length += self.properties.bytes();
        remaining_length += self.client_id.bytes();
        if let Some(will) = &self.will {
            remaining_length += will.bytes();
        }
        if let Some(username) = &self.username {
            remaining_length += username.bytes();
        }
        if let Some(password) = &self.password {
            remaining_length += password.bytes();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        protocol_name.encode(buf)?;
        buf.push(PROTOCOL_VERSION);
        buf.push(self.connect_flags());
        buf.push((self.keep_alive >> 8) as u8);
        buf.push((self.keep_alive & 0xff) as u8);
        self.properties.encode(buf)?;

        self.client_id.encode(buf)?;
        if let Some(will) = &self.will {
            will.properties.encode(buf)?;
            will.topic.encode(buf)?;
            will.payload.encode(buf)?;
        }
        if let Some(username) = &self.username {
            username.encode(buf)?;
        }
        if let Some(password) = &self.password {
            password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }
        let protocol_version = ba.read_byte()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::InvalidProtocolVersion);
        }

        let connect_flags = ba.read_byte()?;
        // The server MUST validate that the reserved flag is set to 0
        // [MQTT-3.1.2-3].
        if connect_flags & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let clean_start = connect_flags & 0b0000_0010 != 0;
        let has_will = connect_flags & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((connect_flags & 0b0001_1000) >> 3)?;
        let will_retain = connect_flags & 0b0010_0000 != 0;
        let has_password = connect_flags & 0b0100_0000 != 0;
        let has_username = connect_flags & 0b1000_0000 != 0;

        // If the Will Flag is set to 0, then Will QoS and Will Retain MUST
        // be 0 [MQTT-3.1.2-11], [MQTT-3.1.2-13].
        if !has_will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let keep_alive = ba.read_u16()?;

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!(
                "ConnectPacket: property type {property_type:?} cannot be used in properties!"
            );
            return Err(DecodeError::InvalidPropertyType);
        }

        let client_id = StringData::decode(ba)?;
        validate_client_id(client_id.as_ref()).map_err(DecodeError::from)?;

        let will = if has_will {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), WILL_PROPERTIES)
            {
                log::error!(
                    "ConnectPacket: property type {property_type:?} cannot be used in will properties!"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            let will_topic = PubTopic::decode(ba)?;
            if will_topic.is_empty() {
                return Err(DecodeError::from(TopicError::EmptyTopic));
            }
            let will_payload = BinaryData::decode(ba)?;
            Some(Will {
                topic: will_topic,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
                payload: will_payload,
            })
        } else {
            None
        };

        let username = if has_username {
            Some(StringData::decode(ba)?)
        } else {
            None
        };
        let password = if has_password {
            Some(BinaryData::decode(ba)?)
        } else {
            None
        };

        Ok(Self {
            clean_start,
            keep_alive,
            properties,
            client_id,
            will,
            username,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Property;
    use crate::U32Data;

    #[test]
    fn test_connect_minimal_round_trip() {
        let mut buf = Vec::new();
        let packet = ConnectPacket::new("loro-tests").unwrap();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.clean_start());
        assert_eq!(decoded.keep_alive(), 60);
        assert_eq!(decoded.client_id(), "loro-tests");
    }

    #[test]
    fn test_connect_with_credentials_and_will() {
        let mut packet = ConnectPacket::new("c1").unwrap();
        packet.set_clean_start(false);
        packet.set_keep_alive(30);
        packet.set_username(Some("user")).unwrap();
        packet.set_password(Some(b"pass")).unwrap();
        packet
            .mut_properties()
            .push(Property::SessionExpiryInterval(U32Data::new(600)));

        let mut will = Will::new("will/topic", QoS::AtLeastOnce, b"gone").unwrap();
        will.set_retain(true);
        packet.set_will(Some(will));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.username(), Some("user"));
        assert_eq!(decoded.password(), Some(&b"pass"[..]));
        let will = decoded.will().unwrap();
        assert_eq!(will.topic(), "will/topic");
        assert_eq!(will.qos(), QoS::AtLeastOnce);
        assert!(will.retain());
        assert_eq!(will.payload(), b"gone");
        assert_eq!(decoded.properties().session_expiry_interval(), Some(600));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol_name() {
        let mut buf = Vec::new();
        let packet = ConnectPacket::new("c1").unwrap();
        packet.encode(&mut buf).unwrap();
        // Corrupt protocol name.
        buf[4] = b'X';

        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }
}
