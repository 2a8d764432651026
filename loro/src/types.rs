// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::{
    BinaryData, BoolData, EncodeError, Properties, Property, PublishPacket, QoS, ReasonCode,
    RetainHandling, StringData, U32Data,
};

use crate::client::Client;

/// Callback invoked for incoming publish messages.
///
/// Handlers run on worker tasks, never on the dispatcher, so a slow
/// handler cannot stall protocol processing. The client handle is passed
/// in as an argument; subscriptions hold no reference back to the client.
pub type MessageHandler = Arc<dyn Fn(Client, PublishMessage) + Send + Sync>;

/// An application message, either to be published or as delivered to
/// message handlers.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    dup: bool,
    packet_id: u16,
    payload_is_utf8: Option<bool>,
    message_expiry_interval: Option<u32>,
    content_type: Option<String>,
    response_topic: Option<String>,
    correlation_data: Option<Vec<u8>>,
    subscription_identifiers: Vec<usize>,
    user_properties: Vec<(String, String)>,
}

impl PublishMessage {
    /// Create a message for `topic` with `payload`.
    #[must_use]
    pub fn new(topic: &str, qos: QoS, payload: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            ..Self::default()
        }
    }

    /// Build a message from a decoded publish packet, with `topic` already
    /// resolved through the topic alias table.
    #[must_use]
    pub(crate) fn from_packet(packet: &PublishPacket, topic: &str) -> Self {
        let properties = packet.properties();
        Self {
            topic: topic.to_string(),
            payload: packet.message().to_vec(),
            qos: packet.qos(),
            retain: packet.retain(),
            dup: packet.dup(),
            packet_id: packet.packet_id().value(),
            payload_is_utf8: properties.payload_format_indicator(),
            message_expiry_interval: properties.message_expiry_interval(),
            content_type: properties.content_type().map(ToString::to_string),
            response_topic: properties.response_topic().map(ToString::to_string),
            correlation_data: properties.correlation_data().map(<[u8]>::to_vec),
            subscription_identifiers: properties.subscription_identifiers(),
            user_properties: properties
                .user_properties()
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    /// Get topic of this message.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get `QoS` of this message.
    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Get retain flag.
    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update retain flag.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    /// Whether this delivery might be a re-transmission.
    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    /// Get packet id of a received `QoS` 1/2 message, used with
    /// [`crate::Client::ack`] in manual ack mode. Zero for `QoS` 0.
    #[must_use]
    pub const fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Mark the payload as UTF-8 text (true) or raw bytes (false).
    pub fn set_payload_is_utf8(&mut self, is_utf8: bool) -> &mut Self {
        self.payload_is_utf8 = Some(is_utf8);
        self
    }

    /// Get payload format indicator.
    #[must_use]
    pub const fn payload_is_utf8(&self) -> Option<bool> {
        self.payload_is_utf8
    }

    /// Update message expiry interval in seconds.
    pub fn set_message_expiry_interval(&mut self, interval: Option<u32>) -> &mut Self {
        self.message_expiry_interval = interval;
        self
    }

    /// Get message expiry interval.
    #[must_use]
    pub const fn message_expiry_interval(&self) -> Option<u32> {
        self.message_expiry_interval
    }

    /// Update content type.
    pub fn set_content_type(&mut self, content_type: Option<&str>) -> &mut Self {
        self.content_type = content_type.map(ToString::to_string);
        self
    }

    /// Get content type.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Update response topic.
    pub fn set_response_topic(&mut self, response_topic: Option<&str>) -> &mut Self {
        self.response_topic = response_topic.map(ToString::to_string);
        self
    }

    /// Get response topic.
    #[must_use]
    pub fn response_topic(&self) -> Option<&str> {
        self.response_topic.as_deref()
    }

    /// Update correlation data.
    pub fn set_correlation_data(&mut self, data: Option<&[u8]>) -> &mut Self {
        self.correlation_data = data.map(<[u8]>::to_vec);
        self
    }

    /// Get correlation data.
    #[must_use]
    pub fn correlation_data(&self) -> Option<&[u8]> {
        self.correlation_data.as_deref()
    }

    /// Get subscription identifiers of a received message.
    #[must_use]
    pub fn subscription_identifiers(&self) -> &[usize] {
        &self.subscription_identifiers
    }

    /// Append one user property pair.
    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties
            .push((key.to_string(), value.to_string()));
        self
    }

    /// Get user property list.
    #[must_use]
    pub fn user_properties(&self) -> &[(String, String)] {
        &self.user_properties
    }

    /// Convert this message into a wire packet, without packet id.
    ///
    /// # Errors
    ///
    /// Returns error if topic or one of the property fields is invalid.
    pub(crate) fn to_packet(&self) -> Result<PublishPacket, EncodeError> {
        let mut packet = PublishPacket::new(&self.topic, self.qos, &self.payload)?;
        packet.set_retain(self.retain);

        let properties = packet.mut_properties();
        self.fill_properties(properties)?;
        Ok(packet)
    }

    fn fill_properties(&self, properties: &mut Properties) -> Result<(), EncodeError> {
        if let Some(is_utf8) = self.payload_is_utf8 {
            properties.push(Property::PayloadFormatIndicator(BoolData::new(is_utf8)));
        }
        if let Some(interval) = self.message_expiry_interval {
            properties.push(Property::MessageExpiryInterval(U32Data::new(interval)));
        }
        if let Some(content_type) = &self.content_type {
            properties.push(Property::ContentType(
                StringData::from(content_type).map_err(EncodeError::from)?,
            ));
        }
        if let Some(response_topic) = &self.response_topic {
            properties.push(Property::ResponseTopic(
                codec::PubTopic::new(response_topic).map_err(EncodeError::from)?,
            ));
        }
        if let Some(data) = &self.correlation_data {
            properties.push(Property::CorrelationData(BinaryData::from_slice(data)?));
        }
        for (key, value) in &self.user_properties {
            properties
                .add_user_property(key, value)
                .map_err(EncodeError::from)?;
        }
        Ok(())
    }
}

/// Outcome of [`crate::Client::connect`].
#[derive(Debug, Clone)]
pub struct ConnectResult {
    /// Reason code from CONNACK.
    pub reason_code: ReasonCode,

    /// Whether the server resumed an existing session.
    pub session_present: bool,

    /// Client id picked by the server when the CONNECT carried an empty one.
    pub assigned_client_identifier: Option<String>,

    /// Diagnostic text from the server, if any.
    pub reason_string: Option<String>,

    /// Basis for building response topics, when requested.
    pub response_information: Option<String>,

    /// Effective keep alive in seconds, after the server override.
    pub keep_alive: u16,

    /// Session expiry granted by the server.
    pub session_expiry_interval: u32,

    /// How many `QoS` 1/2 publishes the server processes concurrently.
    pub server_receive_maximum: u16,

    /// Largest packet the server accepts.
    pub server_maximum_packet_size: Option<u32>,

    /// Highest topic alias value the server accepts.
    pub server_topic_alias_maximum: u16,

    /// Highest `QoS` the server supports.
    pub maximum_qos: QoS,

    /// Whether the server supports retained messages.
    pub retain_available: bool,

    /// Whether the server supports wildcard subscriptions.
    pub wildcard_subscription_available: bool,

    /// Whether the server supports subscription identifiers.
    pub subscription_identifier_available: bool,

    /// Whether the server supports shared subscriptions.
    pub shared_subscription_available: bool,

    /// User properties of the CONNACK packet.
    pub user_properties: Vec<(String, String)>,
}

/// Outcome of [`crate::Client::publish`].
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// The message as it was published.
    pub message: PublishMessage,

    /// Reason code of the acknowledgement; `None` for `QoS` 0, the PUBACK
    /// code for `QoS` 1 and the PUBREC code for `QoS` 2.
    pub reason_code: Option<ReasonCode>,

    /// Diagnostic text from the server, if any.
    pub reason_string: Option<String>,
}

impl PublishResult {
    /// Returns true if the server reported no failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason_code.map_or(true, |code| !code.is_error())
    }
}

/// One topic filter of a subscribe call.
#[derive(Clone, Default)]
pub struct SubscribeTopicOptions {
    /// Validated topic filter string.
    pub filter: String,

    /// Maximum `QoS` the server may use for this subscription.
    pub qos: QoS,

    /// Do not deliver messages published by this client itself.
    pub no_local: bool,

    /// Keep the original RETAIN flag on forwarded messages.
    pub retain_as_published: bool,

    /// Retained message behaviour at subscribe time.
    pub retain_handling: RetainHandling,

    /// Handler invoked for messages matching this filter, in addition to
    /// the global message handler.
    pub handler: Option<MessageHandler>,
}

impl std::fmt::Debug for SubscribeTopicOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SubscribeTopicOptions")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("no_local", &self.no_local)
            .field("retain_as_published", &self.retain_as_published)
            .field("retain_handling", &self.retain_handling)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl SubscribeTopicOptions {
    /// Create options for one `filter` with `qos`.
    #[must_use]
    pub fn new(filter: &str, qos: QoS) -> Self {
        Self {
            filter: filter.to_string(),
            qos,
            ..Self::default()
        }
    }

    /// Attach a per subscription message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: MessageHandler) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// Options of one subscribe call.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Topic filters to subscribe, at least one.
    pub topics: Vec<SubscribeTopicOptions>,

    /// Subscription identifier attached to all filters of this call.
    pub subscription_identifier: Option<u32>,

    /// User properties of the SUBSCRIBE packet.
    pub user_properties: Vec<(String, String)>,
}

impl SubscribeOptions {
    /// Create options for one `filter` with `qos`.
    #[must_use]
    pub fn new(filter: &str, qos: QoS) -> Self {
        Self {
            topics: vec![SubscribeTopicOptions::new(filter, qos)],
            ..Self::default()
        }
    }

    /// Append one more topic filter.
    #[must_use]
    pub fn add_topic(mut self, topic: SubscribeTopicOptions) -> Self {
        self.topics.push(topic);
        self
    }
}

/// Outcome of [`crate::Client::subscribe`]: one reason code per filter,
/// in request order.
#[derive(Debug, Clone)]
pub struct SubscribeResult {
    /// Filter and the reason code the server granted or refused it with.
    pub entries: Vec<(String, ReasonCode)>,

    /// Diagnostic text from the server, if any.
    pub reason_string: Option<String>,
}

impl SubscribeResult {
    /// Returns true if every filter was granted.
    #[must_use]
    pub fn all_granted(&self) -> bool {
        self.entries.iter().all(|(_, code)| !code.is_error())
    }
}

/// Outcome of [`crate::Client::unsubscribe`]: one reason code per filter,
/// in request order.
#[derive(Debug, Clone)]
pub struct UnsubscribeResult {
    /// Filter and the reason code the server answered with.
    pub entries: Vec<(String, ReasonCode)>,

    /// Diagnostic text from the server, if any.
    pub reason_string: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_message_to_packet() {
        let mut message = PublishMessage::new("a/b", QoS::AtLeastOnce, b"payload");
        message.set_retain(true);
        message.set_content_type(Some("text/plain"));
        message.add_user_property("k", "v");

        let packet = message.to_packet().unwrap();
        assert_eq!(packet.topic(), "a/b");
        assert_eq!(packet.qos(), QoS::AtLeastOnce);
        assert!(packet.retain());
        assert_eq!(packet.properties().content_type(), Some("text/plain"));
        assert_eq!(packet.properties().user_properties(), vec![("k", "v")]);
    }

    #[test]
    fn test_publish_result_success() {
        let result = PublishResult {
            message: PublishMessage::new("t", QoS::AtMostOnce, b""),
            reason_code: None,
            reason_string: None,
        };
        assert!(result.is_success());

        let result = PublishResult {
            message: PublishMessage::new("t", QoS::AtLeastOnce, b""),
            reason_code: Some(ReasonCode::NoMatchingSubscribers),
            reason_string: None,
        };
        assert!(result.is_success());

        let result = PublishResult {
            message: PublishMessage::new("t", QoS::AtLeastOnce, b""),
            reason_code: Some(ReasonCode::NotAuthorized),
            reason_string: None,
        };
        assert!(!result.is_success());
    }
}
