// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use codec::{
    Packet, PublishAckPacket, PublishCompletePacket, QoS, SubTopic, SubscribePacket,
    SubscribeTopic, UnsubscribePacket, VarInt,
};

use crate::commands::{ClientCmd, WriterCmd};
use crate::connect_options::ConnectOptions;
use crate::context::{AuthHandler, ClientContext, PublishWaiter, SubscribeRequest, UnsubscribeRequest};
use crate::error::{Error, ErrorKind};
use crate::events::{ClientEvent, EventBus, EventHandler, EventKind};
use crate::inflight::InflightPacket;
use crate::supervisor::Supervisor;
use crate::types::{
    MessageHandler, PublishMessage, PublishResult, SubscribeOptions, SubscribeResult,
    UnsubscribeResult,
};

/// An asynchronous MQTT 5.0 client.
///
/// Handles are cheap to clone and safe to use from many tasks at once;
/// all of them drive the same session. Operations suspend at the natural
/// flow control points: packet id acquisition, in-flight admission, and
/// waiting for the acknowledgement.
///
/// ```no_run
/// use loro::{Client, ConnectOptions, PublishMessage, QoS};
///
/// # async fn demo() -> Result<(), loro::Error> {
/// let client = Client::new(ConnectOptions::new("localhost", 1883));
/// client.connect().await?;
/// let message = PublishMessage::new("greeting", QoS::AtLeastOnce, b"hello");
/// let result = client.publish(message).await?;
/// assert!(result.is_success());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    ctx: Arc<ClientContext>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.ctx.is_connected())
            .finish()
    }
}

impl Client {
    /// Create a client and start its connection supervisor.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(options: ConnectOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let ctx = Arc::new(ClientContext::new(&options, cmd_tx, event_tx));
        let supervisor = Supervisor::new(options, Arc::clone(&ctx), cmd_rx, event_rx);
        tokio::spawn(supervisor.run());
        Self { ctx }
    }

    /// A handle for the dispatcher to pass into message handlers.
    pub(crate) fn from_context(ctx: Arc<ClientContext>) -> Self {
        Self { ctx }
    }

    /// Install the global handler invoked for every incoming message.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.ctx.on_message.lock().unwrap() = Some(handler);
    }

    /// Install the enhanced authentication hook answering AUTH packets.
    pub fn set_auth_handler(&self, handler: AuthHandler) {
        *self.ctx.auth_handler.lock().unwrap() = Some(handler);
    }

    /// Register an event handler.
    pub fn on_event(&self, kind: EventKind, handler: EventHandler) {
        self.ctx.events.register(kind, handler);
    }

    /// Access the event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Whether a CONNACK has been accepted and the connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ctx.is_connected()
    }

    /// Establish the session.
    ///
    /// With automatic reconnect enabled, transport failures are retried
    /// with exponential backoff until the server answers; a CONNACK
    /// rejection always fails immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect, the server rejects
    /// the CONNECT, or no CONNACK arrives within the response timeout.
    pub async fn connect(&self) -> Result<crate::types::ConnectResult, Error> {
        let (tx, rx) = oneshot::channel();
        self.ctx.cmd_tx.send(ClientCmd::Connect { tx }).await?;
        rx.await?
    }

    /// Gracefully shut the session down.
    ///
    /// Drains the send queue, sends DISCONNECT and closes the transport.
    /// Returns true when that happened, false when the client was already
    /// disconnected.
    ///
    /// # Errors
    ///
    /// Returns error if the supervisor is gone.
    pub async fn disconnect(&self) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.ctx.cmd_tx.send(ClientCmd::Disconnect { tx }).await?;
        rx.await?
    }

    /// Publish `message`.
    ///
    /// `QoS` 0 messages are queued for the writer and the call returns;
    /// `QoS` 1/2 messages suspend until the flow control window has room
    /// and the terminal acknowledgement arrives.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is invalid, the packet exceeds the
    /// server maximum packet size, the server rejects the publish, or no
    /// acknowledgement arrives within the response timeout. The protocol
    /// obligation of an admitted `QoS` 1/2 publish continues after a
    /// timeout error.
    pub async fn publish(&self, message: PublishMessage) -> Result<PublishResult, Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }

        let (maximum_qos, retain_available, maximum_packet_size) = {
            let negotiated = self.ctx.negotiated.lock().unwrap();
            (
                negotiated.maximum_qos,
                negotiated.retain_available,
                negotiated.server_maximum_packet_size,
            )
        };
        if message.qos() > maximum_qos {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Server supports at most {maximum_qos:?}"),
            ));
        }
        if message.retain() && !retain_available {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "Server does not support retained messages",
            ));
        }

        let mut packet = message.to_packet().map_err(|err| {
            if err == codec::EncodeError::InvalidTopic {
                Error::new(ErrorKind::InvalidTopicFilter, "Invalid publish topic")
            } else {
                Error::from(err)
            }
        })?;

        if message.qos() == QoS::AtMostOnce {
            Self::check_packet_size(&packet, maximum_packet_size)?;
            // Fast path: no packet id, no in-flight entry, no completion
            // signal. The writer picks it up directly.
            self.ctx
                .queue
                .push_data(WriterCmd::Packet(Packet::Publish(packet)));
            return Ok(PublishResult {
                message,
                reason_code: None,
                reason_string: None,
            });
        }

        let packet_id = self.ctx.acquire_packet_id().await;
        packet.set_packet_id(packet_id);
        if let Err(err) = Self::check_packet_size(&packet, maximum_packet_size) {
            self.ctx.allocator.release(packet_id);
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        self.ctx.publish_waiters.lock().unwrap().insert(
            packet_id.value(),
            PublishWaiter {
                message,
                tx: Some(tx),
                pubrec: None,
            },
        );

        let mut cancel = self.ctx.cancel.subscribe();
        let admitted = self
            .ctx
            .inflight
            .add(packet_id, InflightPacket::Publish(packet.clone()), &mut cancel)
            .await;
        if !admitted {
            self.ctx
                .publish_waiters
                .lock()
                .unwrap()
                .remove(&packet_id.value());
            self.ctx.allocator.release(packet_id);
            return Err(Error::new(
                ErrorKind::OperationCanceled,
                "Session shut down before the publish was admitted",
            ));
        }

        self.ctx
            .queue
            .push_data(WriterCmd::Packet(Packet::Publish(packet)));

        match timeout(self.ctx.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_err)) => Err(Error::new(
                ErrorKind::OperationCanceled,
                "Session shut down while awaiting the acknowledgement",
            )),
            // The state machine keeps the flow alive; only the caller
            // stops waiting.
            Err(elapsed) => Err(Error::from(elapsed)),
        }
    }

    fn check_packet_size(
        packet: &codec::PublishPacket,
        maximum_packet_size: Option<u32>,
    ) -> Result<(), Error> {
        let Some(maximum) = maximum_packet_size else {
            return Ok(());
        };
        let packet_bytes = packet.bytes().map_err(Error::from)?;
        if packet_bytes > maximum as usize {
            return Err(Error::from_string(
                ErrorKind::PacketTooLarge,
                format!("Packet of {packet_bytes} bytes exceeds server maximum of {maximum}"),
            ));
        }
        Ok(())
    }

    /// Subscribe to one or more topic filters.
    ///
    /// # Errors
    ///
    /// Returns error if a filter is invalid, the client is not connected,
    /// or no SUBACK arrives within the response timeout.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<SubscribeResult, Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }
        if options.topics.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "Subscribe needs at least one topic filter",
            ));
        }

        let mut topics = Vec::with_capacity(options.topics.len());
        for topic in &options.topics {
            let mut subscribe_topic = SubscribeTopic::new(&topic.filter, topic.qos)?;
            subscribe_topic.set_no_local(topic.no_local);
            subscribe_topic.set_retain_as_published(topic.retain_as_published);
            subscribe_topic.set_retain_handling(topic.retain_handling);
            topics.push(subscribe_topic);
        }

        let filters: Vec<String> = options.topics.iter().map(|t| t.filter.clone()).collect();
        self.ctx.events.emit_with(EventKind::BeforeSubscribe, || {
            ClientEvent::BeforeSubscribe {
                filters: filters.clone(),
            }
        });

        let packet_id = self.ctx.acquire_packet_id().await;
        let mut packet = SubscribePacket::with_topics(packet_id, topics);
        if let Some(identifier) = options.subscription_identifier {
            let identifier = VarInt::from(identifier as usize).map_err(|_| {
                Error::new(ErrorKind::ConfigError, "Subscription identifier too large")
            })?;
            packet
                .mut_properties()
                .push(codec::Property::SubscriptionIdentifier(identifier));
        }
        for (key, value) in &options.user_properties {
            packet
                .mut_properties()
                .add_user_property(key, value)
                .map_err(|err| Error::from_string(ErrorKind::ConfigError, format!("{err:?}")))?;
        }

        let (tx, rx) = oneshot::channel();
        self.ctx
            .sub_requests
            .lock()
            .unwrap()
            .insert(packet_id.value(), SubscribeRequest { options, tx });

        self.ctx
            .queue
            .push_data(WriterCmd::Packet(Packet::Subscribe(packet)));

        match timeout(self.ctx.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_err)) => Err(Error::new(
                ErrorKind::OperationCanceled,
                "Session shut down while awaiting SUBACK",
            )),
            Err(elapsed) => Err(Error::from(elapsed)),
        }
    }

    /// Subscribe to a single `filter` with `qos`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_topic(&self, filter: &str, qos: QoS) -> Result<SubscribeResult, Error> {
        self.subscribe(SubscribeOptions::new(filter, qos)).await
    }

    /// Unsubscribe from topic filters previously subscribed.
    ///
    /// # Errors
    ///
    /// Returns error if a filter is not in the subscription registry
    /// (nothing is sent in that case), the client is not connected, or no
    /// UNSUBACK arrives within the response timeout.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Result<UnsubscribeResult, Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::NotConnected, "Not connected"));
        }
        if filters.is_empty() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "Unsubscribe needs at least one topic filter",
            ));
        }

        let mut topics = Vec::with_capacity(filters.len());
        {
            let registry = self.ctx.registry.lock().unwrap();
            for filter in filters {
                if !registry.contains(filter) {
                    return Err(Error::from_string(
                        ErrorKind::NoSuchSubscription,
                        format!("Not subscribed to {filter}"),
                    ));
                }
                topics.push(SubTopic::new(filter)?);
            }
        }

        let filter_strings: Vec<String> = filters.iter().map(ToString::to_string).collect();
        self.ctx
            .events
            .emit_with(EventKind::BeforeUnsubscribe, || {
                ClientEvent::BeforeUnsubscribe {
                    filters: filter_strings.clone(),
                }
            });

        let packet_id = self.ctx.acquire_packet_id().await;
        let packet = UnsubscribePacket::with_topics(packet_id, topics);

        let (tx, rx) = oneshot::channel();
        self.ctx.unsub_requests.lock().unwrap().insert(
            packet_id.value(),
            UnsubscribeRequest {
                filters: filter_strings,
                tx,
            },
        );

        self.ctx
            .queue
            .push_data(WriterCmd::Packet(Packet::Unsubscribe(packet)));

        match timeout(self.ctx.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_err)) => Err(Error::new(
                ErrorKind::OperationCanceled,
                "Session shut down while awaiting UNSUBACK",
            )),
            Err(elapsed) => Err(Error::from(elapsed)),
        }
    }

    /// Acknowledge a received message by packet id, in manual ack mode.
    ///
    /// Acknowledging a `QoS` 0 message (packet id 0) is a no-op. For
    /// `QoS` 1 this sends the PUBACK; for `QoS` 2 the PUBCOMP goes out as
    /// soon as the server's PUBREL has arrived as well.
    ///
    /// # Errors
    ///
    /// Returns error if manual ack mode is not enabled, the id is
    /// unknown, or the message was already acknowledged.
    pub fn ack(&self, packet_id: u16) -> Result<(), Error> {
        if !self.ctx.config.manual_ack {
            return Err(Error::new(
                ErrorKind::ManualAckError,
                "Manual ack mode is not enabled",
            ));
        }
        if packet_id == 0 {
            // QoS 0 carries no acknowledgement.
            return Ok(());
        }

        let (qos, rel_received) = {
            let mut manual_acks = self.ctx.manual_acks.lock().unwrap();
            let Some(entry) = manual_acks.get_mut(&packet_id) else {
                return Err(Error::from_string(
                    ErrorKind::ManualAckError,
                    format!("No pending message with packet id {packet_id}"),
                ));
            };
            if entry.acked {
                return Err(Error::from_string(
                    ErrorKind::ManualAckError,
                    format!("Packet id {packet_id} was already acknowledged"),
                ));
            }
            entry.acked = true;
            (entry.qos, entry.rel_received)
        };

        match qos {
            QoS::AtMostOnce => (),
            QoS::AtLeastOnce => {
                self.ctx
                    .queue
                    .push_priority(WriterCmd::Packet(Packet::PublishAck(
                        PublishAckPacket::new(codec::PacketId::new(packet_id)),
                    )));
            }
            QoS::ExactOnce => {
                if rel_received {
                    self.ctx
                        .inbound_qos2
                        .lock()
                        .unwrap()
                        .remove(&packet_id);
                    self.ctx
                        .queue
                        .push_priority(WriterCmd::Packet(Packet::PublishComplete(
                            PublishCompletePacket::new(codec::PacketId::new(packet_id)),
                        )));
                }
                // Otherwise the PUBCOMP goes out when PUBREL arrives.
            }
        }
        Ok(())
    }

    /// Acknowledge a received message, in manual ack mode.
    ///
    /// # Errors
    ///
    /// See [`Self::ack`].
    pub fn ack_message(&self, message: &PublishMessage) -> Result<(), Error> {
        self.ack(message.packet_id())
    }
}
