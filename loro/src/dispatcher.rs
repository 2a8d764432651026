// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use codec::{
    Packet, PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, ReasonCode, SubTopic, SubscribeAckPacket, UnsubscribeAckPacket,
};

use crate::alias::AliasError;
use crate::client::Client;
use crate::commands::{PipelineEvent, WriterCmd};
use crate::context::{ClientContext, ManualAckEntry};
use crate::error::Error;
use crate::events::{ClientEvent, EventKind, PacketKind};
use crate::inflight::InflightPacket;
use crate::subscription::Subscription;
use crate::types::{MessageHandler, PublishMessage, PublishResult, SubscribeResult, UnsubscribeResult};

/// Routes every decoded packet to its handler.
///
/// The dispatcher is the single consumer of the reader's queue, so
/// transitions of the same packet id happen in wire order without
/// additional locking. User callbacks never run on this task; they are
/// handed to spawned workers.
pub struct Dispatcher {
    packet_rx: mpsc::Receiver<Packet>,
    ctx: Arc<ClientContext>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        packet_rx: mpsc::Receiver<Packet>,
        ctx: Arc<ClientContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            packet_rx,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::debug!("dispatcher: task started");
        loop {
            let packet = tokio::select! {
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.handle_packet(packet).await;
        }
        log::debug!("dispatcher: task finished");
    }

    async fn handle_packet(&mut self, packet: Packet) {
        let kind = PacketKind::from(&packet);
        self.ctx
            .events
            .emit_with(EventKind::PacketReceived(kind), || {
                ClientEvent::PacketReceived { kind }
            });

        match packet {
            Packet::ConnectAck(ack) => {
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::ConnectAckReceived(Box::new(ack)))
                    .await;
            }
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PublishAck(ack) => self.handle_publish_ack(&ack),
            Packet::PublishReceived(ack) => self.handle_publish_received(&ack),
            Packet::PublishRelease(rel) => self.handle_publish_release(&rel),
            Packet::PublishComplete(comp) => self.handle_publish_complete(&comp),
            Packet::SubscribeAck(ack) => self.handle_subscribe_ack(ack).await,
            Packet::UnsubscribeAck(ack) => self.handle_unsubscribe_ack(&ack),
            Packet::PingResponse(_) => {
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::PingResponseReceived)
                    .await;
            }
            Packet::Disconnect(disconnect) => {
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::DisconnectReceived(Box::new(disconnect)))
                    .await;
            }
            Packet::Auth(auth) => {
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::AuthReceived(Box::new(auth)))
                    .await;
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingRequest(_) => {
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::ProtocolViolation {
                        reason_code: ReasonCode::ProtocolError,
                        message: "Received a client-to-server packet".to_string(),
                    })
                    .await;
            }
        }
    }

    /// Incoming application message, the receive side of the `QoS`
    /// machines.
    async fn handle_publish(&mut self, publish: PublishPacket) {
        let alias = publish.properties().topic_alias();
        let resolved = self
            .ctx
            .inbound_aliases
            .lock()
            .unwrap()
            .resolve(publish.topic(), alias);
        let topic = match resolved {
            Ok(topic) => topic,
            Err(err) => {
                let reason_code = match err {
                    AliasError::OutOfRange => ReasonCode::TopicAliasInvalid,
                    AliasError::UnknownAlias | AliasError::MissingAlias => {
                        ReasonCode::ProtocolError
                    }
                };
                let _ = self
                    .ctx
                    .event_tx
                    .send(PipelineEvent::ProtocolViolation {
                        reason_code,
                        message: format!("Topic alias violation: {err:?}"),
                    })
                    .await;
                return;
            }
        };

        let message = PublishMessage::from_packet(&publish, &topic);
        let packet_id = publish.packet_id();

        match publish.qos() {
            QoS::AtMostOnce => self.deliver(message),
            QoS::AtLeastOnce => {
                if self.ctx.config.manual_ack {
                    self.ctx.manual_acks.lock().unwrap().insert(
                        packet_id.value(),
                        ManualAckEntry {
                            qos: QoS::AtLeastOnce,
                            acked: false,
                            rel_received: false,
                        },
                    );
                } else {
                    self.send_priority(Packet::PublishAck(PublishAckPacket::new(packet_id)));
                }
                self.deliver(message);
            }
            QoS::ExactOnce => {
                let first_delivery = self
                    .ctx
                    .inbound_qos2
                    .lock()
                    .unwrap()
                    .insert(packet_id.value());
                if first_delivery {
                    if self.ctx.config.manual_ack {
                        self.ctx.manual_acks.lock().unwrap().insert(
                            packet_id.value(),
                            ManualAckEntry {
                                qos: QoS::ExactOnce,
                                acked: false,
                                rel_received: false,
                            },
                        );
                    }
                    self.deliver(message);
                } else {
                    // The server re-transmitted before seeing our PUBREC;
                    // acknowledge again but deliver only once.
                    log::info!("dispatcher: duplicate QoS 2 publish {packet_id}");
                }
                self.send_priority(Packet::PublishReceived(PublishReceivedPacket::new(
                    packet_id,
                )));
            }
        }
    }

    /// PUBACK, the terminal ack of a send-side `QoS` 1 flow.
    fn handle_publish_ack(&mut self, ack: &PublishAckPacket) {
        let packet_id = ack.packet_id();
        if self.ctx.inflight.remove(packet_id).is_none() {
            log::warn!("dispatcher: unexpected PUBACK for {packet_id}, dropped");
            return;
        }
        self.ctx.allocator.release(packet_id);

        let waiter = self
            .ctx
            .publish_waiters
            .lock()
            .unwrap()
            .remove(&packet_id.value());
        if let Some(waiter) = waiter {
            if let Some(tx) = waiter.tx {
                let reason_string = ack.properties().reason_string().map(ToString::to_string);
                let result = if ack.reason_code().is_error() {
                    Err(Error::broker_rejected(ack.reason_code(), "PUBLISH"))
                } else {
                    Ok(PublishResult {
                        message: waiter.message,
                        reason_code: Some(ack.reason_code()),
                        reason_string,
                    })
                };
                let _ = tx.send(result);
            }
        }
    }

    /// PUBREC, the middle ack of a send-side `QoS` 2 flow.
    fn handle_publish_received(&mut self, ack: &PublishReceivedPacket) {
        let packet_id = ack.packet_id();
        let Some(entry) = self.ctx.inflight.get(packet_id) else {
            log::warn!("dispatcher: unexpected PUBREC for {packet_id}, dropped");
            return;
        };

        if ack.reason_code().is_error() {
            // A failing PUBREC terminates the flow; no PUBREL follows.
            self.ctx.inflight.remove(packet_id);
            self.ctx.allocator.release(packet_id);
            let waiter = self
                .ctx
                .publish_waiters
                .lock()
                .unwrap()
                .remove(&packet_id.value());
            if let Some(waiter) = waiter {
                if let Some(tx) = waiter.tx {
                    let _ = tx.send(Err(Error::broker_rejected(ack.reason_code(), "PUBLISH")));
                }
            }
            return;
        }

        match &entry {
            InflightPacket::Publish(_) => {
                let release = InflightPacket::Release(PublishReleasePacket::new(packet_id));
                if !self.ctx.inflight.try_update(packet_id, &entry, release) {
                    log::warn!("dispatcher: lost PUBREC race for {packet_id}");
                    return;
                }
                if let Some(waiter) = self
                    .ctx
                    .publish_waiters
                    .lock()
                    .unwrap()
                    .get_mut(&packet_id.value())
                {
                    waiter.pubrec = Some((
                        ack.reason_code(),
                        ack.properties().reason_string().map(ToString::to_string),
                    ));
                }
            }
            InflightPacket::Release(_) => {
                // Our PUBREL was lost; the duplicate PUBREC asks for it
                // again.
                log::info!("dispatcher: duplicate PUBREC for {packet_id}");
            }
        }
        self.send_priority(Packet::PublishRelease(PublishReleasePacket::new(packet_id)));
    }

    /// PUBREL, the receive side of a `QoS` 2 flow releasing the id.
    fn handle_publish_release(&mut self, rel: &PublishReleasePacket) {
        let packet_id = rel.packet_id();

        if self.ctx.config.manual_ack {
            let mut manual_acks = self.ctx.manual_acks.lock().unwrap();
            if let Some(entry) = manual_acks.get_mut(&packet_id.value()) {
                if entry.qos == QoS::ExactOnce && !entry.acked {
                    // Hold the PUBCOMP until the user acknowledges.
                    entry.rel_received = true;
                    return;
                }
            }
        }

        let known = self
            .ctx
            .inbound_qos2
            .lock()
            .unwrap()
            .remove(&packet_id.value());
        let mut comp = PublishCompletePacket::new(packet_id);
        if !known {
            comp.set_reason_code(ReasonCode::PacketIdentifierNotFound);
        }
        self.send_priority(Packet::PublishComplete(comp));
    }

    /// PUBCOMP, the terminal ack of a send-side `QoS` 2 flow.
    fn handle_publish_complete(&mut self, comp: &PublishCompletePacket) {
        let packet_id = comp.packet_id();
        if self.ctx.inflight.remove(packet_id).is_none() {
            log::warn!("dispatcher: unexpected PUBCOMP for {packet_id}, dropped");
            return;
        }
        self.ctx.allocator.release(packet_id);

        let waiter = self
            .ctx
            .publish_waiters
            .lock()
            .unwrap()
            .remove(&packet_id.value());
        if let Some(waiter) = waiter {
            if let Some(tx) = waiter.tx {
                let (reason_code, reason_string) = waiter.pubrec.clone().unwrap_or((
                    comp.reason_code(),
                    comp.properties().reason_string().map(ToString::to_string),
                ));
                let _ = tx.send(Ok(PublishResult {
                    message: waiter.message,
                    reason_code: Some(reason_code),
                    reason_string,
                }));
            }
        }
    }

    /// SUBACK completes the pending subscribe and installs the granted
    /// filters in the registry.
    async fn handle_subscribe_ack(&mut self, ack: SubscribeAckPacket) {
        let packet_id = ack.packet_id();
        let Some(request) = self
            .ctx
            .sub_requests
            .lock()
            .unwrap()
            .remove(&packet_id.value())
        else {
            log::warn!("dispatcher: unexpected SUBACK for {packet_id}, dropped");
            return;
        };
        self.ctx.allocator.release(packet_id);

        if ack.reasons().len() != request.options.topics.len() {
            let _ = request.tx.send(Err(Error::new(
                crate::error::ErrorKind::ProtocolError,
                "SUBACK reason code count does not match the request",
            )));
            let _ = self
                .ctx
                .event_tx
                .send(PipelineEvent::ProtocolViolation {
                    reason_code: ReasonCode::ProtocolError,
                    message: "SUBACK cardinality mismatch".to_string(),
                })
                .await;
            return;
        }

        let mut entries = Vec::with_capacity(ack.reasons().len());
        {
            let mut registry = self.ctx.registry.lock().unwrap();
            for (topic, reason) in request.options.topics.iter().zip(ack.reasons()) {
                entries.push((topic.filter.clone(), *reason));
                let granted_qos = match reason {
                    ReasonCode::Success => QoS::AtMostOnce,
                    ReasonCode::GrantedQoS1 => QoS::AtLeastOnce,
                    ReasonCode::GrantedQoS2 => QoS::ExactOnce,
                    // Failed filters stay out of the registry.
                    _ => continue,
                };
                match SubTopic::new(&topic.filter) {
                    Ok(filter) => registry.add(Subscription::new(
                        filter,
                        granted_qos,
                        topic.no_local,
                        topic.retain_as_published,
                        topic.handler.clone(),
                    )),
                    Err(err) => {
                        log::error!("dispatcher: invalid granted filter: {err:?}");
                    }
                }
            }
        }

        let result = SubscribeResult {
            entries: entries.clone(),
            reason_string: ack.properties().reason_string().map(ToString::to_string),
        };
        let _ = request.tx.send(Ok(result));
        self.ctx.events.emit_with(EventKind::AfterSubscribe, || {
            ClientEvent::AfterSubscribe { entries }
        });
    }

    /// UNSUBACK completes the pending unsubscribe and removes settled
    /// filters from the registry.
    fn handle_unsubscribe_ack(&mut self, ack: &UnsubscribeAckPacket) {
        let packet_id = ack.packet_id();
        let Some(request) = self
            .ctx
            .unsub_requests
            .lock()
            .unwrap()
            .remove(&packet_id.value())
        else {
            log::warn!("dispatcher: unexpected UNSUBACK for {packet_id}, dropped");
            return;
        };
        self.ctx.allocator.release(packet_id);

        let mut entries = Vec::with_capacity(request.filters.len());
        {
            let mut registry = self.ctx.registry.lock().unwrap();
            for (filter, reason) in request.filters.iter().zip(ack.reasons()) {
                entries.push((filter.clone(), *reason));
                if matches!(
                    reason,
                    ReasonCode::Success | ReasonCode::NoSubscriptionExisted
                ) {
                    registry.remove(filter);
                }
            }
        }

        let result = UnsubscribeResult {
            entries: entries.clone(),
            reason_string: ack.properties().reason_string().map(ToString::to_string),
        };
        let _ = request.tx.send(Ok(result));
        self.ctx.events.emit_with(EventKind::AfterUnsubscribe, || {
            ClientEvent::AfterUnsubscribe { entries }
        });
    }

    /// Hand `message` to the matching handlers on a worker task.
    fn deliver(&self, message: PublishMessage) {
        let global: Option<MessageHandler> = self.ctx.on_message.lock().unwrap().clone();
        let matched: Vec<MessageHandler> = self
            .ctx
            .registry
            .lock()
            .unwrap()
            .matches(message.topic())
            .iter()
            .filter_map(|subscription| subscription.handler().cloned())
            .collect();
        if global.is_none() && matched.is_empty() {
            log::debug!("dispatcher: no handler for topic {}", message.topic());
            return;
        }

        let client = Client::from_context(Arc::clone(&self.ctx));
        tokio::spawn(async move {
            for handler in global.into_iter().chain(matched) {
                let client = client.clone();
                let message = message.clone();
                let outcome = catch_unwind(AssertUnwindSafe(move || handler(client, message)));
                if outcome.is_err() {
                    log::error!("dispatcher: message handler panicked");
                }
            }
        });
    }

    fn send_priority(&self, packet: Packet) {
        self.ctx.queue.push_priority(WriterCmd::Packet(packet));
    }
}
