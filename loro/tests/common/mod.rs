// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! A small in-process MQTT 5.0 server driving the client under test over
//! real TCP sockets.
//!
//! It implements just enough of the server side: sessions keyed by client
//! id, subscription routing with wildcard matching, both directions of
//! the `QoS` 1/2 exchanges, topic alias resolution and ping. Tests
//! observe the wire through [`BrokerStats`] and steer edge cases through
//! [`BrokerConfig`].

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use codec::{
    ConnectAckPacket, EncodePacket, Packet, PacketId, PingResponsePacket, Properties, Property,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, QoS, ReasonCode, SubTopic, SubscribeAckPacket, U16Data,
    UnsubscribeAckPacket,
};

/// Tunables of the test server.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Refuse every CONNECT with this reason code.
    pub reject_connect: Option<ReasonCode>,

    /// Kill the connection, without DISCONNECT, after sending this many
    /// `QoS` 1 acknowledgements. Applies to the first connection only.
    pub drop_after_acks: Option<usize>,

    /// Topic Alias Maximum advertised in CONNACK.
    pub topic_alias_maximum: u16,

    /// Receive Maximum advertised in CONNACK.
    pub receive_maximum: Option<u16>,

    /// Keep Alive override advertised in CONNACK.
    pub server_keep_alive: Option<u16>,
}

/// Counters and traces the tests assert on.
#[derive(Debug, Default)]
pub struct BrokerStats {
    /// PINGREQ packets answered.
    pub pingreq_count: usize,

    /// `QoS` 1 acknowledgements sent to publishers.
    pub puback_sent: usize,

    /// PUBACK packets received from subscribers.
    pub puback_received: usize,

    /// PUBCOMP packets received from publishers, closing `QoS` 2 flows.
    pub pubcomp_received: usize,

    /// Topic names exactly as they appeared on the wire, before alias
    /// resolution. Empty string means the publish relied on its alias.
    pub wire_topics: Vec<String>,

    /// Topic names after alias resolution.
    pub resolved_topics: Vec<String>,

    /// DUP flags of received publishes, in arrival order.
    pub publish_dup_flags: Vec<bool>,
}

/// One active subscription registered with the routing table.
struct SubscriptionEntry {
    conn_id: u64,
    filter: SubTopic,
    qos: QoS,
    forward_tx: mpsc::UnboundedSender<(String, Vec<u8>, QoS)>,
}

/// State shared between all connections of the broker.
struct BrokerShared {
    config: BrokerConfig,
    stats: Mutex<BrokerStats>,
    sessions: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    next_conn_id: AtomicU64,
    dropped_once: AtomicBool,
}

/// The test server handle.
pub struct TestBroker {
    pub port: u16,
    shared: Arc<BrokerShared>,
}

impl TestBroker {
    /// Bind an ephemeral port and start serving.
    pub async fn start(config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(BrokerShared {
            config,
            stats: Mutex::new(BrokerStats::default()),
            sessions: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            dropped_once: AtomicBool::new(false),
        });

        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _addr)) = listener.accept().await else {
                        break;
                    };
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        Connection::new(socket, shared).run().await;
                    });
                }
            });
        }

        Self { port, shared }
    }

    /// Snapshot a value out of the stats.
    pub fn with_stats<T>(&self, read: impl FnOnce(&BrokerStats) -> T) -> T {
        let stats = self.shared.stats.lock().unwrap();
        read(&stats)
    }

    /// Number of registered subscriptions, across all connections.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().unwrap().len()
    }
}

/// Server side of one client connection.
struct Connection {
    socket: TcpStream,
    shared: Arc<BrokerShared>,
    conn_id: u64,
    buffer: BytesMut,

    forward_tx: mpsc::UnboundedSender<(String, Vec<u8>, QoS)>,
    forward_rx: mpsc::UnboundedReceiver<(String, Vec<u8>, QoS)>,

    /// Packet ids of client `QoS` 2 publishes between PUBREC and PUBREL.
    inbound_qos2: HashSet<u16>,

    /// Topic alias bindings announced by the client.
    aliases: HashMap<u16, String>,

    /// Next packet id for publishes forwarded to this subscriber.
    next_packet_id: u16,

    /// `QoS` 1 acks sent on this connection, for `drop_after_acks`.
    acks_sent: usize,
}

impl Connection {
    fn new(socket: TcpStream, shared: Arc<BrokerShared>) -> Self {
        let conn_id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        Self {
            socket,
            shared,
            conn_id,
            buffer: BytesMut::with_capacity(4096),
            forward_tx,
            forward_rx,
            inbound_qos2: HashSet::new(),
            aliases: HashMap::new(),
            next_packet_id: 1,
            acks_sent: 0,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                n_read = self.socket.read_buf(&mut self.buffer) => {
                    match n_read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if !self.drain_packets().await {
                                break;
                            }
                        }
                    }
                }
                forward = self.forward_rx.recv() => {
                    let Some((topic, payload, qos)) = forward else {
                        break;
                    };
                    if !self.forward_publish(&topic, &payload, qos).await {
                        break;
                    }
                }
            }
        }

        // Connection gone: unregister its subscriptions.
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .retain(|entry| entry.conn_id != self.conn_id);
    }

    async fn drain_packets(&mut self) -> bool {
        loop {
            match Packet::try_decode(&self.buffer) {
                Ok(Some((packet, n_consumed))) => {
                    self.buffer.advance(n_consumed);
                    if !self.handle_packet(packet).await {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    eprintln!("test broker: malformed packet: {err:?}");
                    return false;
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> bool {
        match packet {
            Packet::Connect(connect) => {
                if let Some(reason_code) = self.shared.config.reject_connect {
                    let ack = ConnectAckPacket::new(false, reason_code);
                    let _ = self.write_packet(&Packet::ConnectAck(ack)).await;
                    return false;
                }

                let session_present = {
                    let mut sessions = self.shared.sessions.lock().unwrap();
                    let known = sessions.contains(connect.client_id());
                    sessions.insert(connect.client_id().to_string());
                    known && !connect.clean_start()
                };

                let mut ack = ConnectAckPacket::new(session_present, ReasonCode::Success);
                let properties = self.connack_properties();
                *ack.mut_properties() = properties;
                self.write_packet(&Packet::ConnectAck(ack)).await
            }
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PublishRelease(rel) => {
                let known = self.inbound_qos2.remove(&rel.packet_id().value());
                let mut comp = PublishCompletePacket::new(rel.packet_id());
                if !known {
                    comp.set_reason_code(ReasonCode::PacketIdentifierNotFound);
                }
                self.write_packet(&Packet::PublishComplete(comp)).await
            }
            Packet::PublishAck(_ack) => {
                self.shared.stats.lock().unwrap().puback_received += 1;
                true
            }
            Packet::PublishReceived(ack) => {
                // Subscriber QoS 2 flow: answer with PUBREL.
                let rel = PublishReleasePacket::new(ack.packet_id());
                self.write_packet(&Packet::PublishRelease(rel)).await
            }
            Packet::PublishComplete(_comp) => {
                self.shared.stats.lock().unwrap().pubcomp_received += 1;
                true
            }
            Packet::Subscribe(subscribe) => {
                let mut reasons = Vec::new();
                {
                    let mut subscriptions = self.shared.subscriptions.lock().unwrap();
                    for topic in subscribe.topics() {
                        let filter = SubTopic::new(topic.filter()).unwrap();
                        subscriptions.push(SubscriptionEntry {
                            conn_id: self.conn_id,
                            filter,
                            qos: topic.qos(),
                            forward_tx: self.forward_tx.clone(),
                        });
                        reasons.push(match topic.qos() {
                            QoS::AtMostOnce => ReasonCode::Success,
                            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
                            QoS::ExactOnce => ReasonCode::GrantedQoS2,
                        });
                    }
                }
                let ack = SubscribeAckPacket::with_reasons(subscribe.packet_id(), reasons);
                self.write_packet(&Packet::SubscribeAck(ack)).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                let mut reasons = Vec::new();
                {
                    let mut subscriptions = self.shared.subscriptions.lock().unwrap();
                    for topic in unsubscribe.topics() {
                        let before = subscriptions.len();
                        subscriptions.retain(|entry| {
                            entry.conn_id != self.conn_id
                                || entry.filter.as_ref() != topic.as_ref()
                        });
                        reasons.push(if subscriptions.len() == before {
                            ReasonCode::NoSubscriptionExisted
                        } else {
                            ReasonCode::Success
                        });
                    }
                }
                let ack = UnsubscribeAckPacket::with_reasons(unsubscribe.packet_id(), reasons);
                self.write_packet(&Packet::UnsubscribeAck(ack)).await
            }
            Packet::PingRequest(_ping) => {
                self.shared.stats.lock().unwrap().pingreq_count += 1;
                self.write_packet(&Packet::PingResponse(PingResponsePacket::new()))
                    .await
            }
            Packet::Disconnect(_disconnect) => false,
            other => {
                eprintln!("test broker: unexpected packet {other:?}");
                false
            }
        }
    }

    async fn handle_publish(&mut self, publish: PublishPacket) -> bool {
        // Alias resolution, remembering what crossed the wire.
        let topic = if let Some(alias) = publish.properties().topic_alias() {
            if publish.topic().is_empty() {
                match self.aliases.get(&alias) {
                    Some(topic) => topic.clone(),
                    None => return false,
                }
            } else {
                self.aliases.insert(alias, publish.topic().to_string());
                publish.topic().to_string()
            }
        } else if publish.topic().is_empty() {
            return false;
        } else {
            publish.topic().to_string()
        };

        {
            let mut stats = self.shared.stats.lock().unwrap();
            stats.wire_topics.push(publish.topic().to_string());
            stats.resolved_topics.push(topic.clone());
            stats.publish_dup_flags.push(publish.dup());
        }

        // Route to matching subscribers.
        let mut matched = false;
        {
            let subscriptions = self.shared.subscriptions.lock().unwrap();
            for entry in subscriptions.iter() {
                if entry.filter.is_match(&topic) {
                    matched = true;
                    let qos = publish.qos().min(entry.qos);
                    let _ = entry
                        .forward_tx
                        .send((topic.clone(), publish.message().to_vec(), qos));
                }
            }
        }

        match publish.qos() {
            QoS::AtMostOnce => true,
            QoS::AtLeastOnce => {
                let mut ack = PublishAckPacket::new(publish.packet_id());
                if !matched {
                    ack.set_reason_code(ReasonCode::NoMatchingSubscribers);
                }
                if !self.write_packet(&Packet::PublishAck(ack)).await {
                    return false;
                }
                self.shared.stats.lock().unwrap().puback_sent += 1;
                self.acks_sent += 1;
                if let Some(limit) = self.shared.config.drop_after_acks {
                    if self.acks_sent >= limit
                        && !self.shared.dropped_once.swap(true, Ordering::SeqCst)
                    {
                        // Simulated network failure.
                        return false;
                    }
                }
                true
            }
            QoS::ExactOnce => {
                self.inbound_qos2.insert(publish.packet_id().value());
                let mut ack = PublishReceivedPacket::new(publish.packet_id());
                if !matched {
                    ack.set_reason_code(ReasonCode::NoMatchingSubscribers);
                }
                self.write_packet(&Packet::PublishReceived(ack)).await
            }
        }
    }

    async fn forward_publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> bool {
        let mut packet = PublishPacket::new(topic, qos, payload).unwrap();
        if qos != QoS::AtMostOnce {
            packet.set_packet_id(PacketId::new(self.next_packet_id));
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        }
        self.write_packet(&Packet::Publish(packet)).await
    }

    fn connack_properties(&self) -> Properties {
        let mut properties = Properties::new();
        if self.shared.config.topic_alias_maximum > 0 {
            properties.push(Property::TopicAliasMaximum(U16Data::new(
                self.shared.config.topic_alias_maximum,
            )));
        }
        if let Some(receive_maximum) = self.shared.config.receive_maximum {
            properties.push(Property::ReceiveMaximum(U16Data::new(receive_maximum)));
        }
        if let Some(keep_alive) = self.shared.config.server_keep_alive {
            properties.push(Property::ServerKeepAlive(U16Data::new(keep_alive)));
        }
        properties
    }

    async fn write_packet(&mut self, packet: &Packet) -> bool {
        let mut buf = Vec::with_capacity(128);
        if packet.encode(&mut buf).is_err() {
            return false;
        }
        self.socket.write_all(&buf).await.is_ok()
    }
}

/// Read one packet from a raw socket, for tests acting as the server
/// themselves.
pub async fn read_packet(socket: &mut TcpStream, buffer: &mut BytesMut) -> Packet {
    loop {
        if let Some((packet, n_consumed)) = Packet::try_decode(buffer).unwrap() {
            buffer.advance(n_consumed);
            return packet;
        }
        let n_read = socket.read_buf(buffer).await.unwrap();
        assert!(n_read > 0, "connection closed while expecting a packet");
    }
}

/// Write one packet to a raw socket.
pub async fn write_packet(socket: &mut TcpStream, packet: &Packet) {
    let mut buf = Vec::with_capacity(128);
    packet.encode(&mut buf).unwrap();
    socket.write_all(&buf).await.unwrap();
}
