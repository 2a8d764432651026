// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

use codec::{AuthPacket, Packet, PacketId, QoS, ReasonCode};

use crate::alias::{InboundAliasTable, OutboundAliasTable};
use crate::commands::{ClientCmd, PipelineEvent};
use crate::connect_options::ConnectOptions;
use crate::error::Error;
use crate::events::EventBus;
use crate::inflight::{InflightPacket, InflightTable};
use crate::packet_id::PacketIdAllocator;
use crate::subscription::SubscriptionRegistry;
use crate::types::{
    MessageHandler, PublishMessage, PublishResult, SubscribeOptions, SubscribeResult,
    UnsubscribeResult,
};
use crate::writer::SendQueue;

/// Hook invoked for incoming AUTH packets during enhanced authentication.
/// The returned packet, if any, is sent back to the server.
pub type AuthHandler = Arc<dyn Fn(&AuthPacket) -> Option<AuthPacket> + Send + Sync>;

/// Client side configuration the pipeline tasks need, copied out of
/// [`ConnectOptions`] at client construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub manual_ack: bool,
    pub response_timeout: Duration,
    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub maximum_packet_size: Option<u32>,
}

impl From<&ConnectOptions> for SessionConfig {
    fn from(options: &ConnectOptions) -> Self {
        Self {
            manual_ack: options.manual_ack(),
            response_timeout: options.response_timeout(),
            receive_maximum: options.receive_maximum(),
            topic_alias_maximum: options.topic_alias_maximum(),
            maximum_packet_size: options.maximum_packet_size(),
        }
    }
}

/// Parameters negotiated with the server through CONNECT/CONNACK.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Effective keep alive in seconds, after the server override.
    pub keep_alive: u16,

    /// Bound on our unacknowledged `QoS` 1/2 publishes.
    pub server_receive_maximum: u16,

    /// Largest packet the server accepts.
    pub server_maximum_packet_size: Option<u32>,

    /// Highest outbound topic alias value.
    pub server_topic_alias_maximum: u16,

    /// Highest `QoS` the server supports.
    pub maximum_qos: QoS,

    /// Whether the server stores retained messages.
    pub retain_available: bool,

    /// Granted session expiry interval in seconds.
    pub session_expiry_interval: u32,

    /// Client id assigned by the server, when ours was empty.
    pub assigned_client_id: Option<String>,

    pub wildcard_subscription_available: bool,
    pub subscription_identifier_available: bool,
    pub shared_subscription_available: bool,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self {
            keep_alive: 0,
            server_receive_maximum: u16::MAX,
            server_maximum_packet_size: None,
            server_topic_alias_maximum: 0,
            maximum_qos: QoS::ExactOnce,
            retain_available: true,
            session_expiry_interval: 0,
            assigned_client_id: None,
            wildcard_subscription_available: true,
            subscription_identifier_available: true,
            shared_subscription_available: true,
        }
    }
}

/// A pending `QoS` 1/2 publish call awaiting its terminal acknowledgement.
#[derive(Debug)]
pub struct PublishWaiter {
    /// The message as the caller published it, echoed in the result.
    pub message: PublishMessage,

    /// Completion signal; `None` once the caller timed out or went away,
    /// while the protocol obligation keeps running.
    pub tx: Option<oneshot::Sender<Result<PublishResult, Error>>>,

    /// Reason code and reason string of the PUBREC, recorded until the
    /// PUBCOMP closes the `QoS` 2 flow.
    pub pubrec: Option<(ReasonCode, Option<String>)>,
}

/// A pending subscribe call keyed by packet id.
pub struct SubscribeRequest {
    pub options: SubscribeOptions,
    pub tx: oneshot::Sender<Result<SubscribeResult, Error>>,
}

/// A pending unsubscribe call keyed by packet id.
pub struct UnsubscribeRequest {
    pub filters: Vec<String>,
    pub tx: oneshot::Sender<Result<UnsubscribeResult, Error>>,
}

/// Bookkeeping of one received `QoS` 1/2 publish in manual ack mode.
#[derive(Debug, Clone, Copy)]
pub struct ManualAckEntry {
    pub qos: QoS,

    /// The user has acknowledged; a second ack on the same id fails.
    pub acked: bool,

    /// A PUBREL arrived for this `QoS` 2 id; PUBCOMP goes out once both
    /// this and `acked` hold.
    pub rel_received: bool,
}

/// State shared between the client handle, the supervisor and the
/// pipeline tasks of one client instance.
///
/// Writers of each field are serialized through its own lock; the
/// supervisor owns the transport and the task lifecycles exclusively.
pub struct ClientContext {
    pub config: SessionConfig,
    pub allocator: PacketIdAllocator,
    pub inflight: InflightTable,
    pub queue: SendQueue,
    pub events: EventBus,

    pub publish_waiters: Mutex<HashMap<u16, PublishWaiter>>,
    pub sub_requests: Mutex<HashMap<u16, SubscribeRequest>>,
    pub unsub_requests: Mutex<HashMap<u16, UnsubscribeRequest>>,

    pub registry: Mutex<SubscriptionRegistry>,
    pub inbound_qos2: Mutex<HashSet<u16>>,
    pub manual_acks: Mutex<HashMap<u16, ManualAckEntry>>,

    pub outbound_aliases: Mutex<OutboundAliasTable>,
    pub inbound_aliases: Mutex<InboundAliasTable>,

    pub negotiated: Mutex<Negotiated>,

    /// True between a successful CONNACK and the connection going down.
    pub connected: watch::Sender<bool>,

    /// Flips to true when the session terminally shuts down; pending
    /// operations observe it and cancel.
    pub cancel: watch::Sender<bool>,

    pub cmd_tx: mpsc::Sender<ClientCmd>,
    pub event_tx: mpsc::Sender<PipelineEvent>,

    /// Instant of the last successful transport write, drives keep alive.
    pub last_write: Mutex<Instant>,

    /// Global incoming message handler.
    pub on_message: Mutex<Option<MessageHandler>>,

    /// Enhanced authentication hook.
    pub auth_handler: Mutex<Option<AuthHandler>>,
}

impl ClientContext {
    pub fn new(
        options: &ConnectOptions,
        cmd_tx: mpsc::Sender<ClientCmd>,
        event_tx: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        let config = SessionConfig::from(options);
        let receive_maximum = usize::from(config.receive_maximum);
        Self {
            config,
            allocator: PacketIdAllocator::new(),
            inflight: InflightTable::new(receive_maximum),
            queue: SendQueue::new(),
            events: EventBus::new(),
            publish_waiters: Mutex::new(HashMap::new()),
            sub_requests: Mutex::new(HashMap::new()),
            unsub_requests: Mutex::new(HashMap::new()),
            registry: Mutex::new(SubscriptionRegistry::new()),
            inbound_qos2: Mutex::new(HashSet::new()),
            manual_acks: Mutex::new(HashMap::new()),
            outbound_aliases: Mutex::new(OutboundAliasTable::new(0)),
            inbound_aliases: Mutex::new(InboundAliasTable::new(0)),
            negotiated: Mutex::new(Negotiated::default()),
            connected: watch::channel(false).0,
            cancel: watch::channel(false).0,
            cmd_tx,
            event_tx,
            last_write: Mutex::new(Instant::now()),
            on_message: Mutex::new(None),
            auth_handler: Mutex::new(None),
        }
    }

    /// Whether a CONNACK has been accepted and the connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Take a packet id which collides with no pending flow, including
    /// the server chosen ids of incoming `QoS` 2 publishes.
    pub async fn acquire_packet_id(&self) -> PacketId {
        loop {
            let packet_id = self.allocator.acquire().await;
            let clash = self
                .inbound_qos2
                .lock()
                .unwrap()
                .contains(&packet_id.value());
            if !clash {
                return packet_id;
            }
            // Put the value at the back of the pool and pick another.
            self.allocator.release(packet_id);
        }
    }

    pub fn set_connected(&self, connected: bool) {
        // send_replace updates the value even while nobody subscribes.
        self.connected.send_replace(connected);
    }

    /// Reset the per-connection tables for a fresh (re)connect attempt.
    ///
    /// Alias tables never survive a network connection; the server alias
    /// maximum becomes known once CONNACK arrives and is applied then.
    pub fn reset_connection_state(&self) {
        self.cancel.send_replace(false);
        self.outbound_aliases.lock().unwrap().reset(0);
        self.inbound_aliases
            .lock()
            .unwrap()
            .reset(self.config.topic_alias_maximum);
        *self.last_write.lock().unwrap() = Instant::now();
        // Leftovers of the previous connection would race the fresh
        // CONNECT; anything still unacknowledged is re-sent through
        // session resumption instead.
        self.queue.clear();
    }

    /// Discard every piece of session state, used when the server did not
    /// resume the session or clean start was requested.
    pub fn clear_session(&self) {
        let inflight_ids: Vec<PacketId> = self
            .inflight
            .snapshot_ordered()
            .iter()
            .map(|(id, _)| *id)
            .collect();
        self.inflight.clear();

        {
            let mut waiters = self.publish_waiters.lock().unwrap();
            for (_, waiter) in waiters.drain() {
                if let Some(tx) = waiter.tx {
                    let _ = tx.send(Err(Error::new(
                        crate::error::ErrorKind::OperationCanceled,
                        "Session state was discarded",
                    )));
                }
            }
        }
        for packet_id in inflight_ids {
            self.allocator.release(packet_id);
        }

        self.fail_pending_requests("Session state was discarded");

        self.registry.lock().unwrap().clear();
        self.inbound_qos2.lock().unwrap().clear();
        self.manual_acks.lock().unwrap().clear();
    }

    /// Fail pending subscribe and unsubscribe calls and release their
    /// packet ids.
    pub fn fail_pending_requests(&self, message: &str) {
        let mut subs = self.sub_requests.lock().unwrap();
        for (packet_id, request) in subs.drain() {
            self.allocator.release(PacketId::new(packet_id));
            let _ = request.tx.send(Err(Error::new(
                crate::error::ErrorKind::OperationCanceled,
                message,
            )));
        }
        drop(subs);

        let mut unsubs = self.unsub_requests.lock().unwrap();
        for (packet_id, request) in unsubs.drain() {
            self.allocator.release(PacketId::new(packet_id));
            let _ = request.tx.send(Err(Error::new(
                crate::error::ErrorKind::OperationCanceled,
                message,
            )));
        }
    }

    /// Cancel every pending operation; the session is going away for good.
    pub fn cancel_all(&self, message: &str) {
        self.cancel.send_replace(true);

        let mut waiters = self.publish_waiters.lock().unwrap();
        for (_, waiter) in waiters.drain() {
            if let Some(tx) = waiter.tx {
                let _ = tx.send(Err(Error::new(
                    crate::error::ErrorKind::OperationCanceled,
                    message,
                )));
            }
        }
        drop(waiters);

        self.fail_pending_requests(message);
    }

    /// Get the packets to re-send after the server resumed our session:
    /// unacknowledged publishes with DUP set, in original submission
    /// order, and release packets for flows already past PUBREC.
    #[must_use]
    pub fn resumption_packets(&self) -> (Vec<Packet>, Vec<Packet>) {
        let mut publishes = Vec::new();
        let mut releases = Vec::new();
        for (_packet_id, entry) in self.inflight.snapshot_ordered() {
            match entry {
                InflightPacket::Publish(mut packet) => {
                    // The DUP flag marks this as a re-delivery attempt.
                    if packet.set_dup(true).is_ok() {
                        publishes.push(Packet::Publish(packet));
                    }
                }
                InflightPacket::Release(packet) => {
                    releases.push(Packet::PublishRelease(packet));
                }
            }
        }
        (publishes, releases)
    }
}
