// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use codec::{Packet, PacketType, ReasonCode};

/// Control packet kind without the publish flag bits, used to key
/// packet level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Connect,
    ConnectAck,
    Publish,
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
    Auth,
}

impl From<PacketType> for PacketKind {
    fn from(packet_type: PacketType) -> Self {
        match packet_type {
            PacketType::Connect => Self::Connect,
            PacketType::ConnectAck => Self::ConnectAck,
            PacketType::Publish { .. } => Self::Publish,
            PacketType::PublishAck => Self::PublishAck,
            PacketType::PublishReceived => Self::PublishReceived,
            PacketType::PublishRelease => Self::PublishRelease,
            PacketType::PublishComplete => Self::PublishComplete,
            PacketType::Subscribe => Self::Subscribe,
            PacketType::SubscribeAck => Self::SubscribeAck,
            PacketType::Unsubscribe => Self::Unsubscribe,
            PacketType::UnsubscribeAck => Self::UnsubscribeAck,
            PacketType::PingRequest => Self::PingRequest,
            PacketType::PingResponse => Self::PingResponse,
            PacketType::Disconnect => Self::Disconnect,
            PacketType::Auth => Self::Auth,
        }
    }
}

impl From<&Packet> for PacketKind {
    fn from(packet: &Packet) -> Self {
        Self::from(packet.packet_type())
    }
}

/// Identity of an event, the key handlers are registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeConnect,
    AfterConnect,
    BeforeDisconnect,
    AfterDisconnect,
    BeforeSubscribe,
    AfterSubscribe,
    BeforeUnsubscribe,
    AfterUnsubscribe,

    /// A control packet of this kind was written to the transport.
    PacketSent(PacketKind),

    /// A control packet of this kind arrived from the transport.
    PacketReceived(PacketKind),
}

/// Payload passed to event handlers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    BeforeConnect,
    AfterConnect {
        session_present: bool,
        reason_code: ReasonCode,
    },
    BeforeDisconnect,
    AfterDisconnect,
    BeforeSubscribe {
        filters: Vec<String>,
    },
    AfterSubscribe {
        entries: Vec<(String, ReasonCode)>,
    },
    BeforeUnsubscribe {
        filters: Vec<String>,
    },
    AfterUnsubscribe {
        entries: Vec<(String, ReasonCode)>,
    },
    PacketSent {
        kind: PacketKind,
    },
    PacketReceived {
        kind: PacketKind,
    },
}

impl ClientEvent {
    /// Get the kind this event is dispatched under.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::BeforeConnect => EventKind::BeforeConnect,
            Self::AfterConnect { .. } => EventKind::AfterConnect,
            Self::BeforeDisconnect => EventKind::BeforeDisconnect,
            Self::AfterDisconnect => EventKind::AfterDisconnect,
            Self::BeforeSubscribe { .. } => EventKind::BeforeSubscribe,
            Self::AfterSubscribe { .. } => EventKind::AfterSubscribe,
            Self::BeforeUnsubscribe { .. } => EventKind::BeforeUnsubscribe,
            Self::AfterUnsubscribe { .. } => EventKind::AfterUnsubscribe,
            Self::PacketSent { kind } => EventKind::PacketSent(*kind),
            Self::PacketReceived { kind } => EventKind::PacketReceived(*kind),
        }
    }
}

/// Callback registered for an event.
pub type EventHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Fan-out of lifecycle and packet observation events.
///
/// Handlers run on a spawned worker task, in registration order, never on
/// the reader or dispatcher. A panicking handler is caught and logged;
/// later handlers still run and the originating operation is unaffected.
/// When no handler is registered for an event the emission is a single
/// map lookup and no payload is built.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<EventHandler>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let handlers = self.handlers.lock().unwrap();
        f.debug_struct("EventBus")
            .field("events", &handlers.len())
            .finish()
    }
}

impl EventBus {
    /// Create an empty event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Handlers of one event run in
    /// registration order.
    pub fn register(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.entry(kind).or_default().push(handler);
    }

    /// Remove every handler of `kind`.
    pub fn unregister(&self, kind: EventKind) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.remove(&kind);
    }

    /// Returns true if a handler is registered for `kind`.
    #[must_use]
    pub fn has_handlers(&self, kind: EventKind) -> bool {
        let handlers = self.handlers.lock().unwrap();
        handlers.get(&kind).map_or(false, |list| !list.is_empty())
    }

    /// Emit the event built by `make` to all handlers of `kind`.
    ///
    /// `make` is only called when at least one handler is registered, so
    /// the unobserved path stays free of allocations.
    pub fn emit_with<F>(&self, kind: EventKind, make: F)
    where
        F: FnOnce() -> ClientEvent,
    {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&kind) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return,
            }
        };

        let event = make();
        tokio::spawn(async move {
            for handler in snapshot {
                let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
                if result.is_err() {
                    log::error!("Event handler for {:?} panicked", event.kind());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            bus.register(
                EventKind::BeforeConnect,
                Arc::new(move |_event| {
                    order.lock().unwrap().push(tag);
                }),
            );
        }
        bus.emit_with(EventKind::BeforeConnect, || ClientEvent::BeforeConnect);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(
            EventKind::AfterDisconnect,
            Arc::new(|_event| panic!("boom")),
        );
        {
            let count = Arc::clone(&count);
            bus.register(
                EventKind::AfterDisconnect,
                Arc::new(move |_event| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        bus.emit_with(EventKind::AfterDisconnect, || ClientEvent::AfterDisconnect);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_handler_is_no_op() {
        let bus = EventBus::new();
        // The payload closure must not run without handlers.
        bus.emit_with(EventKind::BeforeConnect, || {
            panic!("payload must not be built")
        });
        sleep(Duration::from_millis(10)).await;
    }
}
