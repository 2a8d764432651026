// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::sync::Notify;

use codec::{PacketId, PublishPacket, PublishReleasePacket, QoS};

/// A pending outbound packet tracked for acknowledgement.
///
/// The delivery state is implied by the stored packet: a `QoS` 1 publish
/// awaits PUBACK, a `QoS` 2 publish awaits PUBREC, and a release packet
/// awaits PUBCOMP.
#[derive(Debug, Clone, PartialEq)]
pub enum InflightPacket {
    /// A publish packet waiting for PUBACK (`QoS` 1) or PUBREC (`QoS` 2).
    Publish(PublishPacket),

    /// A release packet waiting for PUBCOMP.
    Release(PublishReleasePacket),
}

impl InflightPacket {
    /// Returns true if this entry is a `QoS` 2 publish waiting for PUBREC.
    #[must_use]
    pub fn awaiting_pubrec(&self) -> bool {
        matches!(self, Self::Publish(p) if p.qos() == QoS::ExactOnce)
    }
}

#[derive(Debug)]
struct Entry {
    /// Insertion order, used to re-send pending packets in their original
    /// order after session resumption.
    seq: u64,

    packet: InflightPacket,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<u16, Entry>,
    capacity: usize,
    next_seq: u64,
}

/// The table of unacknowledged outbound `QoS` 1/2 publishes, bounded by
/// the negotiated receive maximum.
///
/// [`Self::add`] suspends while the table is full; this is the only
/// backpressure mechanism the client offers to publishers.
#[derive(Debug)]
pub struct InflightTable {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InflightTable {
    /// Create a table bounded by `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                capacity,
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Update capacity, typically to `min(client receive maximum, server
    /// receive maximum)` once CONNACK has been processed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        drop(inner);
        // Growth may unblock several queued publishers.
        self.notify.notify_waiters();
    }

    /// Get current capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Get number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns true if no entry is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `packet` under `packet_id`, waiting while the table is full.
    ///
    /// Returns false when `cancel` flips to true before a slot frees up;
    /// the entry is not inserted in that case.
    pub async fn add(
        &self,
        packet_id: PacketId,
        packet: InflightPacket,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if *cancel.borrow() {
                return false;
            }
            if self.try_add(packet_id, &packet) {
                return true;
            }
            tokio::select! {
                () = self.notify.notified() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Insert `packet` under `packet_id` if a slot is free.
    fn try_add(&self, packet_id: PacketId, packet: &InflightPacket) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= inner.capacity {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            packet_id.value(),
            Entry {
                seq,
                packet: packet.clone(),
            },
        );
        true
    }

    /// Remove and return the entry under `packet_id`. Wakes one suspended
    /// [`Self::add`] caller. Idempotent.
    pub fn remove(&self, packet_id: PacketId) -> Option<InflightPacket> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.remove(&packet_id.value());
        drop(inner);
        if entry.is_some() {
            self.notify.notify_one();
        }
        entry.map(|e| e.packet)
    }

    /// Get a copy of the entry under `packet_id`.
    #[must_use]
    pub fn get(&self, packet_id: PacketId) -> Option<InflightPacket> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&packet_id.value())
            .map(|e| e.packet.clone())
    }

    /// Replace the entry under `packet_id` with `new` if the current value
    /// equals `expected`. Used when a `QoS` 2 publish transitions to its
    /// release form; the insertion order is preserved.
    pub fn try_update(
        &self,
        packet_id: PacketId,
        expected: &InflightPacket,
        new: InflightPacket,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get_mut(&packet_id.value()) {
            Some(entry) if &entry.packet == expected => {
                entry.packet = new;
                true
            }
            _ => false,
        }
    }

    /// Get all entries in insertion order, oldest first.
    #[must_use]
    pub fn snapshot_ordered(&self) -> Vec<(PacketId, InflightPacket)> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, entry)| (entry.seq, PacketId::new(*id), entry.packet.clone()))
            .collect();
        drop(inner);
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, id, packet)| (id, packet))
            .collect()
    }

    /// Remove every entry, used on clean start. Wakes all suspended
    /// [`Self::add`] callers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        drop(inner);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn publish_entry(packet_id: u16, qos: QoS) -> InflightPacket {
        let mut packet = PublishPacket::new("t", qos, b"m").unwrap();
        packet.set_packet_id(PacketId::new(packet_id));
        InflightPacket::Publish(packet)
    }

    fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let table = InflightTable::new(2);
        let (_tx, mut cancel) = cancel_channel();

        assert!(
            table
                .add(PacketId::new(1), publish_entry(1, QoS::AtLeastOnce), &mut cancel)
                .await
        );
        assert_eq!(table.len(), 1);

        let removed = table.remove(PacketId::new(1));
        assert!(removed.is_some());
        assert!(table.is_empty());

        // Idempotent.
        assert!(table.remove(PacketId::new(1)).is_none());
    }

    #[tokio::test]
    async fn test_add_blocks_at_capacity() {
        let table = Arc::new(InflightTable::new(2));
        let (_tx, mut cancel) = cancel_channel();

        assert!(
            table
                .add(PacketId::new(1), publish_entry(1, QoS::AtLeastOnce), &mut cancel)
                .await
        );
        assert!(
            table
                .add(PacketId::new(2), publish_entry(2, QoS::AtLeastOnce), &mut cancel)
                .await
        );

        let blocked = {
            let table = Arc::clone(&table);
            let (_tx2, mut cancel2) = cancel_channel();
            tokio::spawn(async move {
                table
                    .add(PacketId::new(3), publish_entry(3, QoS::AtLeastOnce), &mut cancel2)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        table.remove(PacketId::new(1));
        assert!(blocked.await.unwrap());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_add_canceled() {
        let table = Arc::new(InflightTable::new(1));
        let (tx, mut cancel) = cancel_channel();
        assert!(
            table
                .add(PacketId::new(1), publish_entry(1, QoS::AtLeastOnce), &mut cancel)
                .await
        );

        let blocked = {
            let table = Arc::clone(&table);
            let mut cancel = tx.subscribe();
            tokio::spawn(async move {
                table
                    .add(PacketId::new(2), publish_entry(2, QoS::AtLeastOnce), &mut cancel)
                    .await
            })
        };
        tokio::task::yield_now().await;

        tx.send(true).unwrap();
        assert!(!blocked.await.unwrap());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_try_update_cas() {
        let table = InflightTable::new(4);
        let (_tx, mut cancel) = cancel_channel();
        let publish = publish_entry(5, QoS::ExactOnce);
        assert!(table.add(PacketId::new(5), publish.clone(), &mut cancel).await);
        assert!(publish.awaiting_pubrec());

        let release = InflightPacket::Release(PublishReleasePacket::new(PacketId::new(5)));
        assert!(table.try_update(PacketId::new(5), &publish, release.clone()));
        assert_eq!(table.get(PacketId::new(5)), Some(release.clone()));

        // Second update with the stale expected value fails.
        assert!(!table.try_update(PacketId::new(5), &publish, release));
    }

    #[tokio::test]
    async fn test_snapshot_preserves_insertion_order() {
        let table = InflightTable::new(8);
        let (_tx, mut cancel) = cancel_channel();
        for id in [4_u16, 2, 9] {
            assert!(
                table
                    .add(PacketId::new(id), publish_entry(id, QoS::AtLeastOnce), &mut cancel)
                    .await
            );
        }
        let ids: Vec<u16> = table
            .snapshot_ordered()
            .iter()
            .map(|(id, _)| id.value())
            .collect();
        assert_eq!(ids, vec![4, 2, 9]);
    }
}
