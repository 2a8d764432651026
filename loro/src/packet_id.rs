// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use codec::PacketId;

/// State protected by the allocator lock.
#[derive(Debug)]
struct Pool {
    /// Next id which has never been handed out. Ids start at 1; 0 is not
    /// a valid packet id on the wire.
    next_fresh: u32,

    /// Released ids, reused in release order.
    recycled: VecDeque<u16>,

    /// Number of ids currently handed out.
    in_use: usize,
}

/// Issues unique packet identifiers in 1..=65535.
///
/// Released ids are reused first-in first-out, so an id is only seen again
/// after every other released id has been reused once. [`Self::acquire`]
/// suspends when all 65535 ids are in flight and resumes when one is
/// released; liveness depends solely on the peer acknowledging.
#[derive(Debug)]
pub struct PacketIdAllocator {
    pool: Mutex<Pool>,
    notify: Notify,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    /// Create a new allocator with every id free.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Pool {
                next_fresh: 1,
                recycled: VecDeque::new(),
                in_use: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Take an unused packet id, waiting when all ids are in flight.
    pub async fn acquire(&self) -> PacketId {
        loop {
            if let Some(packet_id) = self.try_acquire() {
                return packet_id;
            }
            self.notify.notified().await;
        }
    }

    /// Take an unused packet id, or `None` when all ids are in flight.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PacketId> {
        let mut pool = self.pool.lock().unwrap();
        let value = if let Some(value) = pool.recycled.pop_front() {
            value
        } else if pool.next_fresh <= u32::from(u16::MAX) {
            #[allow(clippy::cast_possible_truncation)]
            let value = pool.next_fresh as u16;
            pool.next_fresh += 1;
            value
        } else {
            return None;
        };
        pool.in_use += 1;
        Some(PacketId::new(value))
    }

    /// Return `packet_id` to the pool and wake one waiting caller.
    pub fn release(&self, packet_id: PacketId) {
        debug_assert_ne!(packet_id.value(), 0);
        let mut pool = self.pool.lock().unwrap();
        pool.recycled.push_back(packet_id.value());
        pool.in_use = pool.in_use.saturating_sub(1);
        drop(pool);
        self.notify.notify_one();
    }

    /// Get number of ids currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.pool.lock().unwrap().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_returns_distinct_ids() {
        let allocator = PacketIdAllocator::new();
        let first = allocator.acquire().await;
        let second = allocator.acquire().await;
        let third = allocator.acquire().await;
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
        assert_eq!(third.value(), 3);
        assert_eq!(allocator.in_use(), 3);
    }

    #[tokio::test]
    async fn test_release_is_fifo() {
        let allocator = PacketIdAllocator::new();
        let first = allocator.acquire().await;
        let second = allocator.acquire().await;
        allocator.release(second);
        allocator.release(first);

        // Fresh ids are exhausted only after 65535 allocations, so force
        // reuse by draining the fresh counter first.
        for _ in 3..=u16::MAX {
            let _id = allocator.acquire().await;
        }
        let reused = allocator.acquire().await;
        assert_eq!(reused, second);
        let reused = allocator.acquire().await;
        assert_eq!(reused, first);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let allocator = Arc::new(PacketIdAllocator::new());
        for _ in 1..=u16::MAX {
            let _id = allocator.acquire().await;
        }
        assert!(allocator.try_acquire().is_none());

        let waiter = {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move { allocator.acquire().await })
        };
        tokio::task::yield_now().await;

        allocator.release(PacketId::new(77));
        let packet_id = waiter.await.unwrap();
        assert_eq!(packet_id.value(), 77);
    }
}
