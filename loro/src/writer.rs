// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::watch;

use codec::{EncodePacket, Packet};

use crate::alias::AliasAssignment;
use crate::commands::{PipelineEvent, WriterCmd};
use crate::context::ClientContext;
use crate::events::{ClientEvent, EventKind, PacketKind};
use crate::stream::Stream;

/// The outbound queues feeding the writer task.
///
/// Acknowledgements and control packets travel on the priority queue and
/// are always written before queued publishes, so protocol obligations are
/// met even under a backlog of application traffic. The queues outlive a
/// single connection: packets queued while the transport is down are
/// written by the next connection's writer.
#[derive(Debug, Default)]
pub struct SendQueue {
    priority: Mutex<VecDeque<WriterCmd>>,
    data: Mutex<VecDeque<WriterCmd>>,
    notify: tokio::sync::Notify,
}

impl SendQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an acknowledgement or control packet.
    pub fn push_priority(&self, cmd: WriterCmd) {
        self.priority.lock().unwrap().push_back(cmd);
        self.notify.notify_one();
    }

    /// Queue a publish, subscribe or unsubscribe packet.
    pub fn push_data(&self, cmd: WriterCmd) {
        self.data.lock().unwrap().push_back(cmd);
        self.notify.notify_one();
    }

    /// Take the next command, control traffic first.
    pub async fn pop(&self) -> WriterCmd {
        loop {
            if let Some(cmd) = self.try_pop() {
                return cmd;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<WriterCmd> {
        if let Some(cmd) = self.priority.lock().unwrap().pop_front() {
            return Some(cmd);
        }
        self.data.lock().unwrap().pop_front()
    }

    /// Returns true if both queues are drained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priority.lock().unwrap().is_empty() && self.data.lock().unwrap().is_empty()
    }

    /// Drop every queued command. Flush markers are answered so waiting
    /// callers do not hang.
    pub fn clear(&self) {
        let mut dropped: Vec<WriterCmd> = Vec::new();
        dropped.extend(self.priority.lock().unwrap().drain(..));
        dropped.extend(self.data.lock().unwrap().drain(..));
        for cmd in dropped {
            if let WriterCmd::Flush(tx) = cmd {
                let _ = tx.send(());
            }
        }
    }
}

/// The writer half of one connection.
///
/// Serializes packets from the send queue onto the transport, one write
/// sequence per packet, and stamps the keep alive clock on every
/// successful write. Nothing else touches the transport for writing.
pub struct Writer {
    write_half: WriteHalf<Stream>,
    ctx: Arc<ClientContext>,
    shutdown: watch::Receiver<bool>,
}

impl Writer {
    pub fn new(
        write_half: WriteHalf<Stream>,
        ctx: Arc<ClientContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            write_half,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        log::debug!("writer: task started");
        loop {
            let cmd = tokio::select! {
                cmd = self.ctx.queue.pop() => cmd,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match cmd {
                WriterCmd::Packet(packet) => {
                    if let Err(err) = self.write_packet(packet).await {
                        log::warn!("writer: transport write failed: {err}");
                        let _ = self
                            .ctx
                            .event_tx
                            .send(PipelineEvent::TransportClosed(err))
                            .await;
                        break;
                    }
                }
                WriterCmd::Flush(tx) => {
                    let _ = tx.send(());
                }
            }
        }
        log::debug!("writer: task finished");
    }

    async fn write_packet(&mut self, mut packet: Packet) -> Result<(), crate::error::Error> {
        if let Packet::Publish(publish) = &mut packet {
            self.apply_topic_alias(publish);
        }

        let mut buf = Vec::with_capacity(128);
        packet.encode(&mut buf)?;
        self.write_half.write_all(&buf).await?;
        self.write_half.flush().await?;

        *self.ctx.last_write.lock().unwrap() = Instant::now();
        let kind = PacketKind::from(&packet);
        self.ctx
            .events
            .emit_with(EventKind::PacketSent(kind), || ClientEvent::PacketSent {
                kind,
            });
        Ok(())
    }

    /// Substitute the topic with an alias where the server accepts one.
    ///
    /// The in-flight table keeps the full topic, so a re-transmission
    /// after reconnect re-negotiates its alias from scratch.
    fn apply_topic_alias(&self, publish: &mut codec::PublishPacket) {
        if publish.topic().is_empty() {
            return;
        }
        let assignment = self
            .ctx
            .outbound_aliases
            .lock()
            .unwrap()
            .assign(publish.topic());
        match assignment {
            AliasAssignment::Disabled => (),
            AliasAssignment::Fresh(alias) => {
                publish.apply_topic_alias(alias, false);
            }
            AliasAssignment::Known(alias) => {
                publish.apply_topic_alias(alias, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::PingRequestPacket;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_send_queue_priority_first() {
        let queue = SendQueue::new();
        queue.push_data(WriterCmd::Packet(Packet::PingRequest(
            PingRequestPacket::new(),
        )));
        queue.push_priority(WriterCmd::Packet(Packet::Disconnect(
            codec::DisconnectPacket::new(),
        )));

        let first = queue.pop().await;
        assert!(matches!(
            first,
            WriterCmd::Packet(Packet::Disconnect(_))
        ));
        let second = queue.pop().await;
        assert!(matches!(second, WriterCmd::Packet(Packet::PingRequest(_))));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_send_queue_clear_answers_flush() {
        let queue = SendQueue::new();
        let (tx, rx) = oneshot::channel();
        queue.push_data(WriterCmd::Flush(tx));
        queue.clear();
        assert!(rx.await.is_ok());
    }
}
