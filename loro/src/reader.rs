// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, watch};

use codec::{Packet, ReasonCode};

use crate::commands::PipelineEvent;
use crate::context::ClientContext;
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;

/// The reader half of one connection.
///
/// Owns a rolling buffer, frames packets out of the raw byte stream and
/// forwards them to the dispatcher in arrival order. The transport may
/// chunk bytes arbitrarily; a partial packet simply waits for the next
/// read. Nothing else touches the transport for reading.
pub struct Reader {
    read_half: ReadHalf<Stream>,
    packet_tx: mpsc::Sender<Packet>,
    ctx: Arc<ClientContext>,
    shutdown: watch::Receiver<bool>,
    buffer: BytesMut,
}

impl Reader {
    pub fn new(
        read_half: ReadHalf<Stream>,
        packet_tx: mpsc::Sender<Packet>,
        ctx: Arc<ClientContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            read_half,
            packet_tx,
            ctx,
            shutdown,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub async fn run(mut self) {
        log::debug!("reader: task started");
        loop {
            tokio::select! {
                n_read = self.read_half.read_buf(&mut self.buffer) => {
                    match n_read {
                        Ok(0) => {
                            log::info!("reader: connection closed by peer");
                            let _ = self
                                .ctx
                                .event_tx
                                .send(PipelineEvent::TransportClosed(Error::new(
                                    ErrorKind::Closed,
                                    "Connection closed by peer",
                                )))
                                .await;
                            break;
                        }
                        Ok(_) => {
                            if !self.drain_buffer().await {
                                break;
                            }
                        }
                        Err(err) => {
                            log::warn!("reader: transport read failed: {err}");
                            let _ = self
                                .ctx
                                .event_tx
                                .send(PipelineEvent::TransportClosed(err.into()))
                                .await;
                            break;
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("reader: task finished");
    }

    /// Frame and forward every complete packet in the buffer. Returns
    /// false when the connection must go down.
    async fn drain_buffer(&mut self) -> bool {
        loop {
            // Reject oversized packets before decoding the body; the
            // server ignored our maximum packet size and gets a
            // protocol error disconnect.
            match Packet::frame_length(&self.buffer) {
                Ok(Some(frame_length)) => {
                    if let Some(maximum) = self.ctx.config.maximum_packet_size {
                        if frame_length > maximum as usize {
                            let _ = self
                                .ctx
                                .event_tx
                                .send(PipelineEvent::ProtocolViolation {
                                    reason_code: ReasonCode::PacketTooLarge,
                                    message: format!(
                                        "Incoming packet of {frame_length} bytes exceeds maximum"
                                    ),
                                })
                                .await;
                            return false;
                        }
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    let _ = self
                        .ctx
                        .event_tx
                        .send(PipelineEvent::ProtocolViolation {
                            reason_code: ReasonCode::MalformedPacket,
                            message: format!("Invalid packet length: {err:?}"),
                        })
                        .await;
                    return false;
                }
            }

            match Packet::try_decode(&self.buffer) {
                Ok(Some((packet, n_consumed))) => {
                    self.buffer.advance(n_consumed);
                    if self.packet_tx.send(packet).await.is_err() {
                        // Dispatcher is gone; the connection is coming down.
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    log::error!("reader: malformed packet: {err:?}");
                    let _ = self
                        .ctx
                        .event_tx
                        .send(PipelineEvent::ProtocolViolation {
                            reason_code: ReasonCode::MalformedPacket,
                            message: format!("Malformed packet: {err:?}"),
                        })
                        .await;
                    return false;
                }
            }
        }
    }
}
