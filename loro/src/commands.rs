// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use tokio::sync::oneshot;

use codec::{AuthPacket, ConnectAckPacket, DisconnectPacket, Packet, ReasonCode};

use crate::error::Error;
use crate::types::ConnectResult;

/// Requests from the client handle to the connection supervisor.
#[derive(Debug)]
pub enum ClientCmd {
    /// Establish the session and answer with the CONNACK outcome.
    Connect {
        tx: oneshot::Sender<Result<ConnectResult, Error>>,
    },

    /// Gracefully shut the session down. Answers true when a DISCONNECT
    /// was sent and the transport closed, false when already disconnected.
    Disconnect {
        tx: oneshot::Sender<Result<bool, Error>>,
    },
}

/// Notifications from the pipeline tasks to the connection supervisor.
#[derive(Debug)]
pub enum PipelineEvent {
    /// The dispatcher saw the CONNACK of the current connect attempt.
    ConnectAckReceived(Box<ConnectAckPacket>),

    /// A PINGRESP arrived; the keep alive watchdog is satisfied.
    PingResponseReceived,

    /// The server is closing the connection.
    DisconnectReceived(Box<DisconnectPacket>),

    /// An AUTH packet arrived, to be handled by the enhanced
    /// authentication hook.
    AuthReceived(Box<AuthPacket>),

    /// The peer violated the protocol; the supervisor answers with a
    /// DISCONNECT carrying `reason_code` and drops the connection.
    ProtocolViolation {
        reason_code: ReasonCode,
        message: String,
    },

    /// The transport failed or was closed by the peer.
    TransportClosed(Error),
}

/// Items travelling through the send queue to the writer task.
#[derive(Debug)]
pub enum WriterCmd {
    /// Serialize and write one packet.
    Packet(Packet),

    /// Marker answered when every item queued before it has been written.
    Flush(oneshot::Sender<()>),
}
