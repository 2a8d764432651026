// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::error::Elapsed;

use codec::{DecodeError, EncodeError, ReasonCode, TopicError};

/// Represent the types of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer sent a malformed or unexpected packet, or violated the
    /// protocol in some other way.
    ProtocolError,

    /// Failed to serialize a packet.
    EncodeError,

    /// The server actively refused the connection.
    ConnectionRefused,

    /// TLS handshake or certificate error.
    TlsError,

    /// The proxy refused or broke the tunnel.
    ProxyError,

    /// The server address could not be resolved or reached.
    Unreachable,

    /// The connection was closed, by the peer or locally.
    Closed,

    /// Other socket level error.
    SocketError,

    /// The expected response did not arrive within the configured window.
    OperationTimedOut,

    /// The operation was canceled, by the user or by the connection
    /// supervisor shutting the session down.
    OperationCanceled,

    /// The outgoing packet exceeds the maximum packet size the server
    /// accepts. The packet was not sent.
    PacketTooLarge,

    /// Topic or topic filter violates the MQTT validation rules.
    InvalidTopicFilter,

    /// The server answered with a reason code of 0x80 or greater.
    BrokerRejected,

    /// Manual acknowledgement failure: double ack, unknown packet id, or
    /// manual ack mode is not enabled.
    ManualAckError,

    /// Unsubscribing a filter which is not in the subscription registry.
    NoSuchSubscription,

    /// Operation requires an established connection.
    NotConnected,

    /// Invalid option value.
    ConfigError,

    /// Internal channel error, a pipeline task went away.
    ChannelError,
}

/// Error type of this library, a kind plus a detail message.
#[derive(Debug, Clone)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,

    /// Reason code from the server, for `BrokerRejected` errors.
    reason_code: Option<ReasonCode>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
            reason_code: None,
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            reason_code: None,
        }
    }

    /// Create a `BrokerRejected` error from a reason code sent by the server.
    #[must_use]
    pub fn broker_rejected(reason_code: ReasonCode, context: &str) -> Self {
        Self {
            kind: ErrorKind::BrokerRejected,
            message: format!("{context} rejected with {reason_code:?}"),
            reason_code: Some(reason_code),
        }
    }

    /// Get kind of current error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get detail message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get reason code the server answered with, if any.
    #[must_use]
    pub const fn reason_code(&self) -> Option<ReasonCode> {
        self.reason_code
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => ErrorKind::Unreachable,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Closed,
            _ => ErrorKind::SocketError,
        };
        Self::from_string(kind, format!("IoError {err}"))
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Self::from_string(ErrorKind::ProtocolError, format!("Decode error: {err:?}"))
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("Encode error: {err:?}"))
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        Self::from_string(
            ErrorKind::InvalidTopicFilter,
            format!("Invalid topic: {err:?}"),
        )
    }
}

impl From<Elapsed> for Error {
    fn from(_err: Elapsed) -> Self {
        Self::new(
            ErrorKind::OperationTimedOut,
            "No response within the configured timeout",
        )
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_err: oneshot::error::RecvError) -> Self {
        Self::new(
            ErrorKind::OperationCanceled,
            "Pending operation was dropped by the session",
        )
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_err: mpsc::error::SendError<T>) -> Self {
        Self::new(ErrorKind::ChannelError, "Receiver task has terminated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);

        let err = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_broker_rejected_keeps_reason_code() {
        let err = Error::broker_rejected(ReasonCode::NotAuthorized, "CONNECT");
        assert_eq!(err.kind(), ErrorKind::BrokerRejected);
        assert_eq!(err.reason_code(), Some(ReasonCode::NotAuthorized));
    }
}
