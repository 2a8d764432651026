// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    AuthPacket, ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket,
    DisconnectPacket, EncodeError, EncodePacket, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};

/// A decoded MQTT Control Packet of any type.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl Packet {
    /// Get packet type of inner packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnectAck(_) => PacketType::ConnectAck,
            Self::Publish(p) => PacketType::Publish {
                dup: p.dup(),
                qos: p.qos(),
                retain: p.retain(),
            },
            Self::PublishAck(_) => PacketType::PublishAck,
            Self::PublishReceived(_) => PacketType::PublishReceived,
            Self::PublishRelease(_) => PacketType::PublishRelease,
            Self::PublishComplete(_) => PacketType::PublishComplete,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubscribeAck(_) => PacketType::SubscribeAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubscribeAck(_) => PacketType::UnsubscribeAck,
            Self::PingRequest(_) => PacketType::PingRequest,
            Self::PingResponse(_) => PacketType::PingResponse,
            Self::Disconnect(_) => PacketType::Disconnect,
            Self::Auth(_) => PacketType::Auth,
        }
    }

    /// Try to decode one complete packet from the head of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a packet; no bytes
    /// are consumed and the caller reads more data. On success returns the
    /// packet and the number of bytes it occupied; the caller drops that
    /// many bytes from the head of its buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the head of `buf` is not a well-formed packet.
    pub fn try_decode(buf: &[u8]) -> Result<Option<(Self, usize)>, DecodeError> {
        let Some(total_bytes) = Self::frame_length(buf)? else {
            return Ok(None);
        };

        let mut ba = ByteArray::new(&buf[..total_bytes]);
        let packet = match PacketType::try_from(buf[0])? {
            PacketType::Connect => Self::Connect(ConnectPacket::decode(&mut ba)?),
            PacketType::ConnectAck => Self::ConnectAck(ConnectAckPacket::decode(&mut ba)?),
            PacketType::Publish { .. } => Self::Publish(PublishPacket::decode(&mut ba)?),
            PacketType::PublishAck => Self::PublishAck(PublishAckPacket::decode(&mut ba)?),
            PacketType::PublishReceived => {
                Self::PublishReceived(PublishReceivedPacket::decode(&mut ba)?)
            }
            PacketType::PublishRelease => {
                Self::PublishRelease(PublishReleasePacket::decode(&mut ba)?)
            }
            PacketType::PublishComplete => {
                Self::PublishComplete(PublishCompletePacket::decode(&mut ba)?)
            }
            PacketType::Subscribe => Self::Subscribe(SubscribePacket::decode(&mut ba)?),
            PacketType::SubscribeAck => Self::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?),
            PacketType::Unsubscribe => Self::Unsubscribe(UnsubscribePacket::decode(&mut ba)?),
            PacketType::UnsubscribeAck => {
                Self::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?)
            }
            PacketType::PingRequest => Self::PingRequest(PingRequestPacket::decode(&mut ba)?),
            PacketType::PingResponse => Self::PingResponse(PingResponsePacket::decode(&mut ba)?),
            PacketType::Disconnect => Self::Disconnect(DisconnectPacket::decode(&mut ba)?),
            PacketType::Auth => Self::Auth(AuthPacket::decode(&mut ba)?),
        };
        Ok(Some((packet, total_bytes)))
    }

    /// Get total byte length of the packet at the head of `buf`, or `None`
    /// when the fixed header itself is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns error if the Remaining Length field is invalid.
    pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Parse the Remaining Length field byte by byte so that a partial
        // Variable Byte Integer reports "need more" instead of an error.
        let mut remaining_length: usize = 0;
        let mut multiplier: usize = 1;
        let mut idx = 1;
        loop {
            if idx > 4 {
                return Err(DecodeError::InvalidVarInt);
            }
            let Some(&byte) = buf.get(idx) else {
                return Ok(None);
            };
            remaining_length += (byte as usize & 0x7f) * multiplier;
            multiplier *= 128;
            idx += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let total_bytes = idx + remaining_length;
        if buf.len() < total_bytes {
            return Ok(None);
        }
        Ok(Some(total_bytes))
    }
}

impl EncodePacket for Packet {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
            Self::Auth(p) => p.encode(buf),
        }
    }
}

impl From<PublishPacket> for Packet {
    fn from(packet: PublishPacket) -> Self {
        Self::Publish(packet)
    }
}

impl From<PublishAckPacket> for Packet {
    fn from(packet: PublishAckPacket) -> Self {
        Self::PublishAck(packet)
    }
}

impl From<PublishReceivedPacket> for Packet {
    fn from(packet: PublishReceivedPacket) -> Self {
        Self::PublishReceived(packet)
    }
}

impl From<PublishReleasePacket> for Packet {
    fn from(packet: PublishReleasePacket) -> Self {
        Self::PublishRelease(packet)
    }
}

impl From<PublishCompletePacket> for Packet {
    fn from(packet: PublishCompletePacket) -> Self {
        Self::PublishComplete(packet)
    }
}

impl From<ConnectPacket> for Packet {
    fn from(packet: ConnectPacket) -> Self {
        Self::Connect(packet)
    }
}

impl From<SubscribePacket> for Packet {
    fn from(packet: SubscribePacket) -> Self {
        Self::Subscribe(packet)
    }
}

impl From<UnsubscribePacket> for Packet {
    fn from(packet: UnsubscribePacket) -> Self {
        Self::Unsubscribe(packet)
    }
}

impl From<PingRequestPacket> for Packet {
    fn from(packet: PingRequestPacket) -> Self {
        Self::PingRequest(packet)
    }
}

impl From<DisconnectPacket> for Packet {
    fn from(packet: DisconnectPacket) -> Self {
        Self::Disconnect(packet)
    }
}

impl From<AuthPacket> for Packet {
    fn from(packet: AuthPacket) -> Self {
        Self::Auth(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_try_decode_need_more() {
        // Empty buffer.
        assert_eq!(Packet::try_decode(&[]), Ok(None));

        // Type byte only.
        assert_eq!(Packet::try_decode(&[0x30]), Ok(None));

        // Remaining length claims more bytes than present.
        assert_eq!(Packet::try_decode(&[0xc0]), Ok(None));
        let partial = [0x40, 0x02, 0x00];
        assert_eq!(Packet::try_decode(&partial), Ok(None));

        // Partial Variable Byte Integer in the remaining length.
        let partial = [0x30, 0x80];
        assert_eq!(Packet::try_decode(&partial), Ok(None));
    }

    #[test]
    fn test_try_decode_single_packet() {
        let mut buf = Vec::new();
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"xy").unwrap();
        packet.encode(&mut buf).unwrap();
        let len = buf.len();
        // Trailing bytes of the next packet do not confuse the decoder.
        buf.push(0xc0);

        let (decoded, consumed) = Packet::try_decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, len);
        assert_eq!(decoded, Packet::Publish(packet));
    }

    #[test]
    fn test_try_decode_consecutive_packets() {
        let mut buf = Vec::new();
        let first = PublishAckPacket::new(PacketId::new(1));
        first.encode(&mut buf).unwrap();
        let second = PingRequestPacket::new();
        second.encode(&mut buf).unwrap();

        let (decoded, consumed) = Packet::try_decode(&buf).unwrap().unwrap();
        assert_eq!(decoded, Packet::PublishAck(first));
        let (decoded, rest) = Packet::try_decode(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(decoded, Packet::PingRequest(second));
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_try_decode_invalid_var_int() {
        let buf = [0x30, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(
            Packet::try_decode(&buf),
            Err(DecodeError::InvalidVarInt)
        );
    }

    #[test]
    fn test_try_decode_rejects_unknown_type() {
        // Packet type 0 is forbidden.
        let buf = [0x00, 0x00];
        assert_eq!(
            Packet::try_decode(&buf),
            Err(DecodeError::InvalidPacketType)
        );
    }
}
