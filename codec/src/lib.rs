// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! Wire format codec for the MQTT 5.0 protocol.
//!
//! Every control packet type is a struct implementing [`EncodePacket`] and
//! [`DecodePacket`]; [`Packet`] is the tagged union over all of them, with
//! [`Packet::try_decode`] for framing packets out of a byte stream.

mod auth;
mod base;
mod binary_data;
mod bool_data;
mod byte_array;
mod connect;
mod connect_ack;
mod disconnect;
mod error;
mod header;
mod packet;
mod ping_request;
mod ping_response;
mod property;
mod publish;
mod publish_ack;
mod publish_complete;
mod publish_received;
mod publish_release;
mod reason_code;
mod string_data;
mod string_pair_data;
mod subscribe;
mod subscribe_ack;
pub mod topic;
mod u16_data;
mod u32_data;
mod unsubscribe;
mod unsubscribe_ack;
pub mod utils;
mod var_int;

pub use auth::{AuthPacket, AUTH_PROPERTIES, AUTH_REASONS};
pub use base::{
    DecodePacket, EncodePacket, PacketId, QoS, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use binary_data::BinaryData;
pub use bool_data::BoolData;
pub use byte_array::ByteArray;
pub use connect::{ConnectPacket, Will, CONNECT_PROPERTIES, WILL_PROPERTIES};
pub use connect_ack::{ConnectAckPacket, CONNECT_ACK_PROPERTIES, CONNECT_REASONS};
pub use disconnect::{DisconnectPacket, DISCONNECT_PROPERTIES, DISCONNECT_REASONS};
pub use error::{DecodeError, EncodeError};
pub use header::{FixedHeader, PacketType};
pub use packet::Packet;
pub use ping_request::PingRequestPacket;
pub use ping_response::PingResponsePacket;
pub use property::{
    check_property_type_list, Properties, Property, PropertyType, MULTIPLE_PROPERTIES,
};
pub use publish::{PublishPacket, PUBLISH_PROPERTIES};
pub use publish_ack::{PublishAckPacket, PUBLISH_ACK_PROPERTIES, PUBLISH_ACK_REASONS};
pub use publish_complete::{
    PublishCompletePacket, PUBLISH_COMPLETE_PROPERTIES, PUBLISH_COMPLETE_REASONS,
};
pub use publish_received::{
    PublishReceivedPacket, PUBLISH_RECEIVED_PROPERTIES, PUBLISH_RECEIVED_REASONS,
};
pub use publish_release::{
    PublishReleasePacket, PUBLISH_RELEASE_PROPERTIES, PUBLISH_RELEASE_REASONS,
};
pub use reason_code::ReasonCode;
pub use string_data::StringData;
pub use string_pair_data::StringPairData;
pub use subscribe::{
    RetainHandling, SubscribePacket, SubscribeTopic, SUBSCRIBE_PROPERTIES,
};
pub use subscribe_ack::{SubscribeAckPacket, SUBSCRIBE_ACK_PROPERTIES, SUBSCRIBE_REASONS};
pub use topic::{PubTopic, SubTopic, TopicError};
pub use u16_data::U16Data;
pub use u32_data::U32Data;
pub use unsubscribe::{UnsubscribePacket, UNSUBSCRIBE_PROPERTIES};
pub use unsubscribe_ack::{
    UnsubscribeAckPacket, UNSUBSCRIBE_ACK_PROPERTIES, UNSUBSCRIBE_REASONS,
};
pub use var_int::{VarInt, VarIntError, MAX_VAR_INT};
