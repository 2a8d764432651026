// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::mem::size_of;

fn print_basic_types() {
    use loro_codec::{
        BinaryData, BoolData, ByteArray, PacketId, PubTopic, QoS, ReasonCode, StringData,
        StringPairData, SubTopic, U16Data, U32Data, VarInt,
    };

    println!("==== Basic types ====");
    println!("BinaryData: {}", size_of::<BinaryData>());
    println!("BoolData: {}", size_of::<BoolData>());
    println!("ByteArray: {}", size_of::<ByteArray<'static>>());
    println!("PacketId: {}", size_of::<PacketId>());
    println!("PubTopic: {}", size_of::<PubTopic>());
    println!("QoS: {}", size_of::<QoS>());
    println!("ReasonCode: {}", size_of::<ReasonCode>());
    println!("StringData: {}", size_of::<StringData>());
    println!("StringPairData: {}", size_of::<StringPairData>());
    println!("SubTopic: {}", size_of::<SubTopic>());
    println!("U16Data: {}", size_of::<U16Data>());
    println!("U32Data: {}", size_of::<U32Data>());
    println!("VarInt: {}", size_of::<VarInt>());
}

fn print_packets() {
    use loro_codec::{
        AuthPacket, ConnectAckPacket, ConnectPacket, DisconnectPacket, Packet,
        PingRequestPacket, PingResponsePacket, Properties, Property, PublishAckPacket,
        PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
        SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
    };

    println!("==== Packets ====");
    println!("AuthPacket: {}", size_of::<AuthPacket>());
    println!("ConnectAckPacket: {}", size_of::<ConnectAckPacket>());
    println!("ConnectPacket: {}", size_of::<ConnectPacket>());
    println!("DisconnectPacket: {}", size_of::<DisconnectPacket>());
    println!("PingRequestPacket: {}", size_of::<PingRequestPacket>());
    println!("PingResponsePacket: {}", size_of::<PingResponsePacket>());
    println!("PublishAckPacket: {}", size_of::<PublishAckPacket>());
    println!(
        "PublishCompletePacket: {}",
        size_of::<PublishCompletePacket>()
    );
    println!("PublishPacket: {}", size_of::<PublishPacket>());
    println!(
        "PublishReceivedPacket: {}",
        size_of::<PublishReceivedPacket>()
    );
    println!(
        "PublishReleasePacket: {}",
        size_of::<PublishReleasePacket>()
    );
    println!("SubscribeAckPacket: {}", size_of::<SubscribeAckPacket>());
    println!("SubscribePacket: {}", size_of::<SubscribePacket>());
    println!(
        "UnsubscribeAckPacket: {}",
        size_of::<UnsubscribeAckPacket>()
    );
    println!("UnsubscribePacket: {}", size_of::<UnsubscribePacket>());

    println!("Property: {}", size_of::<Property>());
    println!("Properties: {}", size_of::<Properties>());
    println!("Packet: {}", size_of::<Packet>());
}

fn main() {
    print_basic_types();
    print_packets();
}
