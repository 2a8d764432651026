// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use bytes::BytesMut;
use common::{read_packet, write_packet};
use loro::{Client, ConnectOptions, PublishMessage, QoS};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

use codec::{ConnectAckPacket, Packet, PublishAckPacket, ReasonCode};

/// With a receive maximum of 2, the third `QoS` 1 publish must not reach
/// the wire until the first acknowledgement frees a slot. The test plays
/// the server on a raw socket to control exactly when acks happen.
#[tokio::test]
async fn test_receive_maximum_bounds_inflight_publishes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut options = ConnectOptions::new("127.0.0.1", port);
    options.set_client_id("loro-flow");
    options.set_receive_maximum(2);
    options.set_keep_alive(0);
    let client = Client::new(options);

    let connect_task = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    let (mut socket, _addr) = listener.accept().await.unwrap();
    let mut buffer = BytesMut::with_capacity(4096);

    let connect = read_packet(&mut socket, &mut buffer).await;
    assert!(matches!(connect, Packet::Connect(_)));
    write_packet(
        &mut socket,
        &Packet::ConnectAck(ConnectAckPacket::new(false, ReasonCode::Success)),
    )
    .await;
    connect_task.await.unwrap().unwrap();

    // Three concurrent publishes; the window only has room for two.
    let mut publish_tasks = Vec::new();
    for index in 0..3 {
        let client = client.clone();
        publish_tasks.push(tokio::spawn(async move {
            let message = PublishMessage::new(
                "tests/flow",
                QoS::AtLeastOnce,
                format!("m{index}").as_bytes(),
            );
            client.publish(message).await
        }));
    }

    let first = match read_packet(&mut socket, &mut buffer).await {
        Packet::Publish(publish) => publish,
        other => panic!("expected a publish, got {other:?}"),
    };
    let second = match read_packet(&mut socket, &mut buffer).await {
        Packet::Publish(publish) => publish,
        other => panic!("expected a publish, got {other:?}"),
    };

    // The third publish is suspended on the in-flight table.
    let held_back = timeout(
        Duration::from_millis(300),
        read_packet(&mut socket, &mut buffer),
    )
    .await;
    assert!(
        held_back.is_err(),
        "third publish hit the wire before an ack freed a slot"
    );

    // Acknowledge the first; the third may now proceed.
    write_packet(
        &mut socket,
        &Packet::PublishAck(PublishAckPacket::new(first.packet_id())),
    )
    .await;

    let third = match timeout(
        Duration::from_secs(5),
        read_packet(&mut socket, &mut buffer),
    )
    .await
    .expect("third publish never arrived")
    {
        Packet::Publish(publish) => publish,
        other => panic!("expected a publish, got {other:?}"),
    };

    // Drain the remaining flows so every publish call resolves.
    write_packet(
        &mut socket,
        &Packet::PublishAck(PublishAckPacket::new(second.packet_id())),
    )
    .await;
    write_packet(
        &mut socket,
        &Packet::PublishAck(PublishAckPacket::new(third.packet_id())),
    )
    .await;

    for task in publish_tasks {
        let result = timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_success());
    }
}
