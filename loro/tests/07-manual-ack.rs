// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{
    Client, ConnectOptions, ErrorKind, PublishMessage, QoS, SubscribeOptions,
    SubscribeTopicOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// In manual ack mode the PUBACK only goes out on `Client::ack`, a
/// second ack of the same id fails, and no second PUBACK is written.
#[tokio::test]
async fn test_manual_ack_double_ack_fails() {
    let broker = TestBroker::start(BrokerConfig::default()).await;

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-manual-sub");
    options.set_manual_ack(true);
    let subscriber = Client::new(options);
    subscriber.connect().await.unwrap();

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-manual-pub");
    let publisher = Client::new(options);
    publisher.connect().await.unwrap();

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let options = SubscribeOptions {
        topics: vec![
            SubscribeTopicOptions::new("tests/manual", QoS::AtLeastOnce).with_handler(Arc::new(
                move |_client, message| {
                    let _ = message_tx.send(message);
                },
            )),
        ],
        ..SubscribeOptions::default()
    };
    subscriber.subscribe(options).await.unwrap();

    publisher
        .publish(PublishMessage::new(
            "tests/manual",
            QoS::AtLeastOnce,
            b"needs explicit ack",
        ))
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(5), message_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let packet_id = message.packet_id();
    assert_ne!(packet_id, 0);

    // No PUBACK before the user acknowledges.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.with_stats(|stats| stats.puback_received), 0);

    subscriber.ack(packet_id).unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if broker.with_stats(|stats| stats.puback_received) == 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Acking the same id again fails and writes nothing.
    let err = subscriber.ack(packet_id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManualAckError);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.with_stats(|stats| stats.puback_received), 1);

    // Unknown ids fail too.
    let err = subscriber.ack(40_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManualAckError);

    // QoS 0 deliveries carry no id; acking them is a no-op.
    assert!(subscriber.ack(0).is_ok());

    subscriber.disconnect().await.unwrap();
    publisher.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ack_requires_manual_mode() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-auto-ack");
    let client = Client::new(options);
    client.connect().await.unwrap();

    let err = client.ack(7).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManualAckError);

    client.disconnect().await.unwrap();
}
