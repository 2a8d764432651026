// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{
    Client, ConnectOptions, PublishMessage, QoS, SubscribeOptions, SubscribeTopicOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// The full exactly-once exchange between two clients: the publisher
/// walks PUBLISH/PUBREC/PUBREL/PUBCOMP with the server while the server
/// re-publishes to the subscriber, which answers PUBREC and PUBCOMP of
/// its own. The payload must arrive exactly once.
#[tokio::test]
async fn test_qos2_end_to_end() {
    let broker = TestBroker::start(BrokerConfig::default()).await;

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-qos2-sub");
    let subscriber = Client::new(options);
    subscriber.connect().await.unwrap();

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-qos2-pub");
    let publisher = Client::new(options);
    publisher.connect().await.unwrap();

    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let options = SubscribeOptions {
        topics: vec![SubscribeTopicOptions::new("tests/QoS2", QoS::ExactOnce)
            .with_handler(Arc::new(move |_client, message| {
                let _ = message_tx.send(message);
            }))],
        ..SubscribeOptions::default()
    };
    assert!(subscriber.subscribe(options).await.unwrap().all_granted());

    let result = publisher
        .publish(PublishMessage::new(
            "tests/QoS2",
            QoS::ExactOnce,
            b"Manual ack QoS 2 payload",
        ))
        .await
        .unwrap();
    assert!(result.is_success());

    let message = timeout(Duration::from_secs(5), message_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic(), "tests/QoS2");
    assert_eq!(message.payload(), b"Manual ack QoS 2 payload");
    assert_eq!(message.qos(), QoS::ExactOnce);

    // Exactly one delivery.
    sleep(Duration::from_millis(300)).await;
    assert!(message_rx.try_recv().is_err());

    // The subscriber side completed its flow with a PUBCOMP.
    timeout(Duration::from_secs(5), async {
        loop {
            if broker.with_stats(|stats| stats.pubcomp_received) >= 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    publisher.disconnect().await.unwrap();
    subscriber.disconnect().await.unwrap();
}
