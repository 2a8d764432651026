// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions, PublishMessage, QoS, ReasonCode};

#[tokio::test]
async fn test_publish_qos0_fire_and_forget() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-qos0-test");
    let client = Client::new(options);
    client.connect().await.unwrap();

    let message = PublishMessage::new("tests/x", QoS::AtMostOnce, b"hello");
    let result = client.publish(message).await.unwrap();

    // No acknowledgement exists at QoS 0, so no reason code either.
    assert_eq!(result.reason_code, None);
    assert!(result.reason_string.is_none());
    assert!(result.is_success());
    assert_eq!(result.message.qos(), QoS::AtMostOnce);

    // The message still reached the server.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let seen = broker.with_stats(|stats| stats.resolved_topics.clone());
            if seen == vec!["tests/x".to_string()] {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_qos1_no_subscribers() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-qos1-test");
    let client = Client::new(options);
    client.connect().await.unwrap();

    let message = PublishMessage::new(
        "tests/MostBasicPublishWithQoS1",
        QoS::AtLeastOnce,
        br#"{"interference":"1029384"}"#,
    );
    let result = client.publish(message).await.unwrap();

    assert_eq!(result.reason_code, Some(ReasonCode::NoMatchingSubscribers));
    assert!(result.is_success());

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_rejects_invalid_topic() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-badtopic-test");
    let client = Client::new(options);
    client.connect().await.unwrap();

    let message = PublishMessage::new("tests/+/wildcard", QoS::AtMostOnce, b"x");
    let err = client.publish(message).await.unwrap_err();
    assert_eq!(err.kind(), loro::ErrorKind::InvalidTopicFilter);

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_not_connected() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-notconn-test");
    let client = Client::new(options);

    let message = PublishMessage::new("tests/x", QoS::AtMostOnce, b"hello");
    let err = client.publish(message).await.unwrap_err();
    assert_eq!(err.kind(), loro::ErrorKind::NotConnected);
}
