// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions, PublishMessage, QoS};
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Once the server advertises a Topic Alias Maximum, the first publish to
/// a topic carries name and alias, the second only the alias, and the
/// server resolves both to the same topic.
#[tokio::test]
async fn test_outbound_topic_alias_round_trip() {
    let broker = TestBroker::start(BrokerConfig {
        topic_alias_maximum: 8,
        ..BrokerConfig::default()
    })
    .await;

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-alias");
    let client = Client::new(options);
    let result = client.connect().await.unwrap();
    assert_eq!(result.server_topic_alias_maximum, 8);

    for _ in 0..2 {
        let result = client
            .publish(PublishMessage::new("a/b", QoS::AtLeastOnce, b"aliased"))
            .await
            .unwrap();
        assert!(result.is_success());
    }

    timeout(Duration::from_secs(5), async {
        loop {
            if broker.with_stats(|stats| stats.resolved_topics.len()) >= 2 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let (wire_topics, resolved_topics) = broker.with_stats(|stats| {
        (stats.wire_topics.clone(), stats.resolved_topics.clone())
    });
    assert_eq!(resolved_topics, vec!["a/b".to_string(), "a/b".to_string()]);
    assert_eq!(wire_topics[0], "a/b");
    // The second publish left the topic empty and relied on the alias.
    assert_eq!(wire_topics[1], "");

    client.disconnect().await.unwrap();
}

/// With no alias budget from the server every publish carries the full
/// topic name.
#[tokio::test]
async fn test_aliases_disabled_without_server_support() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-noalias");
    let client = Client::new(options);
    client.connect().await.unwrap();

    for _ in 0..2 {
        client
            .publish(PublishMessage::new("a/b", QoS::AtLeastOnce, b"plain"))
            .await
            .unwrap();
    }

    let wire_topics = broker.with_stats(|stats| stats.wire_topics.clone());
    assert_eq!(wire_topics, vec!["a/b".to_string(), "a/b".to_string()]);

    client.disconnect().await.unwrap();
}
