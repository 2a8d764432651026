// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions, PublishMessage, QoS, ReconnectOptions};
use std::time::Duration;
use tokio::time::timeout;

/// The server kills the connection after acknowledging five publishes.
/// The client reconnects into the persisted session and re-sends the
/// remaining publishes with DUP set; every publish call still resolves.
#[tokio::test]
async fn test_session_resumption_redelivers_with_dup() {
    let _ = env_logger::builder().is_test(true).try_init();
    let broker = TestBroker::start(BrokerConfig {
        drop_after_acks: Some(5),
        ..BrokerConfig::default()
    })
    .await;

    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-resume");
    options.set_clean_start(false);
    options.set_session_expiry_interval(300);
    options.set_response_timeout(Duration::from_secs(20));
    options.set_reconnect(ReconnectOptions {
        enabled: true,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    });
    let client = Client::new(options);
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for index in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let message = PublishMessage::new(
                "tests/resume",
                QoS::AtLeastOnce,
                format!("payload-{index}").as_bytes(),
            );
            client.publish(message).await
        }));
    }

    for handle in handles {
        let result = timeout(Duration::from_secs(30), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_success());
    }

    // The second connection saw re-transmissions flagged as duplicates.
    let dup_count = broker.with_stats(|stats| {
        stats
            .publish_dup_flags
            .iter()
            .filter(|dup| **dup)
            .count()
    });
    assert!(dup_count >= 1, "expected re-sent publishes with DUP=1");

    let acks = broker.with_stats(|stats| stats.puback_sent);
    assert!(acks >= 10, "every publish must be acknowledged, got {acks}");

    client.disconnect().await.unwrap();
}
