// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions, PublishMessage, QoS};
use std::time::Duration;
use tokio::time::timeout;

/// Concurrent subscribe/publish/unsubscribe from many tasks over one
/// client. Every iteration must succeed, packet ids must never collide
/// (a collision would surface as a misrouted ack and a hung call), and
/// the registries must be empty at quiesce.
#[tokio::test]
async fn test_concurrent_subscribe_publish_unsubscribe() {
    const WORKERS: usize = 8;
    const ITERATIONS: usize = 5;
    const TOPICS_PER_ITERATION: usize = 3;

    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-stress");
    options.set_response_timeout(Duration::from_secs(20));
    let client = Client::new(options);
    client.connect().await.unwrap();

    let mut workers = Vec::new();
    for worker in 0..WORKERS {
        let client = client.clone();
        workers.push(tokio::spawn(async move {
            for iteration in 0..ITERATIONS {
                let filters: Vec<String> = (0..TOPICS_PER_ITERATION)
                    .map(|topic| format!("stress/w{worker}/i{iteration}/t{topic}"))
                    .collect();

                for filter in &filters {
                    let result = client
                        .subscribe_topic(filter, QoS::AtLeastOnce)
                        .await
                        .expect("subscribe failed");
                    assert!(result.all_granted());
                }

                for filter in &filters {
                    let result = client
                        .publish(PublishMessage::new(
                            filter,
                            QoS::AtLeastOnce,
                            b"stress payload",
                        ))
                        .await
                        .expect("publish failed");
                    assert!(result.is_success());
                }

                let filter_refs: Vec<&str> =
                    filters.iter().map(String::as_str).collect();
                client
                    .unsubscribe(&filter_refs)
                    .await
                    .expect("unsubscribe failed");
            }
        }));
    }

    for worker in workers {
        timeout(Duration::from_secs(60), worker)
            .await
            .expect("worker timed out")
            .expect("worker panicked");
    }

    assert!(client.is_connected());
    assert_eq!(broker.subscription_count(), 0);

    client.disconnect().await.unwrap();
}
