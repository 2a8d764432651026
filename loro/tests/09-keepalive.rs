// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions};
use std::time::Duration;
use tokio::time::sleep;

/// An idle connection stays alive because the supervisor pings within
/// every keep alive window.
#[tokio::test]
async fn test_keepalive_pings_when_idle() {
    let broker = TestBroker::start(BrokerConfig::default()).await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-keepalive");
    options.set_keep_alive(1);
    let client = Client::new(options);
    client.connect().await.unwrap();

    sleep(Duration::from_millis(3500)).await;

    assert!(client.is_connected());
    let pings = broker.with_stats(|stats| stats.pingreq_count);
    assert!(pings >= 2, "expected periodic PINGREQ, saw {pings}");

    client.disconnect().await.unwrap();
}

/// The server keep alive property overrides the requested value.
#[tokio::test]
async fn test_server_keepalive_override() {
    let broker = TestBroker::start(BrokerConfig {
        server_keep_alive: Some(120),
        ..BrokerConfig::default()
    })
    .await;
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-keepalive-override");
    options.set_keep_alive(5);
    let client = Client::new(options);

    let result = client.connect().await.unwrap();
    assert_eq!(result.keep_alive, 120);

    client.disconnect().await.unwrap();
}
