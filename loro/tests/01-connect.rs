// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

mod common;

use common::{BrokerConfig, TestBroker};
use loro::{Client, ConnectOptions, ErrorKind, ReasonCode};

fn options_for(broker: &TestBroker) -> ConnectOptions {
    let mut options = ConnectOptions::new("127.0.0.1", broker.port);
    options.set_client_id("loro-connect-test");
    options
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let _ = env_logger::builder().is_test(true).try_init();
    let broker = TestBroker::start(BrokerConfig::default()).await;

    let client = Client::new(options_for(&broker));
    assert!(!client.is_connected());

    let result = client.connect().await.unwrap();
    assert_eq!(result.reason_code, ReasonCode::Success);
    assert!(!result.session_present);
    assert!(client.is_connected());

    assert!(client.disconnect().await.unwrap());
    assert!(!client.is_connected());

    // A second disconnect is a no-op.
    assert!(!client.disconnect().await.unwrap());
}

#[tokio::test]
async fn test_connect_rejected() {
    let broker = TestBroker::start(BrokerConfig {
        reject_connect: Some(ReasonCode::NotAuthorized),
        ..BrokerConfig::default()
    })
    .await;

    let client = Client::new(options_for(&broker));
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerRejected);
    assert_eq!(err.reason_code(), Some(ReasonCode::NotAuthorized));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_refused_transport() {
    // Bind a port and close it again so that nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let free_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut options = ConnectOptions::new("127.0.0.1", free_port);
    options.set_client_id("loro-refused-test");
    let client = Client::new(options);
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}
