// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

//! Asynchronous MQTT 5.0 client library.
//!
//! The engine is split into a handful of cooperating tasks per
//! connection: a reader framing packets off the transport, a writer
//! draining the prioritized send queue, a dispatcher routing packets to
//! the `QoS` state machines, and a supervisor owning the connection
//! lifecycle with keep alive and reconnect. [`Client`] is the cloneable
//! handle over all of it.

pub mod alias;
mod client;
mod commands;
pub mod connect_options;
mod context;
mod dispatcher;
pub mod error;
pub mod events;
pub mod inflight;
pub mod packet_id;
mod reader;
pub mod stream;
pub mod subscription;
mod supervisor;
pub mod types;
mod writer;

pub use client::Client;
pub use codec::{QoS, ReasonCode, RetainHandling, Will};
pub use connect_options::{
    ConnectOptions, HttpProxy, Password, Proxy, ReconnectOptions, TlsOptions,
};
pub use context::AuthHandler;
pub use error::{Error, ErrorKind};
pub use events::{ClientEvent, EventBus, EventHandler, EventKind, PacketKind};
pub use types::{
    ConnectResult, MessageHandler, PublishMessage, PublishResult, SubscribeOptions,
    SubscribeResult, SubscribeTopicOptions, UnsubscribeResult,
};
