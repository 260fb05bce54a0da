// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Mock wiring shared by the unit tests.

use crate::{
    broker::{BrokerChannel, BrokerConnection, MockBroker, MockBrokerChannel, MockBrokerConnection},
    config::ConnectionConfig,
    connection::ConnectionManager,
    errors::AmqpError,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

pub(crate) fn config() -> ConnectionConfig {
    ConnectionConfig::new("guest", "guest", "localhost:5672")
}

/// A channel that stays open and accepts notification callbacks.
pub(crate) fn open_channel() -> MockBrokerChannel {
    let mut channel = MockBrokerChannel::new();
    channel.expect_watch().returning(|_| ());
    channel.expect_is_open().returning(|| true);
    channel
}

/// A channel whose liveness follows `open`.
pub(crate) fn closing_channel(open: Arc<AtomicBool>) -> MockBrokerChannel {
    let mut channel = MockBrokerChannel::new();
    channel.expect_watch().returning(|_| ());
    channel
        .expect_is_open()
        .returning(move || open.load(Ordering::SeqCst));
    channel
}

/// A connection handing out `channels` in order.
pub(crate) fn connection_with(channels: Vec<MockBrokerChannel>) -> MockBrokerConnection {
    let channels = Arc::new(Mutex::new(VecDeque::from(channels)));

    let mut connection = MockBrokerConnection::new();
    connection.expect_watch().returning(|_| ());
    connection.expect_is_open().returning(|| true);
    connection
        .expect_create_confirm_channel()
        .returning(move || match channels.lock().unwrap().pop_front() {
            Some(channel) => Ok(Arc::new(channel) as Arc<dyn BrokerChannel>),
            None => Err(AmqpError::ConnectionError {
                refused: false,
                reason: "no more channels".to_owned(),
            }),
        });
    connection
}

/// A broker accepting exactly one connection.
pub(crate) fn broker_with(connection: MockBrokerConnection) -> MockBroker {
    let connection = Mutex::new(Some(connection));

    let mut broker = MockBroker::new();
    broker.expect_connect().times(1).returning(move |_| {
        let connection = connection.lock().unwrap().take().unwrap();
        Ok(Arc::new(connection) as Arc<dyn BrokerConnection>)
    });
    broker
}

/// A manager already connected to a mock broker serving `channels`.
pub(crate) async fn connected_manager(channels: Vec<MockBrokerChannel>) -> ConnectionManager {
    let broker = broker_with(connection_with(channels));
    let manager = ConnectionManager::with_broker(config(), Arc::new(broker));
    manager.connect().await.unwrap();
    manager
}
