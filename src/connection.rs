// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the connection and the confirm channel to one RabbitMQ broker.
//! It provides idempotent connection, bounded reconnection on refused connections,
//! queue declaration, confirmed publishing and consumer registration.
//!
//! Both handles live in a single mutex-guarded holder. Caller operations and the
//! asynchronous close notifications of the broker client only change it through
//! `ConnectionManager::transition`, and every installed handle carries a generation
//! id so a late notification from a replaced handle is ignored.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, BrokerEvent, EventSink},
    channel::LapinBroker,
    config::{ConnectionConfig, RetryPolicy},
    consumer::{self, MessageHandler, SubscribeOptions, Subscription},
    errors::AmqpError,
    publisher::{PublishOptions, JSON_CONTENT_TYPE},
    queue::{DeclaredQueue, QueueOptions},
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Observable state of a `ConnectionManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Connection,
    Channel,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Connection => f.write_str("connection"),
            Source::Channel => f.write_str("channel"),
        }
    }
}

struct Slot<T: ?Sized> {
    id: u64,
    handle: Arc<T>,
}

impl<T: ?Sized> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            id: self.id,
            handle: self.handle.clone(),
        }
    }
}

#[derive(Default)]
struct Handles {
    connection: Option<Slot<dyn BrokerConnection>>,
    channel: Option<Slot<dyn BrokerChannel>>,
    connecting: bool,
    next_id: u64,
}

impl Handles {
    fn state(&self) -> ConnectionState {
        if self.connection.is_some() && self.channel.is_some() {
            ConnectionState::Connected
        } else if self.connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    fn install_connection(
        &mut self,
        handle: Arc<dyn BrokerConnection>,
    ) -> Slot<dyn BrokerConnection> {
        self.next_id += 1;
        let slot = Slot {
            id: self.next_id,
            handle,
        };
        self.connection = Some(slot.clone());
        slot
    }

    fn install_channel(&mut self, handle: Arc<dyn BrokerChannel>) -> Slot<dyn BrokerChannel> {
        self.next_id += 1;
        let slot = Slot {
            id: self.next_id,
            handle,
        };
        self.channel = Some(slot.clone());
        slot
    }

    /// Drops handles the client reports as no longer open.
    fn discard_closed(&mut self) {
        if matches!(&self.connection, Some(slot) if !slot.handle.is_open()) {
            debug!("discarding closed connection");
            self.connection = None;
            self.channel = None;
        }

        if matches!(&self.channel, Some(slot) if !slot.handle.is_open()) {
            debug!("discarding closed channel");
            self.channel = None;
        }
    }

    fn notify(&mut self, source: Source, id: u64, event: BrokerEvent) {
        match event {
            BrokerEvent::Error(reason) => {
                warn!(source = %source, reason = reason.as_str(), "broker reported an error");
            }
            BrokerEvent::Closed => match source {
                Source::Connection if self.connection.as_ref().map(|s| s.id) == Some(id) => {
                    debug!("amqp connection closed");
                    // a channel never outlives its connection
                    self.connection = None;
                    self.channel = None;
                }
                Source::Channel if self.channel.as_ref().map(|s| s.id) == Some(id) => {
                    debug!("amqp channel closed");
                    self.channel = None;
                }
                _ => debug!(source = %source, "ignoring close of a replaced handle"),
            },
        }
    }

    #[allow(clippy::type_complexity)]
    fn release(
        &mut self,
    ) -> (
        Option<Slot<dyn BrokerConnection>>,
        Option<Slot<dyn BrokerChannel>>,
    ) {
        (self.connection.take(), self.channel.take())
    }
}

/// Owns the connection and channel to one broker.
pub struct ConnectionManager {
    config: ConnectionConfig,
    broker: Arc<dyn Broker>,
    handles: Arc<Mutex<Handles>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Creates a manager talking to RabbitMQ through `lapin`.
    pub fn new(config: ConnectionConfig) -> ConnectionManager {
        let broker = Arc::new(LapinBroker::new(config.name()));
        ConnectionManager::with_broker(config, broker)
    }

    /// Creates a manager on top of any broker client.
    pub fn with_broker(config: ConnectionConfig, broker: Arc<dyn Broker>) -> ConnectionManager {
        ConnectionManager {
            config,
            broker,
            handles: Arc::new(Mutex::new(Handles::default())),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.transition(|handles| handles.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the connection and the channel, each only if none is held.
    ///
    /// Close notifications are re-registered on every call. Concurrent callers are
    /// serialized, so at most one handshake is in flight.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let _guard = self.connect_lock.lock().await;

        self.transition(|handles| {
            handles.discard_closed();
            handles.connecting = true;
        });

        let result = self.establish().await;
        self.transition(|handles| handles.connecting = false);

        if let Err(err) = &result {
            error!(error = err.to_string(), host = self.config.host(), "failure to connect");
        }

        result
    }

    /// Connects, retrying refused connections `max_retries` times with a fixed `delay`.
    ///
    /// Any other failure is returned at once. Once the budget is spent the last
    /// refusal is returned.
    pub async fn connect_with_retry(
        &self,
        max_retries: u32,
        delay: Duration,
    ) -> Result<(), AmqpError> {
        let mut remaining = max_retries;

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connection_refused() && remaining > 0 => {
                    remaining -= 1;
                    warn!(
                        "retries remaining: {}. trying again in {}ms...",
                        remaining,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn connect_with_policy(&self, policy: &RetryPolicy) -> Result<(), AmqpError> {
        self.connect_with_retry(policy.max_retries, policy.delay())
            .await
    }

    /// Replaces the channel with a fresh one on the current connection.
    pub async fn reopen_channel(&self) -> Result<(), AmqpError> {
        let _guard = self.connect_lock.lock().await;

        let Some(connection) = self.transition(|handles| {
            handles.channel = None;
            handles.connection.clone()
        }) else {
            return Err(AmqpError::ConnectionRequiredError);
        };

        debug!("creating amqp channel...");
        let handle = connection.handle.create_confirm_channel().await?;
        let channel = self.transition(|handles| handles.install_channel(handle));
        channel
            .handle
            .watch(self.sink(Source::Channel, channel.id));
        debug!("channel created");

        Ok(())
    }

    /// Declares a server-named, exclusive queue.
    pub async fn get_exclusive_queue(
        &self,
        options: QueueOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        self.get_named_queue("", options.exclusive(), false).await
    }

    /// Declares the queue `name`.
    ///
    /// A failed declaration reconnects the channel. With `override_existing` the
    /// conflicting queue is then deleted and declared once more.
    pub async fn get_named_queue(
        &self,
        name: &str,
        options: QueueOptions,
        override_existing: bool,
    ) -> Result<DeclaredQueue, AmqpError> {
        let channel = self.require_channel()?;

        match self.declare_queue(channel, name, &options).await {
            Ok(queue) => Ok(queue),
            Err(err) if override_existing => {
                warn!(error = err.to_string(), name, "replacing the existing queue");
                let channel = self.require_channel()?;
                channel.delete_queue(name).await?;
                self.declare_queue(channel, name, &options).await
            }
            Err(err) => Err(err),
        }
    }

    /// Publishes `payload` and waits for the broker confirmation.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.require_channel()?;
        let payload = payload.into();
        let (publish_options, properties) = options.build(&Context::current());

        debug!(exchange, routing_key, "publishing message");

        channel
            .publish(exchange, routing_key, &payload, publish_options, properties)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error publishing message"))
    }

    /// Publishes `payload` serialized as JSON.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;

        self.publish(
            exchange,
            routing_key,
            data,
            options.content_type(JSON_CONTENT_TYPE),
        )
        .await
    }

    /// Registers `handler` as a consumer of `queue`.
    ///
    /// Returns once the broker acknowledged the consumer; deliveries are processed
    /// on a spawned task.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscription, AmqpError> {
        let channel = self.require_channel()?;
        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        let deliveries = channel
            .consume(queue, &consumer_tag, &options)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to create the consumer"))?;

        debug!(queue, consumer_tag = consumer_tag.as_str(), "consumer registered");

        let task = tokio::spawn(consumer::run(deliveries, handler));

        Ok(Subscription::new(queue, &consumer_tag, task))
    }

    /// Cancels the consumer on the broker and stops its delivery task.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), AmqpError> {
        let channel = self.require_channel()?;
        channel.cancel(subscription.consumer_tag()).await?;
        subscription.abort();

        Ok(())
    }

    /// Closes the channel, then the connection. Absent handles are skipped.
    ///
    /// The connection is closed even when closing the channel fails; the first
    /// failure is returned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let (connection, channel) = self.transition(|handles| handles.release());
        let mut result = Ok(());

        if let Some(channel) = channel.filter(|slot| slot.handle.is_open()) {
            debug!("closing amqp channel...");
            if let Err(err) = channel.handle.close().await {
                error!(error = err.to_string(), "failure to close the channel");
                result = Err(err);
            }
        }

        if let Some(connection) = connection.filter(|slot| slot.handle.is_open()) {
            debug!("closing amqp connection...");
            if let Err(err) = connection.handle.close().await {
                error!(error = err.to_string(), "failure to close the connection");
                result = result.and(Err(err));
            }
        }

        debug!("amqp connection closed");
        result
    }

    pub(crate) fn require_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.transition(|handles| handles.channel.as_ref().map(|slot| slot.handle.clone()))
            .ok_or(AmqpError::ChannelRequiredError)
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        let connection = match self.transition(|handles| handles.connection.clone()) {
            Some(slot) => slot,
            None => {
                debug!(host = self.config.host(), "creating amqp connection...");
                let handle = self.broker.connect(&self.config.uri()).await?;
                debug!("amqp connected");
                self.transition(|handles| handles.install_connection(handle))
            }
        };

        let channel = match self.transition(|handles| handles.channel.clone()) {
            Some(slot) => slot,
            None => {
                debug!("creating amqp channel...");
                let handle = connection.handle.create_confirm_channel().await?;
                debug!("channel created");
                self.transition(|handles| handles.install_channel(handle))
            }
        };

        connection
            .handle
            .watch(self.sink(Source::Connection, connection.id));
        channel
            .handle
            .watch(self.sink(Source::Channel, channel.id));

        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: Arc<dyn BrokerChannel>,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        debug!("creating queue: {}", name);

        match channel.assert_queue(name, options).await {
            Ok(queue) => {
                debug!("queue: {} was created", queue.name);
                Ok(queue)
            }
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                self.connect().await?;
                Err(err)
            }
        }
    }

    /// Builds the notification callback of one installed handle.
    fn sink(&self, source: Source, id: u64) -> EventSink {
        let handles = Arc::downgrade(&self.handles);

        Arc::new(move |event| {
            if let Some(handles) = handles.upgrade() {
                handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .notify(source, id, event);
            }
        })
    }

    /// The only place the handle holder is read or changed.
    fn transition<R>(&self, f: impl FnOnce(&mut Handles) -> R) -> R {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut handles)
    }
}
