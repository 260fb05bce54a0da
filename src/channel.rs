// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker traits on top of `lapin`. It establishes
//! connections to the RabbitMQ server, opens confirm-mode channels and maps the
//! client failures onto `AmqpError`.

use crate::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerEvent, Delivery,
        DeliveryStream, EventSink,
    },
    consumer::{Message, SubscribeOptions},
    errors::AmqpError,
    exchange::ExchangeDescriptor,
    queue::{DeclaredQueue, QueueOptions},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Holds the callback of one handle so `watch` can replace it.
#[derive(Clone, Default)]
struct Watcher {
    sink: Arc<Mutex<Option<EventSink>>>,
}

impl Watcher {
    fn replace(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn emit(&self, event: BrokerEvent) {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(sink) = sink {
            sink(event);
        }
    }
}

/// Maps a failure to open a connection or a channel.
pub(crate) fn connection_error(err: &lapin::Error) -> AmqpError {
    let refused = matches!(
        err,
        lapin::Error::IOError(io_err) if io_err.kind() == io::ErrorKind::ConnectionRefused
    );

    AmqpError::ConnectionError {
        refused,
        reason: err.to_string(),
    }
}

/// Whether the broker rejected a declaration that conflicts with an existing entity.
pub(crate) fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp_err)
            if matches!(amqp_err.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

/// Maps the outcome of a publisher confirm.
///
/// A broker nack or a returned message is a `PublishError`. A confirm that never
/// resolves because the channel failed is a `ChannelError`.
pub(crate) fn confirmation_result(
    routing_key: &str,
    confirmation: Result<Confirmation, lapin::Error>,
) -> Result<(), AmqpError> {
    match confirmation {
        Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => Ok(()),
        Ok(Confirmation::Ack(Some(_))) => Err(AmqpError::PublishError(format!(
            "message returned as unroutable: {}",
            routing_key
        ))),
        Ok(Confirmation::Nack(_)) => Err(AmqpError::PublishError(
            "message nacked by the broker".to_owned(),
        )),
        Err(err) => Err(AmqpError::ChannelError(err.to_string())),
    }
}

/// Opens RabbitMQ connections with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker {
    connection_name: Option<String>,
}

impl LapinBroker {
    pub fn new(connection_name: Option<&str>) -> LapinBroker {
        LapinBroker {
            connection_name: connection_name.map(str::to_owned),
        }
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(LongString::from(name.clone())),
            None => properties,
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let conn = Connection::connect(uri, self.properties())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                connection_error(&err)
            })?;

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    conn: Connection,
    watcher: Watcher,
}

impl LapinConnection {
    fn new(conn: Connection) -> LapinConnection {
        let watcher = Watcher::default();
        let status = conn.status().clone();
        let notifier = watcher.clone();

        conn.on_error(move |err| {
            notifier.emit(BrokerEvent::Error(err.to_string()));
            if !status.connected() {
                notifier.emit(BrokerEvent::Closed);
            }
        });

        LapinConnection { conn, watcher }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            connection_error(&err)
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                connection_error(&err)
            })?;

        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn watch(&self, sink: EventSink) {
        self.watcher.replace(sink);
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// A confirm-mode `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
    watcher: Watcher,
}

impl LapinChannel {
    fn new(channel: Channel) -> LapinChannel {
        let watcher = Watcher::default();
        let status = channel.status().clone();
        let notifier = watcher.clone();

        channel.on_error(move |err| {
            notifier.emit(BrokerEvent::Error(err.to_string()));
            if !status.connected() {
                notifier.emit(BrokerEvent::Closed);
            }
        });

        LapinChannel { channel, watcher }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_exchange(&self, descriptor: &ExchangeDescriptor) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &descriptor.name,
                descriptor.kind.into(),
                descriptor.options.declare_options(),
                descriptor.options.arguments(),
            )
            .await
            .map_err(|err| {
                if is_precondition_failed(&err) {
                    AmqpError::ExchangeTypeConflictError {
                        exchange: descriptor.name.clone(),
                        reason: err.to_string(),
                    }
                } else {
                    AmqpError::DeclareExchangeError(err.to_string())
                }
            })
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the exchange");
                AmqpError::DeleteExchangeError(name.to_owned())
            })
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        let queue = self
            .channel
            .queue_declare(name, options.declare_options(), options.arguments())
            .await
            .map_err(|err| AmqpError::DeclareQueueError(err.to_string()))?;

        Ok(DeclaredQueue::new(
            queue.name().as_str(),
            queue.message_count(),
            queue.consumer_count(),
        ))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the queue");
                AmqpError::DeleteQueueError(name.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments.clone(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, queue, "error to bind queue to exchange"
                );
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        confirmation_result(routing_key, confirm.await)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &SubscribeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                options.consume_options(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))?;

        let no_ack = options.is_no_ack();

        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| Delivery {
                        message: Message {
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            delivery_tag: delivery.delivery_tag,
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            data: delivery.data,
                        },
                        acker: if no_ack {
                            None
                        } else {
                            Some(Arc::new(LapinAcker(delivery.acker)) as Arc<dyn Acknowledger>)
                        },
                    })
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        debug!(consumer_tag, "cancelling consumer");

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    fn watch(&self, sink: EventSink) {
        self.watcher.replace(sink);
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// Settles `lapin` deliveries.
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
