// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer side: the `Message` handed to handlers, the
//! `MessageHandler` trait, consumer registration options and the delivery loop
//! spawned for every subscription. The loop opens an OpenTelemetry span per
//! delivery, runs the handler and settles the delivery: ack on success, nack
//! without requeue on failure.

use crate::{
    broker::{Delivery, DeliveryStream},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, BasicProperties};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, data: Vec<u8>) -> Message {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            delivery_tag: 0,
            redelivered: false,
            properties: BasicProperties::default(),
            data,
        }
    }

    /// The `type` property set by the publisher.
    pub fn msg_type(&self) -> Option<String> {
        self.properties.kind().as_ref().map(|kind| kind.to_string())
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::SerializationError(err.to_string())
        })
    }
}

/// Processes the messages of a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message. `ctx` carries the trace context of the publisher.
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), AmqpError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        self(msg)
    }
}

/// Consumer registration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub(crate) consumer_tag: Option<String>,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
}

impl SubscribeOptions {
    pub fn new() -> SubscribeOptions {
        SubscribeOptions::default()
    }

    /// Uses `tag` instead of a generated consumer tag.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// The broker considers messages settled on delivery.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn is_no_ack(&self) -> bool {
        self.no_ack
    }

    pub(crate) fn consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.no_ack,
            exclusive: self.exclusive,
            nowait: false,
        }
    }
}

/// A registered consumer and the task processing its deliveries.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(queue: &str, consumer_tag: &str, task: JoinHandle<()>) -> Subscription {
        Subscription {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops processing deliveries without cancelling the consumer on the broker.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits until the broker ends the delivery stream.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "tokio process error");
            AmqpError::ConsumerError(err.to_string())
        })
    }
}

/// Drains `deliveries`, handing each one to `handler`.
pub(crate) async fn run(mut deliveries: DeliveryStream, handler: Arc<dyn MessageHandler>) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) = consume(&tracer, delivery, handler.as_ref()).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    debug!("consumer stream ended");
}

/// Processes a single delivery.
///
/// Handler failures are recorded on the span and settled with a nack; only
/// failures to settle are returned.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: &dyn MessageHandler,
) -> Result<(), AmqpError> {
    let Delivery { message, acker } = delivery;
    let name = message
        .msg_type()
        .unwrap_or_else(|| message.routing_key.clone());

    let (ctx, mut span) = otel::new_span(&message.properties, tracer, &name);

    debug!("received: {} - exchange: {}", name, message.exchange);

    let result = handler.exec(&ctx, &message).await;

    if let Err(err) = &result {
        warn!(error = err.to_string(), "error whiling handling msg");
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from("handler failure"),
        });
    }

    let Some(acker) = acker else {
        if result.is_ok() {
            span.set_status(Status::Ok);
        }
        return Ok(());
    };

    if result.is_ok() {
        debug!("message successfully processed");
        return match acker.ack().await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    }

    match acker.nack(false).await {
        Err(e) => {
            error!("error whiling nack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            Err(AmqpError::NackMessageError)
        }
        _ => Ok(()),
    }
}
