// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Router
//!
//! Publish and subscribe on a topic exchange addressed by schema attributes
//! instead of raw routing keys. Published keys fill unspecified fields with `_`;
//! subscription patterns fill them with `*`, so a subscription receives every
//! message agreeing with it on the attributes it names.

use crate::{
    config::ConnectionConfig,
    connection::ConnectionManager,
    consumer::{MessageHandler, SubscribeOptions, Subscription},
    errors::AmqpError,
    exchange::{ExchangeDescriptor, ExchangeKind, ExchangeManager, ExchangeOptions},
    publisher::PublishOptions,
    queue::QueueOptions,
    schema::{FillToken, TopicSchema},
};
use lapin::types::FieldTable;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Routes messages through one topic exchange using a `TopicSchema`.
pub struct TopicRouter {
    exchange: ExchangeManager,
    name: String,
    schema: TopicSchema,
}

impl TopicRouter {
    pub fn new(config: ConnectionConfig, name: &str, schema: TopicSchema) -> TopicRouter {
        TopicRouter::with_exchange_manager(
            ExchangeManager::new(ConnectionManager::new(config)),
            name,
            schema,
        )
    }

    pub fn with_exchange_manager(
        exchange: ExchangeManager,
        name: &str,
        schema: TopicSchema,
    ) -> TopicRouter {
        TopicRouter {
            exchange,
            name: name.to_owned(),
            schema,
        }
    }

    /// Name of the topic exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TopicSchema {
        &self.schema
    }

    pub fn exchange_manager(&self) -> &ExchangeManager {
        &self.exchange
    }

    pub fn connection(&self) -> &ConnectionManager {
        self.exchange.connection()
    }

    /// Declares the topic exchange.
    pub async fn create_topic(
        &self,
        options: ExchangeOptions,
        override_existing: bool,
    ) -> Result<(), AmqpError> {
        let descriptor = ExchangeDescriptor::new(&self.name, ExchangeKind::Topic).options(options);
        self.exchange
            .create_exchange(descriptor, override_existing)
            .await
    }

    pub fn encode_key<I, K, V>(&self, attributes: I, fill: FillToken) -> Result<String, AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.schema.encode_key(attributes, fill)
    }

    pub fn decode_key(&self, key: &str) -> Result<BTreeMap<String, String>, AmqpError> {
        self.schema.decode_key(key)
    }

    /// Publishes `payload` with the concrete key of `attributes`.
    pub async fn publish_to_topic<I, K, V>(
        &self,
        attributes: I,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key = self.encode_key(attributes, FillToken::Null)?;
        debug!(exchange = self.name.as_str(), key = key.as_str(), "publishing to topic");

        self.connection()
            .publish(&self.name, &key, payload, options)
            .await
    }

    /// Publishes `payload` serialized as JSON with the concrete key of `attributes`.
    pub async fn publish_json_to_topic<I, K, V, T>(
        &self,
        attributes: I,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
        T: Serialize + ?Sized,
    {
        let key = self.encode_key(attributes, FillToken::Null)?;

        self.connection()
            .publish_json(&self.name, &key, payload, options)
            .await
    }

    /// Subscribes `handler` to every message matching `attributes`.
    ///
    /// An exclusive server-named queue is declared and bound to the exchange with
    /// the wildcard pattern of `attributes`. `create_topic` must have been called.
    pub async fn subscribe_to_topic<I, K, V>(
        &self,
        attributes: I,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, AmqpError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let pattern = self.encode_key(attributes, FillToken::Any)?;

        // no queue is declared until there is an exchange to bind it to
        if self.exchange.active_exchange().is_none() {
            return Err(AmqpError::ExchangeRequiredError);
        }

        let queue = self
            .connection()
            .get_exclusive_queue(QueueOptions::new())
            .await?;
        self.exchange
            .bind_queue(&queue.name, &pattern, FieldTable::default())
            .await?;

        debug!(
            exchange = self.name.as_str(),
            queue = queue.name.as_str(),
            pattern = pattern.as_str(),
            "subscribing to topic"
        );

        self.connection()
            .subscribe(&queue.name, handler, SubscribeOptions::new())
            .await
    }
}
