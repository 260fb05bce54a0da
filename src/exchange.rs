// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange vocabulary (kinds, options, descriptors) and the
//! `ExchangeManager`, which owns at most one active exchange and recovers from
//! declarations rejected because the broker holds the same name with another type.

use crate::{broker::BrokerChannel, connection::ConnectionManager, errors::AmqpError};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, warn};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// The name the broker uses for this exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    /// Parses a broker exchange type name, rejecting anything outside the fixed set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::InvalidExchangeTypeError(other.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Declaration flags and arguments of an exchange.
///
/// This struct implements the builder pattern; everything defaults to false.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeOptions {
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeOptions {
    pub fn new() -> ExchangeOptions {
        ExchangeOptions::default()
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the exchange arguments.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single argument to the exchange.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub(crate) fn declare_options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Name, type and options of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

impl ExchangeDescriptor {
    pub fn new(name: &str, kind: ExchangeKind) -> ExchangeDescriptor {
        ExchangeDescriptor {
            name: name.to_owned(),
            kind,
            options: ExchangeOptions::default(),
        }
    }

    /// Builds a descriptor from a broker type name.
    ///
    /// Fails with `InvalidExchangeTypeError` when `kind` is not topic, direct,
    /// fanout or headers.
    pub fn named(name: &str, kind: &str) -> Result<ExchangeDescriptor, AmqpError> {
        Ok(ExchangeDescriptor::new(name, kind.parse()?))
    }

    pub fn options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }
}

/// Declares, deletes and binds queues to a single exchange.
///
/// The active descriptor is recorded *before* the broker confirms a declaration,
/// so it always names the last exchange this manager tried to declare. A
/// `delete_exchange` issued while that declaration is still in flight can reach
/// the broker first; the declaration then recreates the exchange after the
/// delete. This ordering is not guarded.
pub struct ExchangeManager {
    connection: ConnectionManager,
    active: Mutex<Option<ExchangeDescriptor>>,
}

impl ExchangeManager {
    pub fn new(connection: ConnectionManager) -> ExchangeManager {
        ExchangeManager {
            connection,
            active: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The descriptor of the exchange last declared, if not deleted since.
    pub fn active_exchange(&self) -> Option<ExchangeDescriptor> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Declares the exchange described by `descriptor`.
    ///
    /// `descriptor` becomes the active exchange before anything else is checked,
    /// so it is recorded even when this fails with `ChannelRequiredError`.
    /// On failure the channel is reconnected. With `override_existing` the existing
    /// exchange is then deleted and the declaration attempted once more; without it
    /// the original error is returned.
    pub async fn create_exchange(
        &self,
        descriptor: ExchangeDescriptor,
        override_existing: bool,
    ) -> Result<(), AmqpError> {
        self.set_active(Some(descriptor.clone()));
        let channel = self.connection.require_channel()?;

        match self.declare(channel, &descriptor).await {
            Ok(()) => Ok(()),
            Err(err) if override_existing => {
                warn!(
                    error = err.to_string(),
                    name = descriptor.name.as_str(),
                    "replacing the existing exchange"
                );
                self.delete_exchange().await?;
                self.declare(self.connection.require_channel()?, &descriptor)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes the active exchange from the broker. No-op without one.
    pub async fn delete_exchange(&self) -> Result<(), AmqpError> {
        let Some(exchange) = self.active_exchange() else {
            return Ok(());
        };

        let channel = self.connection.require_channel()?;

        debug!("deleting exchange: {}", exchange.name);
        channel.delete_exchange(&exchange.name).await?;
        self.set_active(None);
        debug!("exchange: {} was deleted", exchange.name);

        Ok(())
    }

    /// Binds `queue` to the active exchange with a routing key or pattern.
    pub async fn bind_queue(
        &self,
        queue: &str,
        key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let channel = self.connection.require_channel()?;
        let Some(exchange) = self.active_exchange() else {
            return Err(AmqpError::ExchangeRequiredError);
        };

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange.name, key
        );

        channel
            .bind_queue(queue, &exchange.name, key, &arguments)
            .await
    }

    async fn declare(
        &self,
        channel: Arc<dyn BrokerChannel>,
        descriptor: &ExchangeDescriptor,
    ) -> Result<(), AmqpError> {
        self.set_active(Some(descriptor.clone()));

        debug!("creating exchange: {}", descriptor.name);

        match channel.assert_exchange(descriptor).await {
            Ok(()) => {
                debug!("exchange: {} was created", descriptor.name);
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = descriptor.name.as_str(),
                    "error to declare the exchange"
                );
                // a rejected declaration closes the channel broker-side
                self.connection.connect().await?;
                Err(err)
            }
        }
    }

    fn set_active(&self, descriptor: Option<ExchangeDescriptor>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = descriptor;
    }
}
