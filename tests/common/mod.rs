// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the broker traits.
//!
//! It keeps exchanges, queues and bindings, routes published messages with
//! topic, direct and fanout semantics, closes the channel on an exchange type
//! conflict like RabbitMQ does, and can refuse a number of connections.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{options::BasicPublishOptions, types::FieldTable, BasicProperties};
use rabbitmq_topics::{
    broker::{
        Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerEvent, Delivery,
        DeliveryStream, EventSink,
    },
    AmqpError, DeclaredQueue, ExchangeDescriptor, ExchangeKind, Message, QueueOptions,
    SubscribeOptions,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

type Consumer = UnboundedSender<Result<Delivery, AmqpError>>;

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct State {
    refusals: usize,
    connects: usize,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, HashMap<String, (Consumer, bool)>>,
    bindings: Vec<Binding>,
    published: Vec<String>,
    acks: usize,
    nacks: usize,
    next_queue: usize,
}

impl State {
    fn route(&self, exchange: &str, kind: ExchangeKind, key: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic_matches(&b.pattern, key),
                ExchangeKind::Direct => b.pattern == key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Headers => false,
            })
            .map(|b| b.queue.clone())
            .collect()
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                go(rest, key) || (!key.is_empty() && go(pattern, &key[1..]))
            }
            (Some((&p, rest)), Some((&k, tail))) => (p == "*" || p == k) && go(rest, tail),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.lock().refusals = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connects
    }

    /// Declares an exchange out of band, as another service would.
    pub fn seed_exchange(&self, name: &str, kind: ExchangeKind) {
        self.lock().exchanges.insert(name.to_owned(), kind);
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).copied()
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> usize {
        self.lock().acks
    }

    pub fn nacks(&self) -> usize {
        self.lock().nacks
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        state.connects += 1;

        if state.refusals > 0 {
            state.refusals -= 1;
            return Err(AmqpError::ConnectionError {
                refused: true,
                reason: "Connection refused (os error 111)".to_owned(),
            });
        }

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            handle: Handle::default(),
        }))
    }
}

#[derive(Default)]
struct Handle {
    closed: AtomicBool,
    sink: Mutex<Option<EventSink>>,
}

impl Handle {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, reason: Option<&str>) {
        self.closed.store(true, Ordering::SeqCst);
        let sink = self.sink.lock().unwrap().clone();

        if let Some(sink) = sink {
            if let Some(reason) = reason {
                sink(BrokerEvent::Error(reason.to_owned()));
            }
            sink(BrokerEvent::Closed);
        }
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    handle: Handle,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.handle.is_open() {
            return Err(AmqpError::ConnectionError {
                refused: false,
                reason: "connection closed".to_owned(),
            });
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            handle: Handle::default(),
        }))
    }

    fn watch(&self, sink: EventSink) {
        *self.handle.sink.lock().unwrap() = Some(sink);
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.handle.close(None);
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    handle: Handle,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.handle.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, descriptor: &ExchangeDescriptor) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let existing = {
            let mut state = self.broker.lock();
            let existing = state.exchanges.get(&descriptor.name).copied();
            if existing.is_none() {
                state
                    .exchanges
                    .insert(descriptor.name.clone(), descriptor.kind);
            }
            existing
        };

        match existing {
            Some(kind) if kind != descriptor.kind => {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    descriptor.name, descriptor.kind, kind
                );
                self.handle.close(Some(&reason));
                Err(AmqpError::ExchangeTypeConflictError {
                    exchange: descriptor.name.clone(),
                    reason,
                })
            }
            _ => Ok(()),
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
        Ok(())
    }

    async fn assert_queue(
        &self,
        name: &str,
        _options: &QueueOptions,
    ) -> Result<DeclaredQueue, AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            name.to_owned()
        };

        let consumers = state.queues.entry(name.clone()).or_default().len();
        Ok(DeclaredQueue::new(&name, 0, consumers as u32))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
        Ok(0)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.push(Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            pattern: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        let Some(kind) = state.exchanges.get(exchange).copied() else {
            return Err(AmqpError::PublishError(format!("no exchange '{}'", exchange)));
        };

        state.published.push(routing_key.to_owned());

        for queue in state.route(exchange, kind, routing_key) {
            // one consumer per queue is enough for these tests
            if let Some((consumer, no_ack)) = state.queues.get(&queue).and_then(|c| c.values().next()) {
                let mut message = Message::new(exchange, routing_key, payload.to_vec());
                message.properties = properties.clone();

                let acker = (!*no_ack).then(|| {
                    Arc::new(MemoryAcker {
                        broker: self.broker.clone(),
                    }) as Arc<dyn Acknowledger>
                });

                let _ = consumer.send(Ok(Delivery { message, acker }));
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &SubscribeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let (tx, rx) = unbounded_channel();
        let mut state = self.broker.lock();
        let Some(consumers) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        consumers.insert(consumer_tag.to_owned(), (tx, options.is_no_ack()));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;

        for consumers in self.broker.lock().queues.values_mut() {
            consumers.remove(consumer_tag);
        }
        Ok(())
    }

    fn watch(&self, sink: EventSink) {
        *self.handle.sink.lock().unwrap() = Some(sink);
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.handle.close(None);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.lock().acks += 1;
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        self.broker.lock().nacks += 1;
        Ok(())
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[test]
fn topic_matching() {
    assert!(topic_matches("*.B", "A.B"));
    assert!(topic_matches("*.*", "_._"));
    assert!(!topic_matches("*.B", "A.A"));
    assert!(!topic_matches("*", "A.B"));
    assert!(topic_matches("#", "A.B"));
    assert!(topic_matches("A.#", "A"));
}
