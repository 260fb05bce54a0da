// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Trace context carried in message headers.
//!
//! Publishers write the current context into the headers of every message;
//! consumers read it back to parent the span that wraps the handler.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Text-map view over a message header table.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    /// Keys are stored lowercased.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    /// Reads a long-string header. Other header types read as absent.
    fn get(&self, key: &str) -> Option<&str> {
        let Some(AMQPValue::LongString(value)) = self.headers.get(key) else {
            return None;
        };

        std::str::from_utf8(value.as_bytes())
            .map_err(|err| error!(error = err.to_string(), key, "trace header is not utf-8"))
            .ok()
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Starts the consumer span of a delivery under the context read from its headers.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
