// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! The current OpenTelemetry context travels inside the AMQP headers: the publisher
//! injects it, and the consumer extracts it to parent the span of each delivery.

use crate::queue::Arguments;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use tracing::warn;

/// Header map adapter for the OpenTelemetry text-map propagator.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut Arguments,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut Arguments) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| {
                    warn!(error = err.to_string(), key = key, "undecodable trace header")
                })
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn current_context_headers() -> Arguments {
    let mut headers = Arguments::new();
    let ctx = Context::current();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderCarrier::new(&mut headers))
    });

    headers
}

/// Opens a consumer span named `name`, parented by the context found in `props`.
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased_long_strings() {
        let mut headers = Arguments::new();
        HeaderCarrier::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&AMQPValue::LongString("00-abc-def-01".into()))
        );
    }

    #[test]
    fn extractor_ignores_non_string_headers() {
        let mut headers = Arguments::new();
        headers.insert("traceparent".into(), AMQPValue::LongLongInt(1));
        headers.insert("tracestate".into(), AMQPValue::LongString("k=v".into()));

        let carrier = HeaderCarrier::new(&mut headers);

        assert_eq!(carrier.get("traceparent"), None);
        assert_eq!(carrier.get("tracestate"), Some("k=v"));
        assert_eq!(carrier.keys().len(), 2);
    }
}
