// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers so a consumer span joins the
//! trace of the code that published the message, whatever broker carried it.

use crate::broker::Headers;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Name of the tracer used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "mq consumer";

/// Writes trace context entries into outgoing headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_owned(), value);
    }
}

/// Reads trace context entries from incoming headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` using the global text-map propagator.
pub(crate) fn inject_context(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Extracts the publisher's context from `headers` and starts a consumer span under it.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
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
    fn test_injector_and_extractor_share_header_map() {
        let mut headers = Headers::default();
        HeaderInjector::new(&mut headers).set("traceparent", "00-abc-def-01".to_owned());
        headers.insert("x-delay".to_owned(), "10".to_owned());

        let extractor = HeaderExtractor::new(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("missing"), None);

        let mut keys = extractor.keys();
        keys.sort();
        assert_eq!(keys, vec!["traceparent", "x-delay"]);
    }
}
