// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{CorrelationContext, DistributedTraceId};

/// Header carrying the trace context across process boundaries
pub const CONTEXT_HEADER: &str = "x-apm-context";
/// Header carrying the correlation context across process boundaries
pub const CORRELATION_HEADER: &str = "x-apm-correlation";

const CONTEXT_HEADER_VERSION: &str = "1";

/// Injector provides an interface for a carrier to push its headers into a
/// transport-specific request object.
pub trait Injector {
    /// Set a value in the carrier.
    fn set(&mut self, key: &str, value: String);
}

pub trait Extractor {
    /// Get a value from the carrier.
    fn get(&self, key: &str) -> Option<&str>;

    /// Get all keys from the carrier.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the `HashMap`.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the `HashMap`.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Collect all the keys from the `HashMap`.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect::<Vec<_>>()
    }
}

/// The cross process context, as written to and read from transport headers.
///
/// A carrier starts out invalid; it becomes valid either when the tracing
/// context injects into it, or when a well formed context header is
/// extracted. Malformed inbound headers leave the carrier invalid instead of
/// surfacing an error into application code.
#[derive(Debug, Clone)]
pub struct ContextCarrier {
    trace_id: DistributedTraceId,
    trace_segment_id: String,
    span_id: i32,
    parent_service: String,
    parent_service_instance: String,
    parent_endpoint: String,
    address_used_at_client: String,
    correlation: CorrelationContext,
    valid: bool,
}

impl ContextCarrier {
    pub fn new(correlation_max_key_count: usize, correlation_max_value_size: usize) -> Self {
        ContextCarrier {
            trace_id: DistributedTraceId::from(""),
            trace_segment_id: String::new(),
            span_id: -1,
            parent_service: String::new(),
            parent_service_instance: String::new(),
            parent_endpoint: String::new(),
            address_used_at_client: String::new(),
            correlation: CorrelationContext::new(
                correlation_max_key_count,
                correlation_max_value_size,
            ),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn trace_id(&self) -> &DistributedTraceId {
        &self.trace_id
    }

    pub fn trace_segment_id(&self) -> &str {
        &self.trace_segment_id
    }

    pub fn span_id(&self) -> i32 {
        self.span_id
    }

    pub fn parent_service(&self) -> &str {
        &self.parent_service
    }

    pub fn parent_service_instance(&self) -> &str {
        &self.parent_service_instance
    }

    pub fn parent_endpoint(&self) -> &str {
        &self.parent_endpoint
    }

    pub fn address_used_at_client(&self) -> &str {
        &self.address_used_at_client
    }

    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    pub fn correlation_mut(&mut self) -> &mut CorrelationContext {
        &mut self.correlation
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fill(
        &mut self,
        trace_id: DistributedTraceId,
        trace_segment_id: String,
        span_id: i32,
        parent_service: String,
        parent_service_instance: String,
        parent_endpoint: String,
        address_used_at_client: String,
        correlation: CorrelationContext,
    ) {
        self.trace_id = trace_id;
        self.trace_segment_id = trace_segment_id;
        self.span_id = span_id;
        self.parent_service = parent_service;
        self.parent_service_instance = parent_service_instance;
        self.parent_endpoint = parent_endpoint;
        self.address_used_at_client = address_used_at_client;
        self.correlation = correlation;
        self.valid = true;
    }

    /// Pushes the carried context into transport headers
    pub fn inject_into(&self, injector: &mut dyn Injector) {
        if let Some(context) = self.serialize_context() {
            injector.set(CONTEXT_HEADER, context);
        }
        if let Some(correlation) = self.correlation.serialize_header() {
            injector.set(CORRELATION_HEADER, correlation);
        }
    }

    /// Reads the carried context from transport headers
    pub fn extract_from(&mut self, extractor: &dyn Extractor) {
        if let Some(value) = extractor.get(CONTEXT_HEADER) {
            self.deserialize_context(value);
        }
        if let Some(value) = extractor.get(CORRELATION_HEADER) {
            self.correlation.deserialize_header(value);
        }
    }

    /// The context header value. None until the carrier has been populated.
    pub fn serialize_context(&self) -> Option<String> {
        if !self.valid {
            return None;
        }
        Some(format!(
            "{CONTEXT_HEADER_VERSION}-{}-{}-{}-{}-{}-{}-{}",
            BASE64.encode(self.trace_id.as_str()),
            BASE64.encode(&self.trace_segment_id),
            self.span_id,
            BASE64.encode(&self.parent_service),
            BASE64.encode(&self.parent_service_instance),
            BASE64.encode(&self.parent_endpoint),
            BASE64.encode(&self.address_used_at_client),
        ))
    }

    /// Parses a context header value. On any malformation the carrier simply
    /// stays invalid.
    pub fn deserialize_context(&mut self, value: &str) {
        let parts: Vec<&str> = value.split('-').collect();
        let [version, trace_id, segment_id, span_id, service, instance, endpoint, peer] =
            parts.as_slice()
        else {
            return;
        };
        if *version != CONTEXT_HEADER_VERSION {
            return;
        }
        let Ok(span_id) = span_id.parse::<i32>() else {
            return;
        };
        if span_id < 0 {
            return;
        }
        let Some(trace_id) = decode_field(trace_id) else {
            return;
        };
        let Some(segment_id) = decode_field(segment_id) else {
            return;
        };
        if trace_id.is_empty() || segment_id.is_empty() {
            return;
        }
        let (Some(service), Some(instance), Some(endpoint), Some(peer)) = (
            decode_field(service),
            decode_field(instance),
            decode_field(endpoint),
            decode_field(peer),
        ) else {
            return;
        };

        self.trace_id = DistributedTraceId::from(trace_id);
        self.trace_segment_id = segment_id;
        self.span_id = span_id;
        self.parent_service = service;
        self.parent_service_instance = instance;
        self.parent_endpoint = endpoint;
        self.address_used_at_client = peer;
        self.valid = true;
    }
}

fn decode_field(value: &str) -> Option<String> {
    String::from_utf8(BASE64.decode(value).ok()?).ok()
}
