// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod segment;
mod span;

pub use segment::{SegmentRef, SegmentRefType, TraceSegment};
pub use span::{LogEvent, Span, SpanKind};
