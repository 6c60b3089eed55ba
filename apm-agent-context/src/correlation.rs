// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// User key/value pairs carried along the whole trace.
///
/// The map is bounded in both key count and value size; writes past either
/// bound are silently dropped so application code never has to care whether
/// the correlation budget is spent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    max_key_count: usize,
    max_value_size: usize,
    data: Vec<(String, String)>,
}

impl CorrelationContext {
    pub fn new(max_key_count: usize, max_value_size: usize) -> Self {
        CorrelationContext {
            max_key_count,
            max_value_size,
            data: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets or removes a key. Returns the previous value, if any. A value
    /// over the size bound, or a new key past the count bound, is ignored.
    pub fn put(&mut self, key: &str, value: Option<String>) -> Option<String> {
        let existing = self.data.iter().position(|(k, _)| k == key);
        match value {
            None => existing.map(|i| self.data.remove(i).1),
            Some(value) => {
                if value.len() > self.max_value_size {
                    return None;
                }
                match existing {
                    Some(i) => Some(std::mem::replace(&mut self.data[i].1, value)),
                    None => {
                        if self.data.len() < self.max_key_count {
                            self.data.push((key.to_string(), value));
                        }
                        None
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Copies every entry of `other` into this context, within the local
    /// bounds
    pub fn extend_from(&mut self, other: &CorrelationContext) {
        for (key, value) in &other.data {
            self.put(key, Some(value.clone()));
        }
    }

    /// Header form: comma separated `base64(key):base64(value)` pairs.
    /// Returns None when there is nothing to carry.
    pub fn serialize_header(&self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(
            self.data
                .iter()
                .map(|(k, v)| format!("{}:{}", BASE64.encode(k), BASE64.encode(v)))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Parses the header form produced by [`Self::serialize_header`].
    /// Malformed pairs are skipped; valid pairs still land within bounds.
    pub fn deserialize_header(&mut self, header: &str) {
        for pair in header.split(',') {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            let (Ok(key), Ok(value)) = (BASE64.decode(key), BASE64.decode(value)) else {
                continue;
            };
            let (Ok(key), Ok(value)) = (String::from_utf8(key), String::from_utf8(value)) else {
                continue;
            };
            self.put(&key, Some(value));
        }
    }
}
