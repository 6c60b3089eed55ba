// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// The id shared by every segment of one distributed trace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributedTraceId(String);

impl DistributedTraceId {
    pub fn generate() -> Self {
        DistributedTraceId(new_global_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DistributedTraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DistributedTraceId {
    fn from(id: String) -> Self {
        DistributedTraceId(id)
    }
}

impl From<&str> for DistributedTraceId {
    fn from(id: &str) -> Self {
        DistributedTraceId(id.to_string())
    }
}

/// Generates a process-unique id, used for segment ids and trace ids
pub fn new_global_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DistributedTraceId::generate();
        let b = DistributedTraceId::generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_serde_transparent() {
        let id = DistributedTraceId::from("abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: DistributedTraceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
