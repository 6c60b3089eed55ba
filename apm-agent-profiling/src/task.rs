// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A profiling task handed to the agent: which endpoint to profile and how
/// hard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileTask {
    /// Id assigned by whoever created the task
    pub task_id: String,
    /// Endpoint to profile: matched against the first span operation name of
    /// tracing contexts
    pub first_span_op_name: String,
    /// How long the task runs
    pub duration: Duration,
    /// A segment only starts being dumped once it lived this long
    pub min_duration_threshold: Duration,
    /// Pause between thread dumps
    pub thread_dump_period: Duration,
    /// Total number of segments this task may profile
    pub max_sampling_count: i32,
    pub start_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let task = ProfileTask {
            task_id: "t-1".to_string(),
            first_span_op_name: "/api/orders".to_string(),
            duration: Duration::from_secs(60),
            min_duration_threshold: Duration::from_millis(500),
            thread_dump_period: Duration::from_millis(10),
            max_sampling_count: 5,
            start_time_ms: 1234,
        };
        let json = serde_json::to_string(&task).unwrap();
        let back: ProfileTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.first_span_op_name, "/api/orders");
        assert_eq!(back.thread_dump_period, Duration::from_millis(10));
        assert_eq!(back.max_sampling_count, 5);
    }
}
