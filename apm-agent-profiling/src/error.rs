// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProfilingError {
    #[error("invalid profile task: {0}")]
    InvalidTask(&'static str),

    #[error("profiling worker did not stop: {0}")]
    WorkerStop(String),
}
