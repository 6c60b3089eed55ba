// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A meter was re-registered under the same identity with an
    /// incompatible shape (e.g. different histogram steps).
    #[error("meter {name} already registered with a different definition")]
    MeterConflict { name: String },

    #[error("invalid configuration value for {key}: {message}")]
    Configuration { key: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
