// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod configuration;
pub use configuration::Config;

mod error;
pub use error::{Error, Result};

pub mod log;
pub mod meter;
pub mod so11y;
