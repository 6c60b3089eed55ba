// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_agent::log::Level;
use thiserror::Error;

#[derive(Error, Debug, Copy, Clone)]
#[error("Cannot {} in {}, {}", operation, component, message)]
pub struct Error {
    pub message: &'static str,
    // which part of the context this error comes from
    component: &'static str,
    // what operation was attempted
    operation: &'static str,
    // error log level
    pub log_level: Level,
}

impl Error {
    /// Error when injecting the context into a carrier
    #[must_use]
    pub fn inject(message: &'static str, component: &'static str) -> Self {
        Self {
            message,
            component,
            operation: "inject",
            log_level: Level::Error,
        }
    }

    /// Error when manipulating the span stack
    #[must_use]
    pub fn span(message: &'static str, component: &'static str) -> Self {
        Self {
            message,
            component,
            operation: "operate on span",
            log_level: Level::Error,
        }
    }
}
