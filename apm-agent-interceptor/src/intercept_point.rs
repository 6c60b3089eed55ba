// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptKind {
    InstanceMethod,
    StaticMethod,
    Constructor,
}

/// One declared interception: which methods to match and which interceptor
/// to run there.
///
/// The structural hash gives every point a stable per-instance context field
/// name, so re-transforming an already enhanced type finds the field it
/// created the first time instead of minting a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterceptPoint {
    kind: InterceptKind,
    class_matcher: String,
    interceptor_class_name: String,
    override_args: bool,
}

impl InterceptPoint {
    pub fn new(
        kind: InterceptKind,
        class_matcher: impl Into<String>,
        interceptor_class_name: impl Into<String>,
        override_args: bool,
    ) -> Self {
        InterceptPoint {
            kind,
            class_matcher: class_matcher.into(),
            interceptor_class_name: interceptor_class_name.into(),
            override_args,
        }
    }

    pub fn kind(&self) -> InterceptKind {
        self.kind
    }

    pub fn class_matcher(&self) -> &str {
        &self.class_matcher
    }

    pub fn interceptor_class_name(&self) -> &str {
        &self.interceptor_class_name
    }

    pub fn override_args(&self) -> bool {
        self.override_args
    }

    /// Structural hash over everything that identifies the point
    pub fn compute_hash_code(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Name of the per-instance context field backing this point
    pub fn context_field_name(&self) -> String {
        format!("__apm_intercept_ctx_{:x}", self.compute_hash_code())
    }
}
