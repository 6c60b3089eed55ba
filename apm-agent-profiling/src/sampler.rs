// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The host-runtime boundary of profiling.
//!
//! Capturing the stack of another thread is runtime specific; embedders
//! provide a sampler per profiled thread and the profiling machinery stays
//! host agnostic.

/// Captures the current stack of the thread this sampler was created for.
/// Returns None when the stack cannot be walked right now.
pub trait StackSampler: Send + Sync {
    fn capture(&self) -> Option<Vec<String>>;
}

/// Creates a sampler bound to the calling thread. Invoked on the application
/// thread at the moment profiling is attempted for its context.
pub trait StackSamplerFactory: Send + Sync {
    fn sampler_for_current_thread(&self) -> Box<dyn StackSampler>;
}

/// Serves canned frames, for tests
#[cfg(any(test, feature = "test-utils"))]
pub struct CannedStackSampler {
    pub frames: Vec<String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl StackSampler for CannedStackSampler {
    fn capture(&self) -> Option<Vec<String>> {
        Some(self.frames.clone())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub struct CannedStackSamplerFactory {
    pub frames: Vec<String>,
}

#[cfg(any(test, feature = "test-utils"))]
impl StackSamplerFactory for CannedStackSamplerFactory {
    fn sampler_for_current_thread(&self) -> Box<dyn StackSampler> {
        Box::new(CannedStackSampler {
            frames: self.frames.clone(),
        })
    }
}
