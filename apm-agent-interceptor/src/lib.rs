// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The method interception bridge.
//!
//! Plugins implement around-advice interceptors; the bridge drives them
//! around the original call, isolating interceptor failures from application
//! code and metering the time spent inside them. An interceptor can skip the
//! original call and substitute a return value; an error from the original
//! call is always rethrown to the caller verbatim.

mod bridge;
mod enhance;
mod intercept_point;
mod interceptor;

pub use bridge::{ConstructorInter, InstanceMethodsInter, StaticMethodsInter};
pub use enhance::{Arguments, EnhancedInstance, MethodDescriptor, Object, ReturnValue};
pub use intercept_point::{InterceptKind, InterceptPoint};
pub use interceptor::{
    InstanceConstructorInterceptor, InstanceMethodsAroundInterceptor, InterceptorError,
    MethodInterceptResult, StaticMethodsAroundInterceptor,
};
