// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;

use thiserror::Error;

use crate::enhance::{Arguments, EnhancedInstance, MethodDescriptor, Object};

/// A failure inside an interceptor callback. The bridge logs and counts it;
/// it never reaches application code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InterceptorError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InterceptorError {
    pub fn msg(message: impl Into<String>) -> Self {
        InterceptorError::Failed(message.into())
    }
}

/// Outcome of `before_method`: continue into the original call, or skip it
/// and substitute a return value.
pub struct MethodInterceptResult {
    continue_call: bool,
    defered_return: Option<Object>,
}

impl MethodInterceptResult {
    pub fn new() -> Self {
        MethodInterceptResult {
            continue_call: true,
            defered_return: None,
        }
    }

    /// Skips the original call; `value` is returned to the caller instead.
    /// It must be of the intercepted method's return type, otherwise the
    /// bridge falls back to running the original call.
    pub fn defer_return(&mut self, value: Object) {
        self.continue_call = false;
        self.defered_return = Some(value);
    }

    pub fn is_continue(&self) -> bool {
        self.continue_call
    }

    pub(crate) fn take_defered_return(self) -> Option<Object> {
        self.defered_return
    }
}

impl Default for MethodInterceptResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Around advice for instance methods of an enhanced type.
///
/// `after_method` observes the return value in place through `Any`; it may
/// mutate it but cannot replace it with a value of another type. On the
/// error path it runs with `None` after `handle_method_exception`.
pub trait InstanceMethodsAroundInterceptor: Send + Sync {
    fn before_method(
        &self,
        target: &mut dyn EnhancedInstance,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        result: &mut MethodInterceptResult,
    ) -> Result<(), InterceptorError>;

    fn after_method(
        &self,
        target: &mut dyn EnhancedInstance,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        ret: Option<&mut (dyn Any + Send)>,
    ) -> Result<(), InterceptorError>;

    fn handle_method_exception(
        &self,
        target: &mut dyn EnhancedInstance,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        error: &(dyn std::error::Error + 'static),
    ) -> Result<(), InterceptorError>;
}

/// Around advice for static methods; same shape without a target instance
pub trait StaticMethodsAroundInterceptor: Send + Sync {
    fn before_method(
        &self,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        result: &mut MethodInterceptResult,
    ) -> Result<(), InterceptorError>;

    fn after_method(
        &self,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        ret: Option<&mut (dyn Any + Send)>,
    ) -> Result<(), InterceptorError>;

    fn handle_method_exception(
        &self,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        error: &(dyn std::error::Error + 'static),
    ) -> Result<(), InterceptorError>;
}

/// Runs right after an enhanced instance is constructed, typically to seed
/// its dynamic field
pub trait InstanceConstructorInterceptor: Send + Sync {
    fn on_construct(
        &self,
        target: &mut dyn EnhancedInstance,
        args: &mut Arguments<'_>,
    ) -> Result<(), InterceptorError>;
}
