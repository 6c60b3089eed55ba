// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{any::Any, fmt};

/// An opaque value crossing the interception boundary
pub type Object = Box<dyn Any + Send>;

/// The return value slot interceptors observe after the original call
pub type ReturnValue = Option<Object>;

/// Identity of an intercepted method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    class_name: &'static str,
    method_name: &'static str,
    arg_type_names: &'static [&'static str],
}

impl MethodDescriptor {
    pub const fn new(
        class_name: &'static str,
        method_name: &'static str,
        arg_type_names: &'static [&'static str],
    ) -> Self {
        MethodDescriptor {
            class_name,
            method_name,
            arg_type_names,
        }
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    pub fn method_name(&self) -> &'static str {
        self.method_name
    }

    pub fn arg_type_names(&self) -> &'static [&'static str] {
        self.arg_type_names
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.method_name)
    }
}

/// The arguments of an intercepted call. Interceptors may replace individual
/// arguments in place before the original call runs.
pub struct Arguments<'a> {
    values: &'a mut [Object],
}

impl<'a> Arguments<'a> {
    pub fn new(values: &'a mut [Object]) -> Self {
        Arguments { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&(dyn Any + Send)> {
        self.values.get(index).map(|v| &**v)
    }

    pub fn get_as<T: 'static>(&self, index: usize) -> Option<&T> {
        self.values.get(index).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut_as<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        self.values
            .get_mut(index)
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Replaces the argument at `index`. Out of range indexes are ignored.
    pub fn set(&mut self, index: usize, value: Object) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }
}

/// The contract of an instrumented target object: it carries one dynamic
/// slot where interceptors stash per-instance context across calls.
pub trait EnhancedInstance: Send {
    fn dynamic_field(&self) -> Option<&(dyn Any + Send)>;
    fn set_dynamic_field(&mut self, value: Object);
}
