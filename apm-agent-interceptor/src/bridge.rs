// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bridges between instrumented call sites and plugin interceptors.
//!
//! The bridge guarantees that whatever an interceptor does, the intercepted
//! call behaves as the application wrote it: interceptor failures are logged
//! and counted, never propagated; an error from the original call reaches
//! the caller verbatim; `after_method` runs on both the success and the
//! error path. The only sanctioned deviation is `defer_return`, which skips
//! the original call on purpose.

use std::{
    any::Any,
    sync::Arc,
    time::{Duration, Instant},
};

use apm_agent::{apm_error, so11y::AgentSo11y};

use crate::{
    enhance::{Arguments, EnhancedInstance, MethodDescriptor},
    interceptor::{
        InstanceConstructorInterceptor, InstanceMethodsAroundInterceptor, InterceptorError,
        MethodInterceptResult, StaticMethodsAroundInterceptor,
    },
};

const INTER_TYPE_INSTANCE: &str = "instance";
const INTER_TYPE_STATIC: &str = "static";
const INTER_TYPE_CONSTRUCTOR: &str = "constructor";

/// Drives an [`InstanceMethodsAroundInterceptor`] around instance method
/// calls of an enhanced type
pub struct InstanceMethodsInter {
    plugin_name: String,
    interceptor: Arc<dyn InstanceMethodsAroundInterceptor>,
    so11y: Arc<AgentSo11y>,
}

impl InstanceMethodsInter {
    pub fn new(
        plugin_name: impl Into<String>,
        interceptor: Arc<dyn InstanceMethodsAroundInterceptor>,
        so11y: Arc<AgentSo11y>,
    ) -> Self {
        InstanceMethodsInter {
            plugin_name: plugin_name.into(),
            interceptor,
            so11y,
        }
    }

    /// Runs the intercepted call. `zuper` is the original method body.
    pub fn intercept<R, E>(
        &self,
        target: &mut dyn EnhancedInstance,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        zuper: impl FnOnce(&mut dyn EnhancedInstance, &mut Arguments<'_>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        R: Send + 'static,
        E: std::error::Error + 'static,
    {
        let mut time_cost = Duration::ZERO;

        let mut intercept_result = MethodInterceptResult::new();
        let started = Instant::now();
        if let Err(e) = self
            .interceptor
            .before_method(target, method, args, &mut intercept_result)
        {
            self.record_failure("before_method", method, INTER_TYPE_INSTANCE, &e);
        }
        time_cost += started.elapsed();

        let mut outcome: Result<R, E> = if intercept_result.is_continue() {
            zuper(target, args)
        } else {
            match intercept_result.take_defered_return() {
                Some(substitute) => match substitute.downcast::<R>() {
                    Ok(value) => Ok(*value),
                    Err(_) => {
                        self.record_failure(
                            "before_method",
                            method,
                            INTER_TYPE_INSTANCE,
                            &InterceptorError::msg(
                                "substitute return value is not of the method's return type",
                            ),
                        );
                        zuper(target, args)
                    }
                },
                None => {
                    self.record_failure(
                        "before_method",
                        method,
                        INTER_TYPE_INSTANCE,
                        &InterceptorError::msg("original call skipped without a substitute"),
                    );
                    zuper(target, args)
                }
            }
        };

        match &mut outcome {
            Ok(value) => {
                let started = Instant::now();
                if let Err(e) = self.interceptor.after_method(
                    target,
                    method,
                    args,
                    Some(value as &mut (dyn Any + Send)),
                ) {
                    self.record_failure("after_method", method, INTER_TYPE_INSTANCE, &e);
                }
                time_cost += started.elapsed();
            }
            Err(error) => {
                let started = Instant::now();
                if let Err(e) =
                    self.interceptor
                        .handle_method_exception(target, method, args, &*error)
                {
                    self.record_failure(
                        "handle_method_exception",
                        method,
                        INTER_TYPE_INSTANCE,
                        &e,
                    );
                }
                if let Err(e) = self.interceptor.after_method(target, method, args, None) {
                    self.record_failure("after_method", method, INTER_TYPE_INSTANCE, &e);
                }
                time_cost += started.elapsed();
            }
        }

        self.so11y
            .record_interceptor_time_cost(time_cost.as_nanos() as f64);
        outcome
    }

    fn record_failure(
        &self,
        stage: &str,
        method: &MethodDescriptor,
        inter_type: &'static str,
        error: &InterceptorError,
    ) {
        apm_error!(
            "plugin {} interceptor failed in {stage} around {method}: {error}",
            self.plugin_name
        );
        self.so11y
            .record_interceptor_error(&self.plugin_name, inter_type);
    }
}

/// Drives a [`StaticMethodsAroundInterceptor`] around static method calls
pub struct StaticMethodsInter {
    plugin_name: String,
    interceptor: Arc<dyn StaticMethodsAroundInterceptor>,
    so11y: Arc<AgentSo11y>,
}

impl StaticMethodsInter {
    pub fn new(
        plugin_name: impl Into<String>,
        interceptor: Arc<dyn StaticMethodsAroundInterceptor>,
        so11y: Arc<AgentSo11y>,
    ) -> Self {
        StaticMethodsInter {
            plugin_name: plugin_name.into(),
            interceptor,
            so11y,
        }
    }

    pub fn intercept<R, E>(
        &self,
        method: &MethodDescriptor,
        args: &mut Arguments<'_>,
        zuper: impl FnOnce(&mut Arguments<'_>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        R: Send + 'static,
        E: std::error::Error + 'static,
    {
        let mut time_cost = Duration::ZERO;

        let mut intercept_result = MethodInterceptResult::new();
        let started = Instant::now();
        if let Err(e) = self
            .interceptor
            .before_method(method, args, &mut intercept_result)
        {
            self.record_failure("before_method", method, &e);
        }
        time_cost += started.elapsed();

        let mut outcome: Result<R, E> = if intercept_result.is_continue() {
            zuper(args)
        } else {
            match intercept_result.take_defered_return() {
                Some(substitute) => match substitute.downcast::<R>() {
                    Ok(value) => Ok(*value),
                    Err(_) => {
                        self.record_failure(
                            "before_method",
                            method,
                            &InterceptorError::msg(
                                "substitute return value is not of the method's return type",
                            ),
                        );
                        zuper(args)
                    }
                },
                None => {
                    self.record_failure(
                        "before_method",
                        method,
                        &InterceptorError::msg("original call skipped without a substitute"),
                    );
                    zuper(args)
                }
            }
        };

        match &mut outcome {
            Ok(value) => {
                let started = Instant::now();
                if let Err(e) =
                    self.interceptor
                        .after_method(method, args, Some(value as &mut (dyn Any + Send)))
                {
                    self.record_failure("after_method", method, &e);
                }
                time_cost += started.elapsed();
            }
            Err(error) => {
                let started = Instant::now();
                if let Err(e) = self.interceptor.handle_method_exception(method, args, &*error) {
                    self.record_failure("handle_method_exception", method, &e);
                }
                if let Err(e) = self.interceptor.after_method(method, args, None) {
                    self.record_failure("after_method", method, &e);
                }
                time_cost += started.elapsed();
            }
        }

        self.so11y
            .record_interceptor_time_cost(time_cost.as_nanos() as f64);
        outcome
    }

    fn record_failure(&self, stage: &str, method: &MethodDescriptor, error: &InterceptorError) {
        apm_error!(
            "plugin {} interceptor failed in {stage} around {method}: {error}",
            self.plugin_name
        );
        self.so11y
            .record_interceptor_error(&self.plugin_name, INTER_TYPE_STATIC);
    }
}

/// Drives an [`InstanceConstructorInterceptor`] right after construction of
/// an enhanced instance
pub struct ConstructorInter {
    plugin_name: String,
    interceptor: Arc<dyn InstanceConstructorInterceptor>,
    so11y: Arc<AgentSo11y>,
}

impl ConstructorInter {
    pub fn new(
        plugin_name: impl Into<String>,
        interceptor: Arc<dyn InstanceConstructorInterceptor>,
        so11y: Arc<AgentSo11y>,
    ) -> Self {
        ConstructorInter {
            plugin_name: plugin_name.into(),
            interceptor,
            so11y,
        }
    }

    /// Runs `on_construct` against the freshly built instance. Failures are
    /// isolated; construction itself already happened.
    pub fn intercept(&self, target: &mut dyn EnhancedInstance, args: &mut Arguments<'_>) {
        let started = Instant::now();
        if let Err(e) = self.interceptor.on_construct(target, args) {
            apm_error!(
                "plugin {} constructor interceptor failed: {e}",
                self.plugin_name
            );
            self.so11y
                .record_interceptor_error(&self.plugin_name, INTER_TYPE_CONSTRUCTOR);
        }
        self.so11y
            .record_interceptor_time_cost(started.elapsed().as_nanos() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_agent::meter::MeterRegistry;
    use apm_agent::so11y::CONTEXT_PERFORMANCE_STEPS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::enhance::Object;

    const METHOD: MethodDescriptor = MethodDescriptor::new("HttpClient", "execute", &["Request"]);

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("{0}")]
    struct AppError(String);

    #[derive(Default)]
    struct Target {
        field: Option<Object>,
    }

    impl EnhancedInstance for Target {
        fn dynamic_field(&self) -> Option<&(dyn Any + Send)> {
            self.field.as_ref().map(|b| &**b)
        }

        fn set_dynamic_field(&mut self, value: Object) {
            self.field = Some(value);
        }
    }

    fn so11y() -> Arc<AgentSo11y> {
        Arc::new(AgentSo11y::new(MeterRegistry::new()).unwrap())
    }

    fn interceptor_error_count(so11y: &AgentSo11y) -> u64 {
        so11y
            .registry()
            .counters()
            .iter()
            .filter(|(id, _)| id.name() == "interceptor_error_counter")
            .map(|(_, count)| count)
            .sum()
    }

    /// Counts callback invocations and fails in the configured stages
    #[derive(Default)]
    struct ChaosInterceptor {
        fail_before: bool,
        fail_after: bool,
        fail_handle: bool,
        befores: AtomicUsize,
        afters: AtomicUsize,
        handles: AtomicUsize,
    }

    impl InstanceMethodsAroundInterceptor for ChaosInterceptor {
        fn before_method(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _result: &mut MethodInterceptResult,
        ) -> Result<(), InterceptorError> {
            self.befores.fetch_add(1, Ordering::SeqCst);
            if self.fail_before {
                return Err(InterceptorError::msg("before blew up"));
            }
            Ok(())
        }

        fn after_method(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _ret: Option<&mut (dyn Any + Send)>,
        ) -> Result<(), InterceptorError> {
            self.afters.fetch_add(1, Ordering::SeqCst);
            if self.fail_after {
                return Err(InterceptorError::msg("after blew up"));
            }
            Ok(())
        }

        fn handle_method_exception(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _error: &(dyn std::error::Error + 'static),
        ) -> Result<(), InterceptorError> {
            self.handles.fetch_add(1, Ordering::SeqCst);
            if self.fail_handle {
                return Err(InterceptorError::msg("handler blew up"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_interceptor_failures_do_not_affect_the_call() {
        let so11y = so11y();
        let interceptor = Arc::new(ChaosInterceptor {
            fail_before: true,
            fail_after: true,
            ..Default::default()
        });
        let bridge =
            InstanceMethodsInter::new("http-plugin", Arc::clone(&interceptor) as _, Arc::clone(&so11y));

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, _| Ok(42));

        assert_eq!(outcome.unwrap(), 42);
        assert_eq!(interceptor.befores.load(Ordering::SeqCst), 1);
        assert_eq!(interceptor.afters.load(Ordering::SeqCst), 1);
        assert_eq!(interceptor_error_count(&so11y), 2);
    }

    #[test]
    fn test_original_error_is_rethrown_verbatim() {
        let so11y = so11y();
        let interceptor = Arc::new(ChaosInterceptor::default());
        let bridge =
            InstanceMethodsInter::new("http-plugin", Arc::clone(&interceptor) as _, so11y);

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, _| {
                Err(AppError("boom".to_string()))
            });

        assert_eq!(outcome.unwrap_err(), AppError("boom".to_string()));
        assert_eq!(interceptor.handles.load(Ordering::SeqCst), 1);
        // after_method still ran, on the error path
        assert_eq!(interceptor.afters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_exception_handler_still_rethrows() {
        let so11y = so11y();
        let interceptor = Arc::new(ChaosInterceptor {
            fail_handle: true,
            ..Default::default()
        });
        let bridge =
            InstanceMethodsInter::new("http-plugin", Arc::clone(&interceptor) as _, Arc::clone(&so11y));

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, _| {
                Err(AppError("boom".to_string()))
            });

        assert_eq!(outcome.unwrap_err(), AppError("boom".to_string()));
        assert_eq!(interceptor_error_count(&so11y), 1);
    }

    struct SkippingInterceptor {
        substitute: fn() -> Object,
    }

    impl InstanceMethodsAroundInterceptor for SkippingInterceptor {
        fn before_method(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            result: &mut MethodInterceptResult,
        ) -> Result<(), InterceptorError> {
            result.defer_return((self.substitute)());
            Ok(())
        }

        fn after_method(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _ret: Option<&mut (dyn Any + Send)>,
        ) -> Result<(), InterceptorError> {
            Ok(())
        }

        fn handle_method_exception(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _error: &(dyn std::error::Error + 'static),
        ) -> Result<(), InterceptorError> {
            Ok(())
        }
    }

    #[test]
    fn test_defer_return_skips_the_original_call() {
        let bridge = InstanceMethodsInter::new(
            "cache-plugin",
            Arc::new(SkippingInterceptor {
                substitute: || Box::new(99_i32),
            }) as _,
            so11y(),
        );

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);
        let mut original_called = false;

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, _| {
                original_called = true;
                Ok(1)
            });

        assert_eq!(outcome.unwrap(), 99);
        assert!(!original_called);
    }

    #[test]
    fn test_mistyped_substitute_falls_back_to_original() {
        let so11y = so11y();
        let bridge = InstanceMethodsInter::new(
            "cache-plugin",
            Arc::new(SkippingInterceptor {
                substitute: || Box::new("not an i32".to_string()),
            }) as _,
            Arc::clone(&so11y),
        );

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);
        let mut original_called = false;

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, _| {
                original_called = true;
                Ok(1)
            });

        assert_eq!(outcome.unwrap(), 1);
        assert!(original_called);
        assert_eq!(interceptor_error_count(&so11y), 1);
    }

    struct MutatingInterceptor;

    impl InstanceMethodsAroundInterceptor for MutatingInterceptor {
        fn before_method(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            args: &mut Arguments<'_>,
            _result: &mut MethodInterceptResult,
        ) -> Result<(), InterceptorError> {
            // Override the first argument before the original call
            args.set(0, Box::new(10_i32));
            Ok(())
        }

        fn after_method(
            &self,
            target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            ret: Option<&mut (dyn Any + Send)>,
        ) -> Result<(), InterceptorError> {
            target.set_dynamic_field(Box::new("seen".to_string()));
            if let Some(ret) = ret.and_then(|r| r.downcast_mut::<i32>()) {
                *ret += 1;
            }
            Ok(())
        }

        fn handle_method_exception(
            &self,
            _target: &mut dyn EnhancedInstance,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _error: &(dyn std::error::Error + 'static),
        ) -> Result<(), InterceptorError> {
            Ok(())
        }
    }

    #[test]
    fn test_argument_and_return_overrides() {
        let so11y = so11y();
        let bridge = InstanceMethodsInter::new(
            "mutate-plugin",
            Arc::new(MutatingInterceptor) as _,
            Arc::clone(&so11y),
        );

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![Box::new(1_i32)];
        let mut args = Arguments::new(&mut raw);

        let outcome: Result<i32, AppError> =
            bridge.intercept(&mut target, &METHOD, &mut args, |_, args| {
                Ok(*args.get_as::<i32>(0).unwrap() * 2)
            });

        // Argument overridden to 10, doubled to 20, bumped to 21 after
        assert_eq!(outcome.unwrap(), 21);
        assert!(target.dynamic_field().is_some());
        assert_eq!(interceptor_error_count(&so11y), 0);

        // Interceptor time was metered
        let histogram = so11y
            .registry()
            .histogram("tracing_context_performance")
            .steps(CONTEXT_PERFORMANCE_STEPS.to_vec())
            .build()
            .unwrap();
        assert_eq!(histogram.observed_count(), 1);
    }

    struct StaticProbe {
        befores: AtomicUsize,
    }

    impl StaticMethodsAroundInterceptor for StaticProbe {
        fn before_method(
            &self,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _result: &mut MethodInterceptResult,
        ) -> Result<(), InterceptorError> {
            self.befores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn after_method(
            &self,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _ret: Option<&mut (dyn Any + Send)>,
        ) -> Result<(), InterceptorError> {
            Ok(())
        }

        fn handle_method_exception(
            &self,
            _method: &MethodDescriptor,
            _args: &mut Arguments<'_>,
            _error: &(dyn std::error::Error + 'static),
        ) -> Result<(), InterceptorError> {
            Ok(())
        }
    }

    #[test]
    fn test_static_bridge_round_trip() {
        let probe = Arc::new(StaticProbe {
            befores: AtomicUsize::new(0),
        });
        let bridge = StaticMethodsInter::new("static-plugin", Arc::clone(&probe) as _, so11y());

        let mut raw: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut raw);
        let outcome: Result<&'static str, AppError> =
            bridge.intercept(&METHOD, &mut args, |_| Ok("done"));

        assert_eq!(outcome.unwrap(), "done");
        assert_eq!(probe.befores.load(Ordering::SeqCst), 1);
    }

    struct SeedingConstructor;

    impl InstanceConstructorInterceptor for SeedingConstructor {
        fn on_construct(
            &self,
            target: &mut dyn EnhancedInstance,
            args: &mut Arguments<'_>,
        ) -> Result<(), InterceptorError> {
            let peer = args
                .get_as::<String>(0)
                .cloned()
                .ok_or_else(|| InterceptorError::msg("missing peer argument"))?;
            target.set_dynamic_field(Box::new(peer));
            Ok(())
        }
    }

    #[test]
    fn test_constructor_seeds_dynamic_field() {
        let so11y = so11y();
        let bridge =
            ConstructorInter::new("client-plugin", Arc::new(SeedingConstructor) as _, Arc::clone(&so11y));

        let mut target = Target::default();
        let mut raw: Vec<Object> = vec![Box::new("db:5432".to_string())];
        let mut args = Arguments::new(&mut raw);
        bridge.intercept(&mut target, &mut args);

        let field = target
            .dynamic_field()
            .and_then(|f| f.downcast_ref::<String>())
            .unwrap();
        assert_eq!(field, "db:5432");

        // A failing constructor interceptor is isolated and counted
        let mut empty: Vec<Object> = vec![];
        let mut args = Arguments::new(&mut empty);
        bridge.intercept(&mut target, &mut args);
        assert_eq!(interceptor_error_count(&so11y), 1);
    }
}
