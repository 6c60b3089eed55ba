// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{sync::OnceLock, time::Duration};

mod sources;
pub use sources::{CompositeSource, ConfigSourceOrigin, ConfigurationSource, MapSource};

pub const AGENT_VERSION: &str = "0.1.0";

/// Configuration for the agent core.
///
/// This represents the finalized configuration; values are pulled from the
/// environment (and any extra sources) and may be overridden in code.
///
/// # Usage
/// ```
/// use apm_agent::Config;
///
/// // This pulls configuration from the environment and other sources
/// let mut builder = Config::builder();
///
/// // Manual overrides
/// builder
///     .set_service_name("my-service".to_string())
///     .set_span_limit_per_segment(100);
///
/// // Finalize the configuration
/// let config = builder.build();
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    // # Global
    instance_id: &'static str,

    // # Service tagging
    service_name: String,
    instance_name: String,

    // # Tracing
    /// Negative or zero means sampling every segment
    sample_n_per_3_secs: i32,
    /// The max number of spans in a single segment; spans created beyond the
    /// limit are no-ops
    span_limit_per_segment: i32,
    /// Force sampling of every trace, whatever the sampler says
    keep_tracing: bool,

    // # Correlation
    correlation_max_key_count: usize,
    correlation_max_value_size: usize,

    // # Profiling
    profile_max_parallel: usize,
    profile_max_accept_sub_parallel: usize,
    profile_dump_period: Duration,
    profile_max_duration: Duration,

    /// The log level for the agent
    log_level: crate::log::LevelFilter,
}

impl Config {
    fn from_sources(sources: &CompositeSource) -> Self {
        let default = Config::default();

        // Drops parse errors collected by the composite source; a bad value
        // falls back to the default instead of failing agent boot.
        fn to_val<T>(res: sources::CompositeSourceResult<T>) -> Option<T> {
            res.value.map(|v| v.value)
        }

        Self {
            instance_id: default.instance_id,
            service_name: to_val(sources.get("APM_SERVICE_NAME")).unwrap_or(default.service_name),
            instance_name: to_val(sources.get("APM_INSTANCE_NAME"))
                .unwrap_or(default.instance_name),
            sample_n_per_3_secs: to_val(sources.get_parse("APM_SAMPLE_N_PER_3_SECS"))
                .unwrap_or(default.sample_n_per_3_secs),
            span_limit_per_segment: to_val(sources.get_parse("APM_SPAN_LIMIT_PER_SEGMENT"))
                .unwrap_or(default.span_limit_per_segment),
            keep_tracing: to_val(sources.get_parse("APM_KEEP_TRACING"))
                .unwrap_or(default.keep_tracing),
            correlation_max_key_count: to_val(sources.get_parse("APM_CORRELATION_MAX_KEY_COUNT"))
                .unwrap_or(default.correlation_max_key_count),
            correlation_max_value_size: to_val(sources.get_parse("APM_CORRELATION_MAX_VALUE_SIZE"))
                .unwrap_or(default.correlation_max_value_size),
            profile_max_parallel: to_val(sources.get_parse("APM_PROFILE_MAX_PARALLEL"))
                .unwrap_or(default.profile_max_parallel),
            profile_max_accept_sub_parallel: to_val(
                sources.get_parse("APM_PROFILE_MAX_ACCEPT_SUB_PARALLEL"),
            )
            .unwrap_or(default.profile_max_accept_sub_parallel),
            profile_dump_period: to_val(sources.get_parse("APM_PROFILE_DUMP_PERIOD_MS"))
                .map(Duration::from_millis)
                .unwrap_or(default.profile_dump_period),
            profile_max_duration: to_val(sources.get_parse("APM_PROFILE_MAX_DURATION_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(default.profile_max_duration),
            log_level: to_val(sources.get_parse("APM_LOG_LEVEL")).unwrap_or(default.log_level),
        }
    }

    fn builder_with_sources(sources: &CompositeSource) -> ConfigBuilder {
        ConfigBuilder {
            config: Config::from_sources(sources),
        }
    }

    /// Creates a new builder to override detected configuration
    pub fn builder() -> ConfigBuilder {
        Self::builder_with_sources(&CompositeSource::default_sources())
    }

    /// Creates a builder over explicit sources, for tests mostly
    pub fn builder_from(sources: &CompositeSource) -> ConfigBuilder {
        Self::builder_with_sources(sources)
    }

    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn sample_n_per_3_secs(&self) -> i32 {
        self.sample_n_per_3_secs
    }

    pub fn span_limit_per_segment(&self) -> i32 {
        self.span_limit_per_segment
    }

    pub fn keep_tracing(&self) -> bool {
        self.keep_tracing
    }

    pub fn correlation_max_key_count(&self) -> usize {
        self.correlation_max_key_count
    }

    pub fn correlation_max_value_size(&self) -> usize {
        self.correlation_max_value_size
    }

    pub fn profile_max_parallel(&self) -> usize {
        self.profile_max_parallel
    }

    pub fn profile_max_accept_sub_parallel(&self) -> usize {
        self.profile_max_accept_sub_parallel
    }

    pub fn profile_dump_period(&self) -> Duration {
        self.profile_dump_period
    }

    pub fn profile_max_duration(&self) -> Duration {
        self.profile_max_duration
    }

    pub fn log_level(&self) -> crate::log::LevelFilter {
        self.log_level
    }

    fn process_instance_id() -> &'static str {
        static INSTANCE_ID: OnceLock<String> = OnceLock::new();
        INSTANCE_ID.get_or_init(|| uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_id: Config::process_instance_id(),
            service_name: "unnamed-rust-service".to_string(),
            instance_name: format!("{}@rust", Config::process_instance_id()),
            sample_n_per_3_secs: -1,
            span_limit_per_segment: 300,
            keep_tracing: false,
            correlation_max_key_count: 3,
            correlation_max_value_size: 128,
            profile_max_parallel: 5,
            profile_max_accept_sub_parallel: 5,
            profile_dump_period: Duration::from_millis(10),
            profile_max_duration: Duration::from_secs(10 * 60),
            log_level: crate::log::LevelFilter::default(),
        }
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn set_service_name(&mut self, service_name: String) -> &mut Self {
        self.config.service_name = service_name;
        self
    }

    pub fn set_instance_name(&mut self, instance_name: String) -> &mut Self {
        self.config.instance_name = instance_name;
        self
    }

    pub fn set_sample_n_per_3_secs(&mut self, n: i32) -> &mut Self {
        self.config.sample_n_per_3_secs = n;
        self
    }

    pub fn set_span_limit_per_segment(&mut self, limit: i32) -> &mut Self {
        self.config.span_limit_per_segment = limit;
        self
    }

    pub fn set_keep_tracing(&mut self, keep_tracing: bool) -> &mut Self {
        self.config.keep_tracing = keep_tracing;
        self
    }

    pub fn set_correlation_max_key_count(&mut self, count: usize) -> &mut Self {
        self.config.correlation_max_key_count = count;
        self
    }

    pub fn set_correlation_max_value_size(&mut self, size: usize) -> &mut Self {
        self.config.correlation_max_value_size = size;
        self
    }

    pub fn set_profile_max_parallel(&mut self, max_parallel: usize) -> &mut Self {
        self.config.profile_max_parallel = max_parallel;
        self
    }

    pub fn set_profile_max_accept_sub_parallel(&mut self, max_sub: usize) -> &mut Self {
        self.config.profile_max_accept_sub_parallel = max_sub;
        self
    }

    pub fn set_profile_dump_period(&mut self, period: Duration) -> &mut Self {
        self.config.profile_dump_period = period;
        self
    }

    pub fn set_profile_max_duration(&mut self, duration: Duration) -> &mut Self {
        self.config.profile_max_duration = duration;
        self
    }

    pub fn set_log_level(&mut self, level: crate::log::LevelFilter) -> &mut Self {
        self.config.log_level = level;
        self
    }

    pub fn build(&mut self) -> Config {
        crate::log::set_max_level(self.config.log_level);
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder_from(&CompositeSource::new()).build();

        assert_eq!(config.service_name(), "unnamed-rust-service");
        assert_eq!(config.sample_n_per_3_secs(), -1);
        assert_eq!(config.span_limit_per_segment(), 300);
        assert!(!config.keep_tracing());
        assert_eq!(config.profile_max_parallel(), 5);
        assert_eq!(config.profile_max_accept_sub_parallel(), 5);
    }

    #[test]
    fn test_from_sources_with_overrides() {
        let mut sources = CompositeSource::new();
        sources.add_source(MapSource::new(
            ConfigSourceOrigin::EnvVar,
            [
                ("APM_SERVICE_NAME", "billing"),
                ("APM_SPAN_LIMIT_PER_SEGMENT", "50"),
                ("APM_PROFILE_MAX_PARALLEL", "2"),
                ("APM_PROFILE_DUMP_PERIOD_MS", "25"),
                ("APM_KEEP_TRACING", "true"),
            ],
        ));

        let config = Config::builder_from(&sources).build();

        assert_eq!(config.service_name(), "billing");
        assert_eq!(config.span_limit_per_segment(), 50);
        assert_eq!(config.profile_max_parallel(), 2);
        assert_eq!(config.profile_dump_period(), Duration::from_millis(25));
        assert!(config.keep_tracing());
    }

    #[test]
    fn test_unparsable_value_falls_back_to_default() {
        let mut sources = CompositeSource::new();
        sources.add_source(MapSource::new(
            ConfigSourceOrigin::EnvVar,
            [("APM_SPAN_LIMIT_PER_SEGMENT", "not-a-number")],
        ));

        let config = Config::builder_from(&sources).build();

        assert_eq!(config.span_limit_per_segment(), 300);
    }

    #[test]
    fn test_builder_overrides_sources() {
        let mut sources = CompositeSource::new();
        sources.add_source(MapSource::new(
            ConfigSourceOrigin::EnvVar,
            [("APM_SERVICE_NAME", "from-env")],
        ));

        let mut builder = Config::builder_from(&sources);
        builder.set_service_name("from-code".to_string());
        let config = builder.build();

        assert_eq!(config.service_name(), "from-code");
    }
}
