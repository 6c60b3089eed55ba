// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{borrow::Cow, collections::HashMap, fmt::Display, str::FromStr};

/// Source of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSourceOrigin {
    Default,
    EnvVar,
    Code,
}

#[derive(Debug, PartialEq)]
pub(crate) struct ConfigValue<T> {
    pub(crate) value: T,
    #[allow(unused)]
    pub(crate) origin: ConfigSourceOrigin,
}

#[allow(unused)]
#[derive(Debug, PartialEq)]
pub(crate) struct CompositeParseError {
    desired_type: &'static str,
    error: Cow<'static, str>,
    value: String,
    origin: ConfigSourceOrigin,
}

#[derive(Debug, PartialEq)]
pub(crate) struct CompositeSourceResult<T> {
    #[allow(unused)]
    pub name: &'static str,
    pub value: Option<ConfigValue<T>>,
    // Parse failures encountered before a valid value was found. Kept so
    // debug logging can surface them instead of silently eating typos.
    #[allow(unused)]
    pub errors: Vec<CompositeParseError>,
}

/// A single provider of raw configuration strings
pub trait ConfigurationSource {
    fn get(&self, key: &str) -> Option<String>;
    fn origin(&self) -> ConfigSourceOrigin;
}

/// Reads configuration from process environment variables
pub struct EnvSource;

impl ConfigurationSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn origin(&self) -> ConfigSourceOrigin {
        ConfigSourceOrigin::EnvVar
    }
}

/// A fixed key/value source, mostly for tests
pub struct MapSource {
    origin: ConfigSourceOrigin,
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new<K: Into<String>, V: Into<String>>(
        origin: ConfigSourceOrigin,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            origin,
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigurationSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn origin(&self) -> ConfigSourceOrigin {
        self.origin
    }
}

/// Compose multiple sources of configuration together.
///
/// The higher precedence sources are the first ones in the list.
pub struct CompositeSource {
    sources: Vec<Box<dyn ConfigurationSource>>,
}

impl CompositeSource {
    pub fn new() -> Self {
        CompositeSource {
            sources: Vec::new(),
        }
    }

    pub fn add_source<C: ConfigurationSource + 'static>(&mut self, source: C) {
        self.sources.push(Box::new(source));
    }

    pub fn default_sources() -> Self {
        let mut sources = Self::new();
        sources.add_source(EnvSource);
        sources
    }

    pub(crate) fn get(&self, name: &'static str) -> CompositeSourceResult<String> {
        self.get_parse(name)
    }

    /// Get a value from the configuration sources
    ///
    /// Iterates over sources in order of precedence and returns the first
    /// value that parses. Parse errors encountered on the way are returned
    /// alongside, associated with the source they came from.
    pub(crate) fn get_parse<T: FromStr<Err = impl Display>>(
        &self,
        name: &'static str,
    ) -> CompositeSourceResult<T> {
        let mut errors = Vec::new();
        for s in &self.sources {
            let raw = match s.get(name) {
                Some(raw) => raw,
                None => continue,
            };
            match raw.parse::<T>() {
                Ok(v) => {
                    return CompositeSourceResult {
                        name,
                        value: Some(ConfigValue {
                            value: v,
                            origin: s.origin(),
                        }),
                        errors,
                    };
                }
                Err(e) => errors.push(CompositeParseError {
                    desired_type: std::any::type_name::<T>(),
                    error: Cow::Owned(e.to_string()),
                    value: raw,
                    origin: s.origin(),
                }),
            }
        }
        CompositeSourceResult {
            name,
            value: None,
            errors,
        }
    }
}

impl Default for CompositeSource {
    fn default() -> Self {
        Self::new()
    }
}
