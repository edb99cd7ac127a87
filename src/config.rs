//! Allocator configuration, optionally read from the environment.
//!
//! | variable                     | meaning                                  |
//! |------------------------------|------------------------------------------|
//! | `TAGHEAP_DIAGNOSTICS`        | keep a live registry and call sites      |
//! | `TAGHEAP_REGISTRY_INITIAL`   | registry slots allocated up front        |
//! | `TAGHEAP_REGISTRY_INCREMENT` | slots added each time the registry fills |

use std::env;

use log::warn;
use once_cell::sync::Lazy;

use crate::error::ConfigError;

pub const DIAGNOSTICS_VAR: &str = "TAGHEAP_DIAGNOSTICS";
pub const REGISTRY_INITIAL_VAR: &str = "TAGHEAP_REGISTRY_INITIAL";
pub const REGISTRY_INCREMENT_VAR: &str = "TAGHEAP_REGISTRY_INCREMENT";

/// Registry slots added per growth step (and allocated up front) unless
/// configured otherwise.
pub const DEFAULT_REGISTRY_INCREMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocConfig {
    /// Track every live block with its call site, so that leaks can be
    /// listed one by one. Without this only the counters are kept.
    pub diagnostics: bool,
    pub initial_registry_slots: usize,
    pub registry_increment: usize,
}

impl Default for AllocConfig {
    /// Diagnostics follow `debug_assertions`.
    fn default() -> Self {
        Self {
            diagnostics: cfg!(debug_assertions),
            initial_registry_slots: DEFAULT_REGISTRY_INCREMENT,
            registry_increment: DEFAULT_REGISTRY_INCREMENT,
        }
    }
}

/// The environment config, read once. Bad values are logged and replaced by
/// the defaults.
pub static ENV_CONFIG: Lazy<AllocConfig> = Lazy::new(|| {
    AllocConfig::from_env().unwrap_or_else(|err| {
        warn!("ignoring allocator environment: {err}");
        AllocConfig::default()
    })
});

impl AllocConfig {
    /// Counters only.
    pub fn plain() -> Self {
        Self {
            diagnostics: false,
            ..Self::default()
        }
    }

    /// Counters plus the live registry.
    pub fn diagnostic() -> Self {
        Self {
            diagnostics: true,
            ..Self::default()
        }
    }

    pub fn with_registry_increment(mut self, increment: usize) -> Self {
        self.registry_increment = increment;
        self
    }

    pub fn with_initial_registry_slots(mut self, slots: usize) -> Self {
        self.initial_registry_slots = slots;
        self
    }

    /// The defaults, overridden by whatever is set in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(DIAGNOSTICS_VAR) {
            config.diagnostics = parse_flag(DIAGNOSTICS_VAR, value)?;
        }
        if let Some(value) = lookup(REGISTRY_INITIAL_VAR) {
            config.initial_registry_slots = parse_count(REGISTRY_INITIAL_VAR, value)?;
        }
        if let Some(value) = lookup(REGISTRY_INCREMENT_VAR) {
            config.registry_increment = parse_count(REGISTRY_INCREMENT_VAR, value)?;
        }
        Ok(config)
    }
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidFlag { var, value }),
    }
}

fn parse_count(var: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidCount { var, value }),
    }
}
