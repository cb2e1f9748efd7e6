//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Environment Variables
//!
//! - `FIL_STACK_SIZE` - usable bytes per fiber stack
//! - `FIL_MAX_EVENTS` - epoll events drained per reactor wakeup
//! - `FIL_MAX_IDLE_WAIT_MS` - cap on a single epoll wait
//! - `FIL_CONNECT_TIMEOUT_MS` - default timeout of hooked connect()
//! - `FIL_DEBUG` - verbose dispatch logging

use filament_core::env::{env_get, env_get_bool};

mod defaults {
    pub const STACK_SIZE: usize = 128 * 1024;
    pub const MAX_EVENTS: usize = 256;
    pub const MAX_IDLE_WAIT_MS: u64 = 5000;
    pub const CONNECT_TIMEOUT_MS: u64 = u64::MAX;
    pub const DEBUG_LOGGING: bool = false;
}

/// Runtime configuration with builder-style overrides
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable bytes per fiber stack
    pub stack_size: usize,
    /// Epoll events drained per reactor wakeup
    pub max_events: usize,
    /// Cap on a single multiplexer wait, so timers and shutdown are
    /// observed even without fd activity
    pub max_idle_wait_ms: u64,
    /// Default timeout of hooked connect(); `u64::MAX` waits forever
    pub connect_timeout_ms: u64,
    /// Verbose dispatch logging
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults with `FIL_*` environment overrides applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("FIL_STACK_SIZE", defaults::STACK_SIZE),
            max_events: env_get("FIL_MAX_EVENTS", defaults::MAX_EVENTS),
            max_idle_wait_ms: env_get("FIL_MAX_IDLE_WAIT_MS", defaults::MAX_IDLE_WAIT_MS),
            connect_timeout_ms: env_get("FIL_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            debug_logging: env_get_bool("FIL_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Plain compile-time defaults, no environment involved
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            max_idle_wait_ms: defaults::MAX_IDLE_WAIT_MS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_idle_wait_ms(mut self, ms: u64) -> Self {
        self.max_idle_wait_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Reject configurations the runtime cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16 KiB"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_idle_wait_ms == 0 {
            return Err(ConfigError::InvalidValue("max_idle_wait_ms must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack_size, 128 * 1024);
        assert_eq!(config.max_idle_wait_ms, 5000);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .stack_size(256 * 1024)
            .max_events(64)
            .connect_timeout_ms(3000);
        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.max_events, 64);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_validation_rejects_tiny_stack() {
        let config = RuntimeConfig::new().stack_size(1024);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().max_events(0);
        assert!(config.validate().is_err());
    }
}
