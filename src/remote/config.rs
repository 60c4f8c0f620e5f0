//! Invocation configuration.
//!
//! Values resolve with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided command-line flag (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OMNIEXEC_TIMEOUT` | 60s | SQL connection lifetime in seconds |
//! | `OMNIEXEC_VERBOSE` | false | Echo each operation before running it |
//!
//! The resolved values travel in an [`InvocationConfig`] handed to the
//! orchestrator; nothing here is process-wide mutable state.

use std::env;
use std::time::Duration;

/// Default invocation timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// SSH dial timeout, fixed regardless of the invocation timeout
pub const SSH_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum open connections in a SQL pool
pub const SQL_MAX_OPEN_CONNECTIONS: u32 = 10;

/// Maximum idle connections kept by a SQL pool
pub const SQL_MAX_IDLE_CONNECTIONS: u32 = 10;

/// Environment variable name for the invocation timeout
pub const TIMEOUT_ENV_VAR: &str = "OMNIEXEC_TIMEOUT";

/// Environment variable name for verbose mode
pub const VERBOSE_ENV_VAR: &str = "OMNIEXEC_VERBOSE";

/// Settings shared by every command of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationConfig {
    /// Connection lifetime for pooled SQL sessions, in seconds
    pub timeout_secs: u64,
    /// Echo each operation before executing it
    pub verbose: bool,
}

impl InvocationConfig {
    pub fn resolve(timeout_param: Option<u64>, verbose_flag: bool) -> Self {
        Self {
            timeout_secs: resolve_timeout(timeout_param),
            verbose: resolve_verbose(verbose_flag),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verbose: false,
        }
    }
}

/// Resolve the invocation timeout with priority: parameter -> env var -> default
pub fn resolve_timeout(timeout_param: Option<u64>) -> u64 {
    // Priority 1: Use parameter if provided
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    // Priority 2: Use environment variable if set
    if let Ok(env_timeout) = env::var(TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    // Priority 3: Default value
    DEFAULT_TIMEOUT_SECS
}

/// Resolve verbose mode: the flag wins, otherwise a truthy env var enables it.
pub fn resolve_verbose(verbose_flag: bool) -> bool {
    if verbose_flag {
        return true;
    }

    if let Ok(env_verbose) = env::var(VERBOSE_ENV_VAR) {
        return env_verbose.eq_ignore_ascii_case("true") || env_verbose == "1";
    }

    false
}

/// Parse a Go-style duration string such as `0s`, `30s`, `1m30s` or `250ms`.
///
/// A bare `0` is accepted. Units are `ns`, `us` (or `µs`), `ms`, `s`, `m`
/// and `h`; every number needs a unit and negative durations are rejected.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    if trimmed.starts_with('-') {
        return Err("negative durations are not allowed".to_string());
    }

    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if rest.is_empty() {
        return Err("missing number".to_string());
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        if number.is_empty() || number == "." {
            return Err(format!("expected a number before '{}'", unit));
        }
        let amount: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{}'", number))?;

        let scale = match unit {
            "ns" => 1f64,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit after '{}'", number)),
            other => return Err(format!("unknown unit '{}'", other)),
        };
        total_nanos += amount * scale;
    }

    if total_nanos > u64::MAX as f64 {
        return Err("duration out of range".to_string());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
