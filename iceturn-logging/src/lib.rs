//! Structured logging setup for the iceturn relay
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use thiserror::Error;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A global subscriber is already installed for this process
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Map a numeric verbosity (0 = silent .. 6 = everything) to a filter directive
///
/// The scale follows the level numbers accepted by the old `SetLogger` call.
pub fn verbosity_filter(level: u8) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize structured logging
///
/// This sets up:
/// - JSON formatted logs (for production)
/// - Environment-based log level filtering (`RUST_LOG` wins over `default_level`)
/// - Service name tagging
pub fn init_logging(service_name: &str, default_level: &str) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = service_name,
        level = default_level,
        "Logging initialized"
    );
    Ok(())
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(service_name: &str, default_level: &str) -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = service_name,
        level = default_level,
        "Console logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_filter_scale() {
        assert_eq!(verbosity_filter(0), "off");
        assert_eq!(verbosity_filter(1), "error");
        assert_eq!(verbosity_filter(3), "info");
        assert_eq!(verbosity_filter(6), "trace");
        assert_eq!(verbosity_filter(200), "trace");
    }

    #[test]
    fn test_second_init_is_reported() {
        let first = init_console_logging("iceturn-test", "warn");
        let second = init_console_logging("iceturn-test", "warn");
        // Another test may have installed the subscriber first
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
