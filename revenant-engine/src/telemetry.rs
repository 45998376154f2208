//! Tracing subscriber initialization.

use revenant_core::{ConfigError, EngineError, EngineResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `REVENANT_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "revenant_engine=info,revenant_storage=info,revenant_registry=info,warn";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" | "text" | "plain" => Some(LogFormat::Pretty),
            _ => None,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives (`REVENANT_LOG`)
    pub filter: String,
    /// Output format (`REVENANT_LOG_FORMAT`: `json` or `pretty`)
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("REVENANT_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            format: std::env::var("REVENANT_LOG_FORMAT")
                .ok()
                .and_then(|s| LogFormat::parse(&s))
                .unwrap_or(LogFormat::Pretty),
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        EnvFilter::try_new(&self.filter).map_err(|e| ConfigError::InvalidValue {
            field: "REVENANT_LOG".to_string(),
            value: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails because a global subscriber is
/// already set.
pub fn init_tracing(config: &TelemetryConfig) -> EngineResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| EngineError::InvalidState {
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(filter = %config.filter, format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_telemetry_config_from_env() {
        let _filter = EnvVarGuard::set("REVENANT_LOG", Some("debug"));
        let _format = EnvVarGuard::set("REVENANT_LOG_FORMAT", Some("JSON"));
        let config = TelemetryConfig::default();
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, LogFormat::Json);

        let _format = EnvVarGuard::set("REVENANT_LOG_FORMAT", Some("fancy"));
        assert_eq!(TelemetryConfig::default().format, LogFormat::Pretty);
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = TelemetryConfig {
            filter: "revenant_engine=notalevel".to_string(),
            format: LogFormat::Pretty,
        };
        let err = init_tracing(&config).unwrap_err();
        assert_eq!(err.kind(), revenant_core::ErrorKind::Config);
    }
}
