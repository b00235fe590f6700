//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events. Binaries and test harnesses that
//! want them on stderr call [`init_tracing`] once at startup.

use recsync_core::{ConfigError, SyncError, SyncResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "recsync_store=info,recsync_storage=info,warn";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "plain" | "text" => Some(Self::Plain),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `RECSYNC_LOG_FORMAT`: `plain` or `json`
    pub format: LogFormat,
    /// `RECSYNC_LOG`: an `EnvFilter` directive string
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plain,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("RECSYNC_LOG_FORMAT") {
            config.format = LogFormat::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                field: "RECSYNC_LOG_FORMAT".to_string(),
                value: value.clone(),
                reason: "expected 'plain' or 'json'".to_string(),
            })?;
        }
        if let Ok(filter) = std::env::var("RECSYNC_LOG") {
            if !filter.trim().is_empty() {
                config.filter = filter;
            }
        }

        Ok(config)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    fn env_filter(&self) -> SyncResult<EnvFilter> {
        EnvFilter::try_new(&self.filter).map_err(|e| {
            SyncError::Config(ConfigError::InvalidValue {
                field: "RECSYNC_LOG".to_string(),
                value: self.filter.clone(),
                reason: e.to_string(),
            })
        })
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> SyncResult<()> {
    let env_filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| {
        SyncError::Config(ConfigError::InvalidValue {
            field: "subscriber".to_string(),
            value: format!("{:?}", config.format),
            reason: format!("Failed to init subscriber: {}", e),
        })
    })?;

    tracing::info!(format = ?config.format, filter = %config.filter, "Tracing initialized");
    Ok(())
}
