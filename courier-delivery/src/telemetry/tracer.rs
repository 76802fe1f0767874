//! Tracing Subscriber Initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier_core::{CourierError, CourierResult};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable, for local runs
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("pretty") || raw.eq_ignore_ascii_case("text") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Output format (COURIER_LOG_FORMAT)
    pub log_format: LogFormat,
    /// Filter used when RUST_LOG is unset
    pub default_filter: String,
    /// Expose Prometheus counters
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("COURIER_SERVICE_NAME")
                .unwrap_or_else(|_| "courierd".to_string()),
            log_format: std::env::var("COURIER_LOG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or(LogFormat::Json),
            default_filter: "courier_delivery=info,courier_storage=info,warn".to_string(),
            metrics_enabled: std::env::var("COURIER_METRICS_ENABLED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(true),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with
/// [`CourierError::Telemetry`] rather than silently replacing the first.
pub fn init_tracing(config: &TelemetryConfig) -> CourierResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| CourierError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = config.service_name,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );

    Ok(())
}
