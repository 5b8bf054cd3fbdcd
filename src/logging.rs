use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()) {
            Some(v) if v == "TEXT" => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }
}

/// Filter directive for a level name such as `INFO` or `WARNING`.
///
/// The MQTT client is capped at `warn` so its per-packet chatter stays out.
pub fn filter_directive(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        "critical" | "error" => "error",
        "warning" | "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    format!("{level},rumqttc=warn")
}

/// Installs the global subscriber from `DSMR_LOGLEVEL` and `DSMR_LOG_FORMAT`.
pub fn init() {
    let level = std::env::var("DSMR_LOGLEVEL").unwrap_or_else(|_| "INFO".to_string());
    let format = LogFormat::from_env_value(std::env::var("DSMR_LOG_FORMAT").ok().as_deref());
    init_with(&level, format);
}

pub fn init_with(level: &str, format: LogFormat) {
    let filter = EnvFilter::new(filter_directive(level));
    let registry = Registry::default().with(filter);
    let _ = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };
}
