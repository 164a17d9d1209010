//! Environment-driven runtime configuration.
//!
//! Every knob has a sane default; overrides come from `FLEETBUS_*`
//! variables. Durations are milliseconds.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FLEETBUS_REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `FLEETBUS_PREFIX` | empty |
//! | `FLEETBUS_INSTANCE_NAME` | `dispatcher` |
//! | `FLEETBUS_INCOMER_UUID` | random v4 |
//! | `FLEETBUS_PING_INTERVAL_MS` | `300000` |
//! | `FLEETBUS_CHECK_LAST_ACTIVITY_INTERVAL_MS` | `120000` |
//! | `FLEETBUS_CHECK_TRANSACTION_INTERVAL_MS` | `180000` |
//! | `FLEETBUS_IDLE_TIME_MS` | `600000` |
//! | `FLEETBUS_MIN_TIMEOUT_MS` | `0` |
//! | `FLEETBUS_MAX_TIMEOUT_MS` | `60000` |
//! | `FLEETBUS_LOG` | `info` |

use fleetbus_dispatcher::DispatcherConfig;
use tracing::warn;

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Broker connection string.
    pub redis_url: String,
    /// `tracing_subscriber` EnvFilter directive.
    pub log_filter: String,
    /// Dispatcher core options.
    pub dispatcher: DispatcherConfig,
}

impl RuntimeConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut dispatcher = DispatcherConfig {
            prefix: env_string("FLEETBUS_PREFIX", ""),
            ..Default::default()
        };
        dispatcher.instance_name =
            env_string("FLEETBUS_INSTANCE_NAME", &dispatcher.instance_name);

        if let Some(value) = env_u64("FLEETBUS_PING_INTERVAL_MS") {
            dispatcher.ping_interval_ms = value;
        }
        if let Some(value) = env_u64("FLEETBUS_CHECK_LAST_ACTIVITY_INTERVAL_MS") {
            dispatcher.check_last_activity_interval_ms = value;
        }
        if let Some(value) = env_u64("FLEETBUS_CHECK_TRANSACTION_INTERVAL_MS") {
            dispatcher.check_transaction_interval_ms = value;
        }
        if let Some(value) = env_u64("FLEETBUS_IDLE_TIME_MS") {
            dispatcher.idle_time_ms = value;
        }
        if let Some(value) = env_u64("FLEETBUS_MIN_TIMEOUT_MS") {
            dispatcher.min_timeout_ms = value;
        }
        if let Some(value) = env_u64("FLEETBUS_MAX_TIMEOUT_MS") {
            dispatcher.max_timeout_ms = value;
        }
        if let Ok(raw) = std::env::var("FLEETBUS_INCOMER_UUID") {
            match raw.parse() {
                Ok(uuid) => dispatcher.incomer_uuid = uuid,
                Err(err) => warn!(raw, error = %err, "invalid FLEETBUS_INCOMER_UUID ignored"),
            }
        }

        Self {
            redis_url: env_string("FLEETBUS_REDIS_URL", "redis://127.0.0.1:6379"),
            log_filter: env_string("FLEETBUS_LOG", "info"),
            dispatcher,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, raw, error = %err, "invalid duration ignored");
            None
        }
    }
}
