//! Ambient service configuration, environment-variable-driven: every knob
//! has a sane built-in default and can be overridden without a rebuild.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Port the `/health` HTTP surface listens on.
    pub health_port: u16,
    /// Per-OOB-message receive timeout (§5).
    pub oob_message_timeout: Duration,
    /// Path the audit log is appended to; falls back to stdout if the
    /// directory can't be created/opened.
    pub audit_log_path: String,
    /// No-initial-data timeout armed when a peer session starts (§4.G).
    pub no_initial_data_timeout: Duration,
    /// No-updated-data watchdog, reset on every accepted measurement (§4.G).
    pub no_updated_data_timeout: Duration,
    /// Grace period after `on_app_background` before adapters are stopped.
    pub background_timeout: Duration,
    /// Grace period given to adapters to confirm `stop` before force-close.
    pub force_close_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            health_port: env_parsed("RANGING_HEALTH_PORT", 8787),
            oob_message_timeout: Duration::from_millis(env_parsed(
                "RANGING_OOB_MESSAGE_TIMEOUT_MS",
                5_000,
            )),
            audit_log_path: std::env::var("RANGING_AUDIT_LOG_PATH")
                .unwrap_or_else(|_| "/data/ranging_audit.jsonl".to_string()),
            no_initial_data_timeout: Duration::from_millis(env_parsed(
                "RANGING_NO_INITIAL_DATA_TIMEOUT_MS",
                3_000,
            )),
            no_updated_data_timeout: Duration::from_millis(env_parsed(
                "RANGING_NO_UPDATED_DATA_TIMEOUT_MS",
                2_000,
            )),
            background_timeout: Duration::from_millis(env_parsed(
                "RANGING_BACKGROUND_TIMEOUT_MS",
                10_000,
            )),
            force_close_timeout: Duration::from_millis(env_parsed(
                "RANGING_FORCE_CLOSE_TIMEOUT_MS",
                2_000,
            )),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env_vars() {
        let config = ServiceConfig::default();
        assert_eq!(config.health_port, 8787);
        assert_eq!(config.oob_message_timeout, Duration::from_secs(5));
    }
}
