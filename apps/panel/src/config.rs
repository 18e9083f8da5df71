use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

pub const SETTINGS_FILE: &str = "panel.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    pub throttle_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3001".into(),
            throttle_interval: Duration::from_millis(33),
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then `path` if it exists, then the environment.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match read_file_values(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("server_url") {
                    settings.server_url = v.clone();
                }
                apply_millis(
                    &mut settings.throttle_interval,
                    "throttle_interval_ms",
                    file_cfg.get("throttle_interval_ms"),
                );
                apply_millis(
                    &mut settings.request_timeout,
                    "request_timeout_ms",
                    file_cfg.get("request_timeout_ms"),
                );
                apply_millis(
                    &mut settings.reconnect_delay,
                    "reconnect_delay_ms",
                    file_cfg.get("reconnect_delay_ms"),
                );
            }
            Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("PANEL_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    apply_millis(
        &mut settings.throttle_interval,
        "APP__THROTTLE_INTERVAL_MS",
        env("APP__THROTTLE_INTERVAL_MS").as_ref(),
    );
    apply_millis(
        &mut settings.request_timeout,
        "APP__REQUEST_TIMEOUT_MS",
        env("APP__REQUEST_TIMEOUT_MS").as_ref(),
    );
    apply_millis(
        &mut settings.reconnect_delay,
        "APP__RECONNECT_DELAY_MS",
        env("APP__RECONNECT_DELAY_MS").as_ref(),
    );

    settings
}

// Accepts both `key = "50"` and `key = 50`.
fn read_file_values(raw: &str) -> Result<HashMap<String, String>, toml::de::Error> {
    let table = toml::from_str::<HashMap<String, toml::Value>>(raw)?;
    Ok(table
        .into_iter()
        .filter_map(|(key, value)| match value {
            toml::Value::String(s) => Some((key, s)),
            toml::Value::Integer(i) => Some((key, i.to_string())),
            _ => None,
        })
        .collect())
}

fn apply_millis(target: &mut Duration, key: &str, raw: Option<&String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) => *target = Duration::from_millis(ms),
        Err(_) => warn!(key, value = %raw, "ignoring non-numeric duration override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
