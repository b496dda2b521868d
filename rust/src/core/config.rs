use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::signaling::SignalingConfig;

pub(crate) const CONFIG_FILE: &str = "medcall_config.json";

const DEFAULT_API_HOST: &str = "api.medcall.app";
const DEFAULT_API_URL: &str = "https://api.medcall.app/v1/";
const DEFAULT_DEVICE_LABEL: &str = "medcall-mobile";
const DEFAULT_STORAGE_KEY_PREFIX: &str = "medcall.";
const DEFAULT_JOIN_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_SIGNALING_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SIGNALING_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_SIGNALING_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_SIGNALING_BACKOFF_MAX_MS: u64 = 8_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub api_base_url: Option<String>,
    pub signaling_url: Option<String>,
    pub disable_network: Option<bool>,
    pub device_label: Option<String>,
    pub storage_key_prefix: Option<String>,
    pub join_retry_delay_ms: Option<u64>,
    pub signaling_connect_timeout_ms: Option<u64>,
    pub signaling_max_attempts: Option<u32>,
    pub signaling_backoff_base_ms: Option<u64>,
    pub signaling_backoff_max_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_str::<AppConfig>(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "malformed config, using defaults");
            AppConfig::default()
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Trailing slash so relative endpoint joins keep the base path.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl AppConfig {
    pub fn network_enabled(&self) -> bool {
        self.disable_network != Some(true)
    }

    pub fn api_base_url(&self) -> String {
        let configured =
            env_override("MEDCALL_API_URL").or_else(|| non_empty(self.api_base_url.as_ref()));
        if let Some(raw) = configured {
            match Url::parse(&raw) {
                Ok(url) => return with_trailing_slash(url).to_string(),
                Err(e) => tracing::warn!(%e, url = %raw, "invalid api url, using default"),
            }
        }
        DEFAULT_API_URL.to_string()
    }

    /// Signaling base URL. Defaults to the API origin with a ws(s) scheme.
    pub fn signaling_url(&self) -> String {
        if let Some(url) =
            env_override("MEDCALL_SIGNALING_URL").or_else(|| non_empty(self.signaling_url.as_ref()))
        {
            return url;
        }
        let Ok(api) = Url::parse(&self.api_base_url()) else {
            return format!("wss://{DEFAULT_API_HOST}");
        };
        let scheme = if api.scheme() == "http" { "ws" } else { "wss" };
        match (api.host_str(), api.port()) {
            (Some(host), Some(port)) => format!("{scheme}://{host}:{port}"),
            (Some(host), None) => format!("{scheme}://{host}"),
            (None, _) => format!("wss://{DEFAULT_API_HOST}"),
        }
    }

    pub fn device_label(&self) -> String {
        non_empty(self.device_label.as_ref()).unwrap_or_else(|| DEFAULT_DEVICE_LABEL.to_string())
    }

    pub fn storage_key_prefix(&self) -> String {
        // An empty prefix is allowed; only a missing one falls back.
        self.storage_key_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_STORAGE_KEY_PREFIX.to_string())
    }

    pub fn join_retry_delay(&self) -> Duration {
        Duration::from_millis(self.join_retry_delay_ms.unwrap_or(DEFAULT_JOIN_RETRY_DELAY_MS))
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.signaling_url(),
            connect_timeout: Duration::from_millis(
                self.signaling_connect_timeout_ms
                    .unwrap_or(DEFAULT_SIGNALING_CONNECT_TIMEOUT_MS),
            ),
            max_attempts: self
                .signaling_max_attempts
                .unwrap_or(DEFAULT_SIGNALING_MAX_ATTEMPTS)
                .max(1),
            backoff_base: Duration::from_millis(
                self.signaling_backoff_base_ms
                    .unwrap_or(DEFAULT_SIGNALING_BACKOFF_BASE_MS),
            ),
            backoff_max: Duration::from_millis(
                self.signaling_backoff_max_ms
                    .unwrap_or(DEFAULT_SIGNALING_BACKOFF_MAX_MS),
            ),
            heartbeat_interval: Duration::from_millis(
                self.heartbeat_interval_ms
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS)
                    .max(1),
            ),
        }
    }
}
