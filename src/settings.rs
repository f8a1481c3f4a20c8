use crate::error::{ObegransadError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Settings for one device, the equivalent of a configuration entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Hostname or IP address of the device
    pub host: String,

    /// Seconds between polls; fixed once the device is set up
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// REST request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Effect switched to before a notification message is shown
    #[serde(default = "default_message_effect")]
    pub default_message_effect: String,

    #[serde(default)]
    pub websocket: WebSocketSettings,
}

/// Settings for the auxiliary WebSocket channel
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WebSocketSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Upper bound for the reconnect backoff, in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_scan_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_message_effect() -> String {
    "DDP".to_string()
}

fn default_max_backoff() -> u64 {
    300
}

impl Settings {
    /// Settings for `host` with every other field at its default
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scan_interval_secs: default_scan_interval(),
            request_timeout_secs: default_request_timeout(),
            default_message_effect: default_message_effect(),
            websocket: WebSocketSettings::default(),
        }
    }

    /// Load settings from an optional file plus `OBEGRANSAD_*` environment variables
    ///
    /// Nested keys use a double underscore, e.g. `OBEGRANSAD_WEBSOCKET__ENABLED=true`.
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .set_default("scan_interval_secs", default_scan_interval())?
            .set_default("request_timeout_secs", default_request_timeout())?
            .set_default("default_message_effect", default_message_effect())?
            .set_default("websocket.enabled", false)?
            .set_default("websocket.max_backoff_secs", default_max_backoff())?
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("OBEGRANSAD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let settings: Self = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ObegransadError::validation("host must not be empty"));
        }
        if self.scan_interval_secs == 0 {
            return Err(ObegransadError::validation("scan interval must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ObegransadError::validation("request timeout must be positive"));
        }
        if self.websocket.max_backoff_secs == 0 {
            return Err(ObegransadError::validation("websocket max backoff must be positive"));
        }
        Ok(())
    }

    pub fn with_scan_interval(mut self, secs: u64) -> Self {
        self.scan_interval_secs = secs;
        self
    }

    pub fn with_websocket(mut self, enabled: bool) -> Self {
        self.websocket.enabled = enabled;
        self
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.websocket.max_backoff_secs)
    }
}
