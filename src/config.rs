//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Platform variables (HOST, PORT, DOUBAO_APP_ID, DOUBAO_ACCESS_TOKEN)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and data formats
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize implementations
//! - **Struct update syntax**: `..Default::default()` fills in the remaining fields
//! - **Result<T, E>**: Every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, DOUBAO_APP_ID, DOUBAO_ACCESS_TOKEN)
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__MAX_FRAME_BYTES, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! Sections and fields are separated by a double underscore because several
//! field names contain a single one (`max_frame_bytes`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default realtime dialogue endpoint of the vendor.
pub const DEFAULT_VENDOR_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The HTTP listener, the vendor account and the relay tuning change for
/// different reasons and are owned by different people in a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub vendor: VendorConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Vendor account and endpoint.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the realtime dialogue service
/// - `app_id` / `access_key`: account credentials, empty until configured
/// - `resource_id`: product the session is billed against
/// - `app_key`: fixed application key the vendor expects for this product
/// - `connect_timeout_secs`: upper bound for the authenticated upgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    pub url: String,
    pub app_id: String,
    pub access_key: String,
    pub resource_id: String,
    pub app_key: String,
    pub connect_timeout_secs: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_VENDOR_URL.to_string(),
            app_id: String::new(),
            access_key: String::new(),
            resource_id: "volc.speech.dialog".to_string(),
            app_key: "PlgvMymc7f3tQnJ6".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl VendorConfig {
    /// Both halves of the credential pair are present.
    pub fn has_credentials(&self) -> bool {
        !self.app_id.trim().is_empty() && !self.access_key.trim().is_empty()
    }
}

/// Relay tuning.
///
/// ## Fields:
/// - `max_concurrent_sessions`: relay connections served at once
/// - `heartbeat_interval_secs`: how often the browser is pinged
/// - `client_timeout_secs`: silence after which a browser is dropped
/// - `max_frame_bytes`: largest WebSocket message accepted from a browser
/// - audio fields: stream format announced in `StartSession`
/// - `model_name`, `enable_vad`, `vad_stop_time_ms`: dialogue model and
///   server-side voice activity detection requested in `StartSession`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub audio_format: String,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub model_name: String,
    pub enable_vad: bool,
    pub vad_stop_time_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            max_frame_bytes: 1024 * 1024,
            audio_format: "pcm".to_string(),
            sample_rate: 16000,
            bits_per_sample: 16,
            channels: 1,
            model_name: DEFAULT_MODEL_NAME.to_string(),
            enable_vad: true,
            vad_stop_time_ms: 800,
        }
    }
}

const DEFAULT_MODEL_NAME: &str = "doubao-speech-vision-pro-250515";

/// Platform variables mapped onto config keys.
const PLATFORM_OVERRIDES: [(&str, &str); 4] = [
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("DOUBAO_APP_ID", "vendor.app_id"),
    ("DOUBAO_ACCESS_TOKEN", "vendor.access_key"),
];

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_RELAY__MAX_CONCURRENT_SESSIONS=50`: Override relay capacity
    /// - `APP_VENDOR__URL=wss://...`: Point at another vendor endpoint
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `DOUBAO_ACCESS_TOKEN=...`: Vendor credential as the platform provides it
    pub fn load() -> Result<Self> {
        let overrides = PLATFORM_OVERRIDES
            .iter()
            .filter_map(|(var, key)| env::var(var).ok().map(|value| (*key, value)))
            .collect::<Vec<_>>();

        Self::load_from(Self::environment(), &overrides)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Build the layered configuration from an explicit environment source and
    /// a set of `(key, value)` overrides applied last.
    fn load_from(environment: config::Environment, overrides: &[(&str, String)]) -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(environment);

        // 4. Platform variables win over everything else
        for (key, value) in overrides {
            settings = settings.set_override(*key, value.as_str())?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one relay session and a non-zero frame limit
    /// - The vendor URL is a WebSocket URL
    /// - Heartbeats are sent more often than the client timeout
    /// - A dialogue model is named
    /// - The vendor connect timeout is not zero
    ///
    /// Missing vendor credentials are not an error here: the service can run
    /// (health, lock API) without them and relay requests report it instead.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.relay.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if !(self.vendor.url.starts_with("ws://") || self.vendor.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Vendor URL must use ws:// or wss://, got '{}'",
                self.vendor.url
            ));
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.heartbeat_interval_secs >= self.relay.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval ({}s) must be non-zero and shorter than the client timeout ({}s)",
                self.relay.heartbeat_interval_secs,
                self.relay.client_timeout_secs
            ));
        }

        if self.relay.model_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Dialogue model name cannot be empty"));
        }

        if self.vendor.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Vendor connect timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the `server` and `relay` sections can change at runtime; vendor
    /// credentials come from the environment. The update is applied to a copy
    /// and only committed when the result validates, so a rejected update
    /// leaves the running configuration untouched.
    ///
    /// ## Partial updates:
    /// `{"relay": {"max_concurrent_sessions": 20}}` changes only the capacity.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(sessions) = relay.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.relay.max_concurrent_sessions = sessions as usize;
            }
            if let Some(interval) = relay.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                updated.relay.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = relay.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                updated.relay.client_timeout_secs = timeout;
            }
            if let Some(size) = relay.get("max_frame_bytes").and_then(|v| v.as_u64()) {
                updated.relay.max_frame_bytes = size as usize;
            }
            if let Some(model) = relay.get("model_name").and_then(|v| v.as_str()) {
                updated.relay.model_name = model.to_string();
            }
            if let Some(enabled) = relay.get("enable_vad").and_then(|v| v.as_bool()) {
                updated.relay.enable_vad = enabled;
            }
            if let Some(stop_ms) = relay.get("vad_stop_time_ms").and_then(|v| v.as_u64()) {
                updated.relay.vad_stop_time_ms = stop_ms;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy safe to hand out over the API: the access key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.vendor.access_key.is_empty() {
            config.vendor.access_key = "********".to_string();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment(vars: &[(&str, &str)]) -> config::Environment {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<config::Map<String, String>>();
        AppConfig::environment().source(Some(source))
    }

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.vendor.url, DEFAULT_VENDOR_URL);
        assert!(!config.vendor.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vendor.url = "https://openspeech.bytedance.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.heartbeat_interval_secs = config.relay.client_timeout_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vendor.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.relay.model_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vad_settings_update_at_runtime() {
        let mut config = AppConfig::default();
        assert!(config.relay.enable_vad);
        assert_eq!(config.relay.vad_stop_time_ms, 800);

        let json = r#"{"relay": {"enable_vad": false, "vad_stop_time_ms": 1200}}"#;
        config.update_from_json(json).unwrap();
        assert!(!config.relay.enable_vad);
        assert_eq!(config.relay.vad_stop_time_ms, 1200);
        assert_eq!(config.relay.model_name, DEFAULT_MODEL_NAME);

        assert!(config.update_from_json(r#"{"relay": {"model_name": ""}}"#).is_err());
        assert_eq!(config.relay.model_name, DEFAULT_MODEL_NAME);
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "relay": {"max_concurrent_sessions": 25}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.relay.max_concurrent_sessions, 25);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_rejected_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"relay": {"max_concurrent_sessions": 50, "heartbeat_interval_secs": 500}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.relay.max_concurrent_sessions, 10);
        assert_eq!(config.relay.heartbeat_interval_secs, 30);

        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_update_ignores_vendor_section() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"vendor": {"access_key": "stolen", "url": "ws://evil"}}"#)
            .unwrap();
        assert!(config.vendor.access_key.is_empty());
        assert_eq!(config.vendor.url, DEFAULT_VENDOR_URL);
    }

    #[test]
    fn test_environment_layers() {
        let env = environment(&[
            ("APP_RELAY__MAX_FRAME_BYTES", "4096"),
            ("APP_VENDOR__RESOURCE_ID", "volc.speech.test"),
            ("APP_SERVER__PORT", "7000"),
            ("APP_RELAY__VAD_STOP_TIME_MS", "650"),
        ]);
        let overrides = [
            ("server.port", "9000".to_string()),
            ("vendor.access_key", "token".to_string()),
        ];

        let config = AppConfig::load_from(env, &overrides).unwrap();
        assert_eq!(config.relay.max_frame_bytes, 4096);
        assert_eq!(config.vendor.resource_id, "volc.speech.test");
        // Platform variables win over APP_ variables
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.vendor.access_key, "token");
        // Untouched values keep their defaults
        assert_eq!(config.relay.sample_rate, 16000);
        assert_eq!(config.relay.vad_stop_time_ms, 650);
        assert!(config.relay.enable_vad);
    }

    #[test]
    fn test_redacted_masks_access_key() {
        let mut config = AppConfig::default();
        config.vendor.app_id = "app-1".to_string();
        config.vendor.access_key = "secret".to_string();

        let redacted = config.redacted();
        assert_eq!(redacted.vendor.access_key, "********");
        assert_eq!(redacted.vendor.app_id, "app-1");
        assert_eq!(config.vendor.access_key, "secret");
    }
}
