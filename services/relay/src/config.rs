use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Idle-session reclamation timings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// How often the relay scans for idle sessions.
    pub sweep_interval: Duration,
    /// Sessions without client activity for longer than this are torn down.
    pub idle_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub elevenlabs_api_key: SecretString,
    pub elevenlabs_ws_url: String,
    pub lifecycle: LifecycleSettings,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = match std::env::var("BIND_ADDRESS") {
            Ok(addr) => addr,
            Err(_) => {
                let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
                let port = port.parse::<u16>().map_err(|e| {
                    ConfigError::InvalidValue("PORT".to_string(), e.to_string())
                })?;
                format!("0.0.0.0:{}", port)
            }
        };
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let elevenlabs_api_key = std::env::var("ELEVENLABS_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("ELEVENLABS_API_KEY".to_string()))?;

        let elevenlabs_ws_url = std::env::var("ELEVENLABS_WS_URL")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
        url::Url::parse(&elevenlabs_ws_url).map_err(|e| {
            ConfigError::InvalidValue("ELEVENLABS_WS_URL".to_string(), e.to_string())
        })?;

        let defaults = LifecycleSettings::default();
        let lifecycle = LifecycleSettings {
            sweep_interval: duration_secs_var("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            idle_timeout: duration_secs_var("IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
        };

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok().and_then(|raw| {
            let origins: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect();
            (!origins.is_empty()).then_some(origins)
        });

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            elevenlabs_api_key,
            elevenlabs_ws_url,
            lifecycle,
            cors_allowed_origins,
            log_level,
        })
    }
}

/// Reads a whole-second duration, rejecting zero since `tokio::time::interval` panics on it.
fn duration_secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::InvalidValue(
                name.to_string(),
                "must be greater than zero".to_string(),
            )),
            Ok(secs) => Ok(Duration::from_secs(secs)),
            Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
        },
        Err(_) => Ok(default),
    }
}
