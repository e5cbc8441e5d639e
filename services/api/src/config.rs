use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Absent keys are reported by `/health` and fail each session handshake.
    pub openai_api_key: Option<String>,
    pub realtime_model: String,
    pub realtime_url: String,
    pub log_level: Level,
    pub api_config_path: PathBuf,
    pub server_vad: bool,
    pub capability_timeout: Duration,
    pub slow_capability_timeout: Duration,
    pub handshake_timeout: Duration,
    pub workflow_step_delay: Duration,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let realtime_model = std::env::var("OPENAI_REALTIME_MODEL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());
        let realtime_url = std::env::var("OPENAI_REALTIME_URL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let api_config_path = std::env::var("API_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/api_config.json"));

        let server_vad = parse_var("SERVER_VAD", true)?;
        let capability_timeout = Duration::from_secs(parse_var("CAPABILITY_TIMEOUT_SECS", 10)?);
        let slow_capability_timeout =
            Duration::from_secs(parse_var("SLOW_CAPABILITY_TIMEOUT_SECS", 20)?);
        let handshake_timeout = Duration::from_secs(parse_var("HANDSHAKE_TIMEOUT_SECS", 10)?);
        let workflow_step_delay =
            Duration::from_millis(parse_var("WORKFLOW_STEP_DELAY_MS", 500)?);

        if capability_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CAPABILITY_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_model,
            realtime_url,
            log_level,
            api_config_path,
            server_vad,
            capability_timeout,
            slow_capability_timeout,
            handshake_timeout,
            workflow_step_delay,
        })
    }
}
