use std::{env, net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://globalapi.solarmanpv.com";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5502";
pub const DEFAULT_DB_PATH: &str = "./db";
pub const DEFAULT_ACCESSORY_NAME: &str = "Solarman Inverter";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// What the sync engine does once a fetch has failed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchFailurePolicy {
    /// Keep the last published values and try again on the next tick
    #[default]
    SkipCycle,
    /// Stop the engine, which takes the whole process down with a non-zero exit
    Exit,
}

/// Credentials for the Solarman OpenAPI
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_id: String,
    pub app_secret: String,
    pub email: String,
    pub password: String,
}

// Keep secrets out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub credentials: Credentials,
    pub device_sn: String,
    pub api_url: String,
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub accessory_name: String,
    pub poll_interval: Duration,
    pub fetch_failure_policy: FetchFailurePolicy,
}

impl Config {
    /// Loads the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    /// Empty values are treated the same as unset ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let fallback = |key: &str, default: &str| get(key).unwrap_or_else(|| default.into());

        let credentials = Credentials {
            app_id: required("APP_ID")?,
            app_secret: required("APP_SECRET")?,
            email: required("EMAIL")?,
            password: required("PASSWORD")?,
        };
        let device_sn = required("SN")?;

        let api_url = fallback("SOLARMAN_API_URL", DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();

        let raw_addr = fallback("LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let listen_addr = raw_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "LISTEN_ADDR",
                value: raw_addr.clone(),
                reason: e.to_string(),
            })?;

        let poll_interval = match get("POLL_INTERVAL_SECS") {
            None => DEFAULT_POLL_INTERVAL,
            Some(value) => parse_interval(&value)?,
        };

        let fetch_failure_policy = match get("FETCH_FAILURE_POLICY") {
            None => FetchFailurePolicy::default(),
            Some(value) => parse_policy(&value)?,
        };

        Ok(Self {
            credentials,
            device_sn,
            api_url,
            listen_addr,
            db_path: fallback("DB_PATH", DEFAULT_DB_PATH).into(),
            accessory_name: fallback("ACCESSORY_NAME", DEFAULT_ACCESSORY_NAME),
            poll_interval,
            fetch_failure_policy,
        })
    }
}

fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "POLL_INTERVAL_SECS",
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|_| invalid("expected a whole number of seconds"))?;
    if secs == 0 {
        return Err(invalid("interval must be at least one second"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_policy(value: &str) -> Result<FetchFailurePolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "skip" => Ok(FetchFailurePolicy::SkipCycle),
        "exit" => Ok(FetchFailurePolicy::Exit),
        _ => Err(ConfigError::Invalid {
            key: "FETCH_FAILURE_POLICY",
            value: value.to_string(),
            reason: "expected `skip` or `exit`".to_string(),
        }),
    }
}
