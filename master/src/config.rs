use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("valor inválido para {key}: {value:?} (se esperaba un entero de segundos)")]
    InvalidNumber { key: &'static str, value: String },
}

/// Configuración del master, leída una sola vez al arrancar.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub tracking_uri: String,
    pub tracking_token: Option<String>,
    pub job_backend_url: String,
    /// `None` = store en memoria.
    pub state_db_path: Option<PathBuf>,
    /// Base que los jobs usan para re-entrar al master cuando terminan.
    pub callback_base_url: Option<String>,
    pub lock: LockSettings,
    pub launch_timeout: Duration,
    pub periodic_sweep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            tracking_uri: "http://localhost:5000".to_string(),
            tracking_token: None,
            job_backend_url: "http://localhost:8081".to_string(),
            state_db_path: None,
            callback_base_url: None,
            lock: LockSettings::default(),
            launch_timeout: Duration::from_secs(900),
            periodic_sweep: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match text(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
            }
        };

        Ok(Config {
            bind_addr: text("BIND_ADDR").unwrap_or(defaults.bind_addr),
            tracking_uri: text("MLFLOW_TRACKING_URI").unwrap_or(defaults.tracking_uri),
            tracking_token: text("MLFLOW_TRACKING_TOKEN"),
            job_backend_url: text("JOB_BACKEND_URL").unwrap_or(defaults.job_backend_url),
            state_db_path: text("STATE_DB_PATH").map(PathBuf::from),
            callback_base_url: text("CALLBACK_BASE_URL"),
            lock: LockSettings {
                idle: secs("LOCK_IDLE_SECS", defaults.lock.idle)?,
                max_wait: secs("LOCK_MAX_WAIT_SECS", defaults.lock.max_wait)?,
                poll: secs("LOCK_POLL_SECS", defaults.lock.poll)?,
                renew_every: secs("LOCK_RENEW_SECS", defaults.lock.renew_every)?,
            },
            launch_timeout: secs("LAUNCH_TIMEOUT_SECS", defaults.launch_timeout)?,
            periodic_sweep: secs("PERIODIC_SWEEP_SECS", defaults.periodic_sweep)?,
        })
    }
}
