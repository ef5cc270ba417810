use std::path::PathBuf;
use std::time::Duration;
use std::{env, fmt};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::relay::{DEFAULT_MODEL, RelaySettings};
use crate::render::{EDIT_INTERVAL, MAX_MESSAGE_LEN, RenderSettings};

pub const TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const ALLOWED_USER_ID: &str = "ALLOWED_USER_ID";
pub const WORKSPACE: &str = "WORKSPACE";
pub const WORKER_COMMAND: &str = "WORKER_COMMAND";
pub const DEFAULT_MODEL_KEY: &str = "DEFAULT_MODEL";
pub const EDIT_INTERVAL_MS: &str = "EDIT_INTERVAL_MS";
pub const MAX_MESSAGE_LEN_KEY: &str = "MAX_MESSAGE_LEN";
pub const UPLOAD_DIR: &str = "UPLOAD_DIR";

/// Where settings come from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn describe(&self) -> String;
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    env_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        let env_file = env_file.or_else(|| Some(PathBuf::from(".env")).filter(|p| p.exists()));
        if let Some(path) = &env_file {
            match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => warn!("could not load .env from {}: {err}", path.display()),
            }
        }
        Self { env_file }
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn describe(&self) -> String {
        match &self.env_file {
            Some(path) => format!("environment + {}", path.display()),
            None => "environment".to_string(),
        }
    }
}

/// In-memory settings.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn describe(&self) -> String {
        format!("map ({} entries)", self.map.len())
    }
}

/// Fully resolved settings of one relay process.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub telegram_token: Option<String>,
    pub allowed_user_id: Option<String>,
    pub workspace: PathBuf,
    pub worker_command: String,
    pub default_model: String,
    pub edit_interval: Duration,
    pub max_message_len: usize,
    pub upload_dir: PathBuf,
}

impl RelayConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        // blank values count as unset
        let get = |key: &str| {
            source
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let workspace = get(WORKSPACE)
            .map(PathBuf::from)
            .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let upload_dir = get(UPLOAD_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join(".uploads"));

        let edit_interval = match get(EDIT_INTERVAL_MS) {
            Some(raw) => Duration::from_millis(parse_number(EDIT_INTERVAL_MS, &raw)?),
            None => EDIT_INTERVAL,
        };
        let max_message_len = match get(MAX_MESSAGE_LEN_KEY) {
            Some(raw) => parse_number(MAX_MESSAGE_LEN_KEY, &raw)?,
            None => MAX_MESSAGE_LEN,
        };
        if max_message_len == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_MESSAGE_LEN_KEY,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            telegram_token: get(TELEGRAM_TOKEN),
            allowed_user_id: get(ALLOWED_USER_ID),
            workspace,
            worker_command: get(WORKER_COMMAND).unwrap_or_else(|| "claude".to_string()),
            default_model: get(DEFAULT_MODEL_KEY).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            edit_interval,
            max_message_len,
            upload_dir,
        })
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.telegram_token
            .as_deref()
            .ok_or(ConfigError::Missing(TELEGRAM_TOKEN))
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            program: self.worker_command.clone(),
            workdir: self.workspace.clone(),
            default_model: self.default_model.clone(),
            render: RenderSettings {
                max_len: self.max_message_len,
                edit_interval: self.edit_interval,
            },
        }
    }

    /// Key/value listing with the token masked.
    pub fn as_vec(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                TELEGRAM_TOKEN,
                self.telegram_token
                    .as_deref()
                    .map_or_else(|| "<unset>".to_string(), redact),
            ),
            (
                ALLOWED_USER_ID,
                self.allowed_user_id.clone().unwrap_or_else(|| "<anyone>".to_string()),
            ),
            (WORKSPACE, self.workspace.display().to_string()),
            (WORKER_COMMAND, self.worker_command.clone()),
            (DEFAULT_MODEL_KEY, self.default_model.clone()),
            (EDIT_INTERVAL_MS, self.edit_interval.as_millis().to_string()),
            (MAX_MESSAGE_LEN_KEY, self.max_message_len.to_string()),
            (UPLOAD_DIR, self.upload_dir.display().to_string()),
        ]
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in self.as_vec() {
            map.entry(&key, &value);
        }
        map.finish()
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn redact(token: &str) -> String {
    let count = token.chars().count();
    if count <= 8 {
        return "****".to_string();
    }
    let tail: String = token.chars().skip(count - 4).collect();
    format!("****{tail}")
}
