use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

pub const DEFAULT_PORT: u16 = 3318;
pub const DEFAULT_QUERY_DEADLINE_MS: u64 = 5_000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub schema_path: Option<PathBuf>,
    pub tokens_path: Option<PathBuf>,
    #[serde(default = "default_query_deadline_ms")]
    pub query_deadline_ms: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_query_deadline_ms() -> u64 {
    DEFAULT_QUERY_DEADLINE_MS
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            schema_path: None,
            tokens_path: None,
            query_deadline_ms: DEFAULT_QUERY_DEADLINE_MS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub schema_path: Option<PathBuf>,
    pub tokens_path: Option<PathBuf>,
    pub query_deadline_ms: Option<u64>,
    pub subscriber_buffer: Option<usize>,
    pub keep_alive_secs: Option<u64>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| DbError::Config(err.to_string()))?;
    path.push(".docdbx");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(schema) = update.schema_path {
            self.schema_path = Some(schema);
        }
        if let Some(tokens) = update.tokens_path {
            self.tokens_path = Some(tokens);
        }
        if let Some(deadline) = update.query_deadline_ms {
            self.query_deadline_ms = deadline;
        }
        if let Some(buffer) = update.subscriber_buffer {
            self.subscriber_buffer = buffer;
        }
        if let Some(secs) = update.keep_alive_secs {
            self.keep_alive_secs = secs;
        }
        self.updated_at = Utc::now();
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query_deadline_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn schema_path(&self) -> Result<&Path> {
        self.schema_path
            .as_deref()
            .ok_or_else(|| DbError::Config("no schema file configured".to_string()))
    }
}
