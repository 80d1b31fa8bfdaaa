//! Voice broadcast configuration
//!
//! The configuration is read from an embedded default YAML document merged
//! with an optional `config.yaml`, then overridden by environment variables:
//!
//! ```text
//! PMOBROADCAST_CONFIG__VOICE_BROADCAST__CHUNK_LENGTH_SECS=30
//! ```
//!
//! The config directory is searched in this order:
//! 1. the `directory` argument if not empty
//! 2. the `PMOBROADCAST_CONFIG` environment variable
//! 3. `.pmobroadcast` in the current directory
//! 4. `.pmobroadcast` in the user's home directory
//!
//! Unlike a server configuration, nothing is ever written back.

use crate::error::{Error, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmobroadcast.yaml");

const ENV_CONFIG_DIR: &str = "PMOBROADCAST_CONFIG";
const ENV_PREFIX: &str = "PMOBROADCAST_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmobroadcast";
const SECTION: &str = "voice_broadcast";

pub const DEFAULT_CHUNK_LENGTH_SECS: u64 = 120;
pub const DEFAULT_MAX_LENGTH_SECS: u64 = 14_400;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 32;

/// Settings shared by the aggregator and the recording service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Target chunk duration announced in the `started` event
    pub chunk_length_secs: u64,
    /// Longest broadcast the recorder may send
    pub max_length_secs: u64,
    /// Capacity of the aggregator event channel
    pub event_channel_capacity: usize,
    /// Capacity of the recording service command queue
    pub command_queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            chunk_length_secs: DEFAULT_CHUNK_LENGTH_SECS,
            max_length_secs: DEFAULT_MAX_LENGTH_SECS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
        }
    }
}

impl BroadcastConfig {
    /// Load from the config directory, merging defaults and env overrides
    pub fn load(directory: &str) -> Result<Self> {
        let config_dir = find_config_dir(directory);
        let path = config_dir.join("config.yaml");

        let external = match fs::read_to_string(&path) {
            Ok(data) => {
                info!(config_file = %path.display(), "Loaded voice broadcast config file");
                Some(data)
            }
            Err(_) => {
                debug!(config_file = %path.display(), "Config file not found, using defaults");
                None
            }
        };

        Self::from_sources(external.as_deref(), env::vars())
    }

    /// Parse a YAML document on top of the embedded defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_sources(Some(yaml), std::iter::empty())
    }

    fn from_sources<I>(external: Option<&str>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(external) = external {
            let external: Value = serde_yaml::from_str(external)?;
            merge_yaml(&mut value, &lower_keys(external));
        }
        apply_env_overrides(&mut value, vars);

        let section = match &value {
            Value::Mapping(map) => map
                .get(SECTION)
                .cloned()
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        let config: BroadcastConfig = if section.is_null() {
            BroadcastConfig::default()
        } else {
            serde_yaml::from_value(section)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_length_secs == 0 {
            return Err(Error::config("chunk_length_secs must be positive"));
        }
        if self.max_length_secs < self.chunk_length_secs {
            return Err(Error::config(
                "max_length_secs must not be shorter than chunk_length_secs",
            ));
        }
        if self.event_channel_capacity == 0 || self.command_queue_capacity == 0 {
            return Err(Error::config("channel capacities must be positive"));
        }
        Ok(())
    }
}

fn find_config_dir(directory: &str) -> PathBuf {
    if !directory.is_empty() {
        return PathBuf::from(directory);
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Trying to load config from env");
        return PathBuf::from(env_path);
    }

    if Path::new(CONFIG_DIR_NAME).exists() {
        return PathBuf::from(CONFIG_DIR_NAME);
    }

    if let Some(home) = home_dir() {
        let home_config = home.join(CONFIG_DIR_NAME);
        if home_config.exists() {
            return home_config;
        }
    }

    PathBuf::from(CONFIG_DIR_NAME)
}

fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = path.split("__").map(|k| k.to_lowercase()).collect();
        let yaml_value =
            serde_yaml::from_str::<Value>(&value).unwrap_or(Value::String(value.clone()));
        debug!(key = %key, "Applying config override from env");
        set_value(config, &path, yaml_value);
    }
}

fn set_value(data: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *data = value;
        return;
    };
    if !data.is_mapping() {
        *data = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = data {
        let entry = map
            .entry(Value::String(first.clone()))
            .or_insert(Value::Mapping(Mapping::new()));
        set_value(entry, rest, value);
    }
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut lowered = Mapping::new();
            for (k, v) in map {
                let k = match k {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                lowered.insert(k, lower_keys(v));
            }
            Value::Mapping(lowered)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        _ => value,
    }
}

fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}
