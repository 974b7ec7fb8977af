use anyhow::Context;
use kvnode_storage::BucketSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address; a bare `:port` listens on all interfaces
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Root directory holding one `<name>-bucket` directory per bucket
    #[serde(default = "default_data")]
    pub data: String,

    /// Bucket selected for new connections; empty for none
    #[serde(default = "default_bucket_name")]
    pub default_bucket_name: String,

    #[serde(default = "default_num_partitions")]
    pub default_num_partitions: u32,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_sleep_interval_secs")]
    pub sleep_interval_secs: u64,

    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,

    #[serde(default = "default_purge_timeout_secs")]
    pub purge_timeout_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data: default_data(),
            default_bucket_name: default_bucket_name(),
            default_num_partitions: default_num_partitions(),
            flush_interval_secs: default_flush_interval_secs(),
            sleep_interval_secs: default_sleep_interval_secs(),
            compact_interval_secs: default_compact_interval_secs(),
            purge_timeout_secs: default_purge_timeout_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("KVNODE_BIND") {
            self.bind = val;
        }

        if let Ok(val) = std::env::var("KVNODE_DATA") {
            self.data = val;
        }

        if let Ok(val) = std::env::var("KVNODE_DEFAULT_BUCKET_NAME") {
            self.default_bucket_name = val;
        }

        if let Ok(val) = std::env::var("KVNODE_DEFAULT_NUM_PARTITIONS") {
            match val.parse::<u32>() {
                Ok(n) => self.default_num_partitions = n,
                Err(_) => eprintln!(
                    "Warning: Invalid KVNODE_DEFAULT_NUM_PARTITIONS '{}', using {}",
                    val, self.default_num_partitions
                ),
            }
        }

        merge_secs("KVNODE_FLUSH_INTERVAL", &mut self.flush_interval_secs);
        merge_secs("KVNODE_SLEEP_INTERVAL", &mut self.sleep_interval_secs);
        merge_secs("KVNODE_COMPACT_INTERVAL", &mut self.compact_interval_secs);
        merge_secs("KVNODE_PURGE_TIMEOUT", &mut self.purge_timeout_secs);

        if let Ok(val) = std::env::var("KVNODE_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.default_bucket_settings()
            .validate()
            .context("Invalid default bucket settings")?;
        anyhow::ensure!(!self.data.is_empty(), "data directory must not be empty");
        Ok(())
    }

    /// Address to bind, with `:port` expanded to all interfaces
    pub fn bind_addr(&self) -> String {
        if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data).to_string())
    }

    pub fn default_bucket(&self) -> Option<&str> {
        (!self.default_bucket_name.is_empty()).then_some(self.default_bucket_name.as_str())
    }

    /// Settings new buckets start from
    pub fn default_bucket_settings(&self) -> BucketSettings {
        BucketSettings {
            num_partitions: self.default_num_partitions,
            sleep_interval: Duration::from_secs(self.sleep_interval_secs),
            purge_timeout: Duration::from_secs(self.purge_timeout_secs),
            ..Default::default()
        }
    }
}

fn merge_secs(var: &str, target: &mut u64) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<u64>() {
            Ok(secs) => *target = secs,
            Err(_) => eprintln!("Warning: Invalid {} '{}', using {}s", var, val, target),
        }
    }
}

fn default_bind() -> String {
    ":11211".to_string()
}

fn default_data() -> String {
    "./tmp".to_string()
}

fn default_bucket_name() -> String {
    "default".to_string()
}

fn default_num_partitions() -> u32 {
    1
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_sleep_interval_secs() -> u64 {
    100
}

fn default_compact_interval_secs() -> u64 {
    600
}

fn default_purge_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
