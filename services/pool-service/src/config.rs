//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The automation API key is loaded from AUTOMATION_API_KEY env var or
//! api_key_file, never stored in the TOML directly to avoid leaking secrets.
//! Client API keys follow the same rule: POOL_API_KEYS env var or
//! server.api_key_file, comma-separated in either.

use account_pool::{CooldownPolicy, RegistrationConfig, SchedulerConfig, ValidatorConfig};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::parse_key_list;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub validator: ValidatorSettings,
    #[serde(default)]
    pub registration: RegistrationSettings,
    pub automation: AutomationConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Keys clients must present on lease and admin routes. Empty disables
    /// the check.
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
    /// Path to a file of comma-separated client keys (alternative to
    /// POOL_API_KEYS env var)
    pub api_key_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 1000,
            api_keys: Vec::new(),
            api_key_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding every account
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accounts.json"),
        }
    }
}

/// Scheduling and cooldown settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub chat_cooldown_secs: u64,
    pub image_cooldown_secs: u64,
    pub video_cooldown_secs: u64,
    pub lease_timeout_secs: u64,
    pub disable_after_failures: u32,
    pub max_switch_tries: u32,
    pub reaper_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chat_cooldown_secs: 7200,
            image_cooldown_secs: 14400,
            video_cooldown_secs: 14400,
            lease_timeout_secs: 600,
            disable_after_failures: 3,
            max_switch_tries: 5,
            reaper_interval_secs: 30,
        }
    }
}

/// Session refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub sweep_interval_secs: u64,
    pub refresh_window_secs: u64,
    pub queue_capacity: usize,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 5,
            sweep_interval_secs: 1800,
            refresh_window_secs: 3600,
            queue_capacity: 256,
        }
    }
}

/// Automatic replenishment settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub enabled: bool,
    pub low_water_mark: usize,
    pub max_concurrent: usize,
    pub check_interval_secs: u64,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            low_water_mark: 3,
            max_concurrent: 1,
            check_interval_secs: 300,
        }
    }
}

/// Automation backend connection
#[derive(Debug, Deserialize)]
pub struct AutomationConfig {
    pub base_url: String,
    #[serde(default = "default_automation_timeout")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    /// Path to a file containing the API key (alternative to AUTOMATION_API_KEY env var)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

fn default_automation_timeout() -> u64 {
    180
}

fn read_key_file(path: &Path) -> common::Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!(
            "failed to read api_key_file {}: {e}",
            path.display()
        ))
    })?;
    Ok(contents.trim().to_owned())
}

fn non_zero(value: u64, field: &str) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order, for both the automation key and the
    /// client keys:
    /// 1. AUTOMATION_API_KEY / POOL_API_KEYS env var
    /// 2. api_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(key) = std::env::var("AUTOMATION_API_KEY") {
            config.automation.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.automation.api_key_file {
            let key = read_key_file(key_file)?;
            if !key.is_empty() {
                config.automation.api_key = Some(Secret::new(key));
            }
        }

        if let Ok(keys) = std::env::var("POOL_API_KEYS") {
            config.server.api_keys = parse_key_list(&keys);
        } else if let Some(ref key_file) = config.server.api_key_file {
            config.server.api_keys = parse_key_list(&read_key_file(key_file)?);
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let url = &self.automation.base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "automation.base_url must start with http:// or https://, got: {url}"
            )));
        }

        non_zero(self.server.max_connections as u64, "server.max_connections")?;
        non_zero(self.automation.timeout_secs, "automation.timeout_secs")?;
        non_zero(self.pool.chat_cooldown_secs, "pool.chat_cooldown_secs")?;
        non_zero(self.pool.image_cooldown_secs, "pool.image_cooldown_secs")?;
        non_zero(self.pool.video_cooldown_secs, "pool.video_cooldown_secs")?;
        non_zero(self.pool.lease_timeout_secs, "pool.lease_timeout_secs")?;
        non_zero(self.pool.max_switch_tries as u64, "pool.max_switch_tries")?;
        non_zero(self.pool.reaper_interval_secs, "pool.reaper_interval_secs")?;
        non_zero(self.validator.max_attempts as u64, "validator.max_attempts")?;
        non_zero(
            self.validator.sweep_interval_secs,
            "validator.sweep_interval_secs",
        )?;
        non_zero(self.validator.queue_capacity as u64, "validator.queue_capacity")?;
        non_zero(
            self.registration.max_concurrent as u64,
            "registration.max_concurrent",
        )?;
        non_zero(
            self.registration.check_interval_secs,
            "registration.check_interval_secs",
        )?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("account-pool.toml")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            cooldowns: CooldownPolicy {
                chat: Duration::from_secs(self.pool.chat_cooldown_secs),
                image: Duration::from_secs(self.pool.image_cooldown_secs),
                video: Duration::from_secs(self.pool.video_cooldown_secs),
            },
            lease_timeout: Duration::from_secs(self.pool.lease_timeout_secs),
            disable_after_failures: self.pool.disable_after_failures,
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_attempts: self.validator.max_attempts,
            retry_delay: Duration::from_secs(self.validator.retry_delay_secs),
            refresh_window: Duration::from_secs(self.validator.refresh_window_secs),
        }
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            low_water_mark: self.registration.low_water_mark,
            max_concurrent: self.registration.max_concurrent,
        }
    }
}
