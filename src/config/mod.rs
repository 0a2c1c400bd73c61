use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CARTBRIDGE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port of the loopback-only listening endpoint. Persisted setting.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 5391 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_fast_attempts: u32,
    pub slow_interval_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
            max_fast_attempts: 10,
            slow_interval_ms: 60_000,
            ping_interval_ms: 30_000,
        }
    }
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<BridgeConfig>(&raw)
                .map_err(|err| Error::Config(format!("{}: {err}", config_path.display())))?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_BASE_DELAY_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.reconnect.base_delay_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_SLOW_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.reconnect.slow_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}PING_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.reconnect.ping_interval_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".to_string()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::Config(
                "reconnect.base_delay_ms must be non-zero".to_string(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(Error::Config(
                "reconnect.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(Error::Config(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms".to_string(),
            ));
        }
        if self.reconnect.max_fast_attempts == 0 {
            return Err(Error::Config(
                "reconnect.max_fast_attempts must be non-zero".to_string(),
            ));
        }
        if self.reconnect.slow_interval_ms == 0 {
            return Err(Error::Config(
                "reconnect.slow_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// WebSocket URL of the host endpoint for a same-machine surface client.
    pub fn surface_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.server.port)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        if path.as_ref().exists() {
            return Err(Error::Config("config.toml already exists".to_string()));
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&BridgeConfig::default())
            .map_err(|err| Error::Config(err.to_string()))?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = active_config_path();
        self.validate()?;
        let data = toml::to_string_pretty(self).map_err(|err| Error::Config(err.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("cart-surface-bridge")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
