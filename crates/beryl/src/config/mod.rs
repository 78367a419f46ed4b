use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beryl_transport::NetworkConditions;
use error::ConfigError;

pub mod error;

const CONFIG_FILE_NAME: &str = "config.toml";

const MSG_SIZE_RANGE: (usize, usize) = (256, 65536);
const WINDOW_RANGE: (u64, u64) = (1, 100);
const TIMEOUT_RANGE: (u64, u64) = (1, 120);

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub network: NetworkConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Message the client runner sends.
    pub message: String,
    /// Upper bound on one serialized segment, metadata included.
    pub maximum_msg_size: usize,
    /// Sliding-window slot count.
    pub window_size: u64,
    /// Retransmission timeout in seconds.
    pub timeout: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulatorConfig {
    /// Port the fault-injecting proxy listens on.
    pub listen_port: u16,
    pub packet_loss: f64,
    pub ack_loss: f64,
    /// Delay range in seconds.
    pub min_delay: f64,
    pub max_delay: f64,
    pub duplication: f64,
    pub reordering: f64,
    pub reordering_delay: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message: "Hello, World!".to_string(),
            maximum_msg_size: 1024,
            window_size: 4,
            timeout: 5,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            listen_port: 5001,
            packet_loss: 0.0,
            ack_loss: 0.0,
            min_delay: 0.0,
            max_delay: 0.0,
            duplication: 0.0,
            reordering: 0.0,
            reordering_delay: 0.5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            network: NetworkConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl SimulatorConfig {
    /// The failure model handed to the simulator at construction.
    pub fn conditions(&self) -> NetworkConditions {
        NetworkConditions {
            packet_loss_rate: self.packet_loss,
            ack_loss_rate: self.ack_loss,
            min_delay: Duration::from_secs_f64(self.min_delay),
            max_delay: Duration::from_secs_f64(self.max_delay),
            duplication_rate: self.duplication,
            reordering_rate: self.reordering,
            reordering_delay: Duration::from_secs_f64(self.reordering_delay),
            seed: None,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    (min, max): (T, T),
) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::Validation(format!(
            "{name} must be at least {min}"
        )));
    }
    if value > max {
        return Err(ConfigError::Validation(format!(
            "{name} cannot exceed {max}"
        )));
    }
    Ok(())
}

fn check_rate(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{name} must be between 0 and 1"
        )));
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.message.trim().is_empty() {
            return Err(ConfigError::Validation(
                "message cannot be empty".to_string(),
            ));
        }
        check_range(
            "maximum_msg_size",
            self.transport.maximum_msg_size,
            MSG_SIZE_RANGE,
        )?;
        check_range("window_size", self.transport.window_size, WINDOW_RANGE)?;
        check_range("timeout", self.transport.timeout, TIMEOUT_RANGE)?;

        let address = format!("{}:{}", self.network.host, self.network.port);
        if SocketAddr::from_str(&address).is_err() {
            return Err(ConfigError::Validation(format!(
                "invalid network address: '{address}'"
            )));
        }

        check_rate("packet_loss", self.simulator.packet_loss)?;
        check_rate("ack_loss", self.simulator.ack_loss)?;
        check_rate("duplication", self.simulator.duplication)?;
        check_rate("reordering", self.simulator.reordering)?;
        if self.simulator.min_delay < 0.0
            || self.simulator.max_delay < 0.0
            || self.simulator.reordering_delay < 0.0
        {
            return Err(ConfigError::Validation(
                "delays cannot be negative".to_string(),
            ));
        }
        if self.simulator.min_delay > self.simulator.max_delay {
            return Err(ConfigError::Validation(
                "min_delay cannot exceed max_delay".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}

/// Loads `config.toml` from the working directory, writing the default
/// configuration on first run.
pub fn handle() -> Result<Config, ConfigError> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.transport.maximum_msg_size = 128;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.timeout = 121;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.message = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_simulator_settings() {
        let mut config = Config::default();
        config.simulator.packet_loss = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.simulator.min_delay = 0.5;
        config.simulator.max_delay = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = Config::default();
        config.transport.window_size = 7;
        config.simulator.packet_loss = 0.25;

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.transport.window_size, 7);
        assert_eq!(parsed.simulator.packet_loss, 0.25);
        assert!(parsed.validate().is_ok());
    }
}
