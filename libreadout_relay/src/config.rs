use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::channel_set::ActiveChannelSet;
use super::constants::{DEFAULT_N_WORKERS, MAX_CHANNELS};
use super::error::ConfigError;

/// Structure representing the relay configuration. Contains the upstream source,
/// the channel layout and the downstream link settings.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source_path: PathBuf,
    pub log_path: PathBuf,
    pub node_id: u32,
    /// Channel mask register value; bit `i` enables channel `i`
    pub channel_mask: u64,
    pub n_workers: usize,
    pub event_stride: u32,
    pub downstream_host: String,
    pub base_port: u16,
    pub send_timeout_ms: u64,
    pub connect_retries: u32,
    pub report_interval_secs: u64,
    pub permissive_acknowledged: bool,
}

impl Default for Config {
    /// Generate a new Config object. Paths are placeholders; everything else is
    /// usable as is
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("None"),
            log_path: PathBuf::from("readout_relay.log"),
            node_id: 0,
            channel_mask: (1 << MAX_CHANNELS) - 1,
            n_workers: DEFAULT_N_WORKERS,
            event_stride: 1,
            downstream_host: String::from("127.0.0.1"),
            base_port: 46000,
            send_timeout_ms: 5000,
            connect_retries: 10,
            report_interval_secs: 10,
            permissive_acknowledged: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Address of the downstream port served to a given worker
    pub fn worker_address(&self, worker_id: usize) -> String {
        format!(
            "{}:{}",
            self.downstream_host,
            self.base_port as usize + worker_id
        )
    }

    pub fn channel_set(&self) -> ActiveChannelSet {
        ActiveChannelSet::from_mask(self.channel_mask)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Refuse to start on a build or configuration that cannot guarantee integrity
    pub fn startup_checks(&self) -> Result<(), ConfigError> {
        if cfg!(feature = "skip-crc") {
            return Err(ConfigError::CrcCheckDisabled);
        }
        if cfg!(feature = "permissive") {
            if !self.permissive_acknowledged {
                return Err(ConfigError::PermissiveNotAcknowledged);
            }
            spdlog::warn!("Permissive build: DMA and event magic failures are only warnings");
        }
        if self.n_workers < 1 {
            return Err(ConfigError::InvalidWorkers(self.n_workers));
        }
        if self.channel_set().is_empty() {
            return Err(ConfigError::EmptyChannelMask);
        }
        if self.event_stride == 0 {
            return Err(ConfigError::ZeroStride);
        }
        Ok(())
    }
}
