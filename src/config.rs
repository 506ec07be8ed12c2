//! Configuration management for the ASHA service.
//!
//! This module handles loading and saving configuration from disk,
//! including channel parameters, request timeouts and ignored devices.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   asha::{
      protocol::{DEFAULT_AUDIO_MTU, StartParams},
      transport::TransportSettings,
   },
   error::{AshaError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// SDU size requested for the audio channel.
   #[serde(default = "default_audio_mtu")]
   pub audio_mtu: u16,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_control_point_timeout")]
   pub control_point_timeout_ms: u64,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval_sec: u64,

   /// Volume sent with every start command.
   #[serde(default = "default_volume")]
   pub volume: i8,

   /// Addresses never picked up, even when they expose ASHA.
   #[serde(default)]
   pub ignored_devices: Vec<String>,
}

const fn default_audio_mtu() -> u16 {
   DEFAULT_AUDIO_MTU
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_control_point_timeout() -> u64 {
   5_000
}

const fn default_health_check_interval() -> u64 {
   5
}

const fn default_volume() -> i8 {
   -64
}

impl Default for Config {
   fn default() -> Self {
      Self {
         audio_mtu: default_audio_mtu(),
         connect_timeout_ms: default_connect_timeout(),
         control_point_timeout_ms: default_control_point_timeout(),
         health_check_interval_sec: default_health_check_interval(),
         volume: default_volume(),
         ignored_devices: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to `path`.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(ashad_home) = env::var("ASHAD_HOME") {
         PathBuf::from(ashad_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(AshaError::ConfigDirNotFound);
      };

      Ok(config_dir.join("ashad").join("config.toml"))
   }

   pub fn is_ignored(&self, address: &str) -> bool {
      self
         .ignored_devices
         .iter()
         .any(|d| d.eq_ignore_ascii_case(address))
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   /// At least one second.
   pub fn health_check_interval(&self) -> Duration {
      Duration::from_secs(self.health_check_interval_sec.max(1))
   }

   pub fn transport_settings(&self) -> TransportSettings {
      TransportSettings {
         mtu: self.audio_mtu,
         control_point_timeout: Duration::from_millis(self.control_point_timeout_ms),
         start: StartParams {
            volume: self.volume,
            ..StartParams::default()
         },
      }
   }
}
