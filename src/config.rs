// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration, read from `~/.config/binc-peripheral/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::bluetooth::agent::{IoCapability, DEFAULT_AGENT_PATH, DEFAULT_PIN_CODE};
use crate::peripheral::DEFAULT_PASSWORD;

const APP_DIR: &str = "binc-peripheral";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter name such as `hci0`; the default adapter when unset.
    pub adapter: Option<String>,

    /// Name advertised to centrals.
    pub local_name: String,

    /// Object path of the pairing agent.
    pub agent_path: String,

    pub io_capability: IoCapability,

    /// PIN answered to legacy pairing requests.
    pub pin_code: String,

    /// 24-bit password expected on the password characteristic.
    pub password: u32,

    /// Shut down after this many seconds. Zero runs until interrupted.
    pub shutdown_after_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Where the trusted-device list is kept.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter: None,
            local_name: "iWave-BLE".to_string(),
            agent_path: DEFAULT_AGENT_PATH.to_string(),
            io_capability: IoCapability::KeyboardDisplay,
            pin_code: DEFAULT_PIN_CODE.to_string(),
            password: DEFAULT_PASSWORD,
            shutdown_after_secs: 600,
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn config_file() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join(APP_DIR)
            .join("config.toml"))
    }

    /// Load `path`, or the default location when `None`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_file()?,
        };

        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if config.password > 0x00FF_FFFF {
            anyhow::bail!("password 0x{:x} does not fit in 3 bytes", config.password);
        }
        Ok(config)
    }

    /// Directory for persisted data.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_local_dir()
                .context("Failed to determine data directory")?
                .join(APP_DIR)),
        }
    }
}
