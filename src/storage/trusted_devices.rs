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

//! Trusted central storage backing the pairing authorization policy.
//!
//! Centrals are identified by Bluetooth address. Once a central has bonded
//! it is recorded here, and later authorization requests from it are
//! accepted without asking.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A central allowed to pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedDevice {
    /// Bluetooth address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    /// Name reported by the central, if any.
    pub name: Option<String>,
    /// RFC 3339 timestamp of the first bond.
    pub first_bonded: String,
    /// RFC 3339 timestamp of the most recent bond.
    pub last_bonded: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrustedDevicesFile {
    version: u32,
    devices: Vec<TrustedDevice>,
}

/// Store for managing trusted centrals.
pub struct TrustedDeviceStore {
    file_path: PathBuf,
    devices: Vec<TrustedDevice>,
}

impl TrustedDeviceStore {
    /// Open the store kept in `data_dir/trusted_devices.json`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let file_path = data_dir.join("trusted_devices.json");

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let devices = Self::load(&file_path)?;

        info!(
            "Loaded {} trusted device(s) from {:?}",
            devices.len(),
            file_path
        );

        Ok(Self { file_path, devices })
    }

    pub fn is_trusted(&self, address: &str) -> bool {
        self.devices
            .iter()
            .any(|d| d.address.eq_ignore_ascii_case(address))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[TrustedDevice] {
        &self.devices
    }

    /// Record a bonded central, refreshing its timestamp if already known.
    pub fn add_trusted(&mut self, address: String, name: Option<String>) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        if let Some(device) = self
            .devices
            .iter_mut()
            .find(|d| d.address.eq_ignore_ascii_case(&address))
        {
            if name.is_some() {
                device.name = name;
            }
            device.last_bonded = now;
            debug!("Updated trusted device: {}", address);
        } else {
            self.devices.push(TrustedDevice {
                address: address.clone(),
                name,
                first_bonded: now.clone(),
                last_bonded: now,
            });
            info!("Added new trusted device: {}", address);
        }

        self.save()
    }

    /// Forget a central. Returns whether it was present.
    pub fn remove_trusted(&mut self, address: &str) -> Result<bool> {
        let before = self.devices.len();
        self.devices
            .retain(|d| !d.address.eq_ignore_ascii_case(address));
        if self.devices.len() == before {
            return Ok(false);
        }
        info!("Removed trusted device: {}", address);
        self.save()?;
        Ok(true)
    }

    fn load(path: &Path) -> Result<Vec<TrustedDevice>> {
        if !path.exists() {
            debug!("Trusted devices file doesn't exist, starting with empty list");
            return Ok(Vec::new());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

        let file: TrustedDevicesFile = serde_json::from_str(&content)
            .with_context(|| "Failed to parse trusted_devices.json")?;

        Ok(file.devices)
    }

    fn save(&self) -> Result<()> {
        let file = TrustedDevicesFile {
            version: 1,
            devices: self.devices.clone(),
        };

        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.file_path, content)
            .with_context(|| format!("Failed to write {:?}", self.file_path))?;

        debug!("Saved {} trusted device(s)", self.devices.len());
        Ok(())
    }
}
